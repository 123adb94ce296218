//! Strongly-typed identifiers for Quill entities.
//!
//! Explicit newtypes prevent bugs from mixing up IDs; all are 64-bit
//! except partitions, which the wire format bounds to 32 bits.

use std::fmt;

/// Macro to generate strongly-typed u64 wrappers.
///
/// Each generated type provides type safety (a `NodeId` is not a
/// `TermId`), Debug/Display formatting, and zero-cost conversion to and
/// from the raw value.
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next value in sequence.
            ///
            /// # Panics
            /// Panics on overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(NodeId, "node", "Unique identifier for a node in the cluster.");
define_id!(TermId, "term", "Raft election epoch; strictly increasing.");
define_id!(LogIndex, "idx", "Index into the replicated log (1-based, gapless).");
define_id!(Position, "pos", "Byte position in the journal.");
define_id!(RequestId, "req", "Correlates an RPC response to its request.");

/// Identifier for a journal partition.
///
/// Partitions are a client-facing namespace over the single replicated
/// log; the wire format carries them as u32.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PartitionId(u32);

impl PartitionId {
    /// Creates a new partition ID.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition({})", self.0)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}
