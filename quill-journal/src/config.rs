//! Journal configuration.
//!
//! An explicit, validated configuration struct with named fields and
//! documented defaults. Properties arriving as key/value pairs (the
//! operator-facing surface) are bound to fields explicitly; unknown keys
//! are reported, never silently ignored.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::warn;

use crate::error::{JournalError, JournalResult};

/// Default segment file size (32 MB).
pub const SEGMENT_SIZE_BYTES_DEFAULT: u64 = 32 * 1024 * 1024;

/// Minimum allowed segment file size (64 KB).
pub const SEGMENT_SIZE_BYTES_MIN: u64 = 64 * 1024;

/// Maximum allowed segment file size (1 GB).
pub const SEGMENT_SIZE_BYTES_MAX: u64 = 1024 * 1024 * 1024;

/// Configuration for a journal.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory for segment files.
    pub dir: PathBuf,
    /// Segment rotation threshold in bytes. A segment is rotated once its
    /// size reaches this value; records are never split across segments,
    /// so actual files may exceed it by up to one record.
    pub segment_size_bytes: u64,
}

impl JournalConfig {
    /// Creates a configuration with default tuning.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size_bytes: SEGMENT_SIZE_BYTES_DEFAULT,
        }
    }

    /// Sets the segment rotation threshold.
    #[must_use]
    pub const fn with_segment_size(mut self, bytes: u64) -> Self {
        self.segment_size_bytes = bytes;
        self
    }

    /// Builds a configuration from operator-supplied properties.
    ///
    /// Recognized keys: `journal.dir`, `journal.segment_size_bytes`.
    /// Unknown keys are reported with a warning and left unapplied.
    ///
    /// # Errors
    /// Returns an error if a recognized value does not parse or fails
    /// validation.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> JournalResult<Self> {
        let mut config = Self::new(".");

        for (key, value) in properties {
            match key.as_str() {
                "journal.dir" => config.dir = PathBuf::from(value),
                "journal.segment_size_bytes" => {
                    config.segment_size_bytes = value
                        .parse()
                        .map_err(|e| JournalError::io("parse segment_size_bytes", e))?;
                }
                _ => warn!(key, "Unknown journal property, ignoring"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns an error if the segment size is out of range.
    pub fn validate(&self) -> JournalResult<()> {
        if self.segment_size_bytes < SEGMENT_SIZE_BYTES_MIN
            || self.segment_size_bytes > SEGMENT_SIZE_BYTES_MAX
        {
            return Err(JournalError::Io {
                operation: "config",
                message: format!(
                    "segment_size_bytes {} outside [{SEGMENT_SIZE_BYTES_MIN}, {SEGMENT_SIZE_BYTES_MAX}]",
                    self.segment_size_bytes
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JournalConfig::new("/tmp/journal");
        assert_eq!(config.segment_size_bytes, SEGMENT_SIZE_BYTES_DEFAULT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_properties() {
        let mut props = BTreeMap::new();
        props.insert("journal.dir".to_string(), "/data/quill".to_string());
        props.insert(
            "journal.segment_size_bytes".to_string(),
            "1048576".to_string(),
        );
        props.insert("storage.unknown_knob".to_string(), "whatever".to_string());

        let config = JournalConfig::from_properties(&props).unwrap();
        assert_eq!(config.dir, PathBuf::from("/data/quill"));
        assert_eq!(config.segment_size_bytes, 1_048_576);
    }

    #[test]
    fn test_segment_size_out_of_range() {
        let config = JournalConfig::new("/tmp").with_segment_size(1);
        assert!(config.validate().is_err());
    }
}
