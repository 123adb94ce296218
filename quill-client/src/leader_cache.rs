//! Leader cache - remembers the cluster's last known leader.
//!
//! Caching the leader avoids a discovery round on every request. Entries
//! expire after a TTL so a stale hint cannot steer requests forever; a
//! redirect or a transport failure invalidates the entry immediately.

use std::time::{Duration, Instant};

use quill_core::NodeId;

/// Default TTL for a cached leader (5 seconds).
pub const LEADER_TTL_DEFAULT: Duration = Duration::from_secs(5);

/// Cache of the last known leader.
///
/// Time is injected by the caller so expiry is testable without sleeping.
#[derive(Debug)]
pub struct LeaderCache {
    ttl: Duration,
    entry: Option<(NodeId, Instant)>,
}

impl LeaderCache {
    /// Creates a cache with the given TTL.
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    /// Creates a cache with the default TTL.
    #[must_use]
    pub const fn with_defaults() -> Self {
        Self::new(LEADER_TTL_DEFAULT)
    }

    /// Returns the cached leader if the entry has not expired.
    #[must_use]
    pub fn get(&self, now: Instant) -> Option<NodeId> {
        self.entry.and_then(|(leader, updated_at)| {
            if now.saturating_duration_since(updated_at) <= self.ttl {
                Some(leader)
            } else {
                None
            }
        })
    }

    /// Records a confirmed or hinted leader.
    pub fn update(&mut self, leader: NodeId, now: Instant) {
        self.entry = Some((leader, now));
    }

    /// Drops the cached leader after a redirect or a failed request.
    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cache_misses() {
        let cache = LeaderCache::with_defaults();
        assert_eq!(cache.get(Instant::now()), None);
    }

    #[test]
    fn test_entry_expires_after_ttl() {
        let mut cache = LeaderCache::new(Duration::from_millis(100));
        let t0 = Instant::now();
        cache.update(NodeId::new(2), t0);

        assert_eq!(cache.get(t0 + Duration::from_millis(50)), Some(NodeId::new(2)));
        assert_eq!(cache.get(t0 + Duration::from_millis(150)), None);
    }

    #[test]
    fn test_invalidate_clears_entry() {
        let mut cache = LeaderCache::with_defaults();
        let now = Instant::now();
        cache.update(NodeId::new(3), now);
        cache.invalidate();
        assert_eq!(cache.get(now), None);
    }

    #[test]
    fn test_update_refreshes_age() {
        let mut cache = LeaderCache::new(Duration::from_millis(100));
        let t0 = Instant::now();
        cache.update(NodeId::new(1), t0);
        cache.update(NodeId::new(1), t0 + Duration::from_millis(90));
        assert_eq!(
            cache.get(t0 + Duration::from_millis(150)),
            Some(NodeId::new(1))
        );
    }
}
