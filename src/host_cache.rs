//! # Host Cache
//!
//! Process-wide keyed store of [`HostTracker`] objects, keyed by
//! (IP, address-space-id). Other components hold long-lived `Arc`
//! references into the cache, so retirement is by epoch bump rather than
//! deletion: [`HostCache::invalidate_all`] advances the valid id, and every
//! tracker whose recorded visibility no longer matches is observably
//! retired while outstanding references stay safe to hold.
//!
//! Capacity is bounded; when full, the least recently seen host is pruned
//! to make room.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::host_tracker::HostTracker;

/// Cache key: host address plus the address space it was observed in.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct HostKey {
    pub ip: IpAddr,
    pub asid: u16,
}

/// Bounded, concurrently accessed store of host trackers.
pub struct HostCache {
    hosts: DashMap<HostKey, Arc<HostTracker>>,
    valid_id: AtomicU64,
    max_hosts: usize,
}

impl HostCache {
    /// Create a cache holding at most `max_hosts` trackers.
    pub fn new(max_hosts: usize) -> Self {
        Self { hosts: DashMap::new(), valid_id: AtomicU64::new(1), max_hosts }
    }

    /// The current valid-id epoch. A tracker is live iff its stored
    /// visibility equals this value.
    ///
    /// Callers needing both the epoch and a tracker's lock must sample the
    /// epoch first; the lock order is cache before tracker.
    pub fn valid_id(&self) -> u64 {
        self.valid_id.load(Ordering::Acquire)
    }

    /// Retire every tracker by advancing the epoch. Returns the new valid
    /// id. Tracker objects are untouched; readers observe the mismatch and
    /// treat them as absent.
    pub fn invalidate_all(&self) -> u64 {
        let id = self.valid_id.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(valid_id = id, "host cache invalidated");
        id
    }

    /// Look up a live tracker. A present-but-retired tracker is treated as
    /// absent.
    pub fn find(&self, key: &HostKey) -> Option<Arc<HostTracker>> {
        let epoch = self.valid_id();
        let tracker = self.hosts.get(key).map(|t| t.clone())?;
        tracker.is_visible(epoch).then_some(tracker)
    }

    /// Find or create the tracker for a host.
    ///
    /// A present-but-retired tracker is brought back live with fresh
    /// (empty) visible state. Returns the tracker and whether this counts
    /// as a new discovery.
    pub fn find_else_create(&self, key: HostKey, now: u32) -> (Arc<HostTracker>, bool) {
        let epoch = self.valid_id();

        if let Some(tracker) = self.hosts.get(&key).map(|t| t.clone()) {
            if tracker.is_visible(epoch) {
                return (tracker, false);
            }
            // a retired tracker comes back empty: the invisible pass
            // cascades the stale visible state away first
            tracker.set_visibility(false, epoch);
            tracker.set_visibility(true, epoch);
            tracker.update_last_seen(now);
            return (tracker, true);
        }

        if self.hosts.len() >= self.max_hosts {
            self.prune_one();
        }

        let tracker = Arc::new(HostTracker::new(epoch, now));
        self.hosts.insert(key, tracker.clone());
        (tracker, true)
    }

    /// Set a tracker's visibility, sampling the epoch outside its lock.
    pub fn set_host_visibility(&self, tracker: &HostTracker, v: bool) -> bool {
        let epoch = self.valid_id();
        tracker.set_visibility(v, epoch)
    }

    /// Remove the least recently seen host to reclaim a slot.
    fn prune_one(&self) {
        let mut oldest: Option<(HostKey, u32)> = None;
        for entry in self.hosts.iter() {
            let seen = entry.value().last_seen();
            if oldest.map_or(true, |(_, t)| seen < t) {
                oldest = Some((*entry.key(), seen));
            }
        }
        if let Some((key, _)) = oldest {
            self.hosts.remove(&key);
            tracing::debug!(ip = %key.ip, "pruned host tracker");
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::IP_PROTO_TCP;

    fn key(last_octet: u8) -> HostKey {
        HostKey { ip: IpAddr::from([10, 0, 0, last_octet]), asid: 0 }
    }

    #[test]
    fn test_find_else_create() {
        let cache = HostCache::new(16);
        let (t1, is_new) = cache.find_else_create(key(1), 100);
        assert!(is_new);
        let (t2, is_new) = cache.find_else_create(key(1), 101);
        assert!(!is_new);
        assert!(Arc::ptr_eq(&t1, &t2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_epoch_retirement() {
        let cache = HostCache::new(16);
        let (tracker, _) = cache.find_else_create(key(1), 100);
        tracker.add_service(80, IP_PROTO_TCP, 676, false);
        assert!(cache.find(&key(1)).is_some());

        cache.invalidate_all();

        // the object is still in the map, but observably retired
        assert!(!tracker.is_visible(cache.valid_id()));
        assert!(cache.find(&key(1)).is_none());

        // re-creation revives the same tracker at the new epoch
        let (revived, is_new) = cache.find_else_create(key(1), 200);
        assert!(is_new);
        assert!(Arc::ptr_eq(&tracker, &revived));
        assert!(revived.is_visible(cache.valid_id()));
    }

    #[test]
    fn test_set_host_visibility_clears_state() {
        let cache = HostCache::new(16);
        let (tracker, _) = cache.find_else_create(key(1), 100);
        tracker.add_service(80, IP_PROTO_TCP, 676, false);

        assert!(!cache.set_host_visibility(&tracker, false));
        assert_eq!(tracker.get_service_count(), 0);
        assert!(cache.find(&key(1)).is_none());

        assert!(!cache.set_host_visibility(&tracker, true));
        assert!(cache.find(&key(1)).is_some());
    }

    #[test]
    fn test_prune_least_recently_seen() {
        let cache = HostCache::new(2);
        cache.find_else_create(key(1), 100);
        cache.find_else_create(key(2), 200);
        cache.find_else_create(key(3), 300);
        assert_eq!(cache.len(), 2);
        assert!(cache.find(&key(1)).is_none());
        assert!(cache.find(&key(3)).is_some());
    }
}
