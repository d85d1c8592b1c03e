//! TTL lease table.
//!
//! `LeaseID -> LeaseRecord{ttl, granted_at, deadline, attached_keys}`.
//! Keys written with a lease are attached to it; when the lease expires or
//! is revoked its attached keys are deleted by the store.

use super::LeaseId;
use crate::core::time::{remaining_seconds, Tick};
use std::collections::{HashMap, HashSet};

/// A lease record.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    /// Unique lease identifier.
    pub lease_id: LeaseId,

    /// TTL in milliseconds.
    pub ttl_ms: u64,

    /// Tick when the lease was granted.
    pub granted_at: Tick,

    /// Tick when the lease expires unless renewed.
    pub deadline: Tick,

    /// Keys attached to this lease.
    pub attached_keys: HashSet<Vec<u8>>,
}

impl LeaseRecord {
    /// Create a new lease.
    pub fn new(lease_id: LeaseId, ttl_ms: u64, granted_at: Tick) -> Self {
        Self {
            lease_id,
            ttl_ms,
            granted_at,
            deadline: granted_at.add_ms(ttl_ms),
            attached_keys: HashSet::new(),
        }
    }

    /// Check if the lease has expired at the given tick.
    pub fn is_expired_at(&self, tick: Tick) -> bool {
        tick.is_at_or_after(self.deadline)
    }

    /// Remaining TTL in whole seconds at the given tick.
    pub fn remaining_seconds_at(&self, tick: Tick) -> i64 {
        remaining_seconds(tick, self.deadline)
    }

    /// Extend the deadline by a full TTL from `now`.
    pub fn keepalive(&mut self, now: Tick) {
        self.deadline = now.add_ms(self.ttl_ms);
    }
}

/// Lease table.
#[derive(Debug)]
pub struct LeaseTable {
    /// Active leases indexed by lease ID.
    leases: HashMap<LeaseId, LeaseRecord>,

    /// Next lease ID for auto-generation.
    next_lease_id: LeaseId,
}

impl LeaseTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            leases: HashMap::new(),
            next_lease_id: 1,
        }
    }

    /// Number of active leases.
    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }

    /// Get a lease that has not expired at `now`.
    pub fn get_live(&self, lease_id: LeaseId, now: Tick) -> Option<&LeaseRecord> {
        self.leases
            .get(&lease_id)
            .filter(|l| !l.is_expired_at(now))
    }

    /// Grant a new lease and return its ID.
    pub fn grant(&mut self, ttl_ms: u64, now: Tick) -> LeaseId {
        let id = self.next_lease_id;
        self.next_lease_id += 1;
        self.leases.insert(id, LeaseRecord::new(id, ttl_ms, now));
        id
    }

    /// Remove a lease, returning it if it existed.
    pub fn revoke(&mut self, lease_id: LeaseId) -> Option<LeaseRecord> {
        self.leases.remove(&lease_id)
    }

    /// Renew a live lease. Returns false if the lease is unknown or expired.
    pub fn keepalive(&mut self, lease_id: LeaseId, now: Tick) -> bool {
        match self.leases.get_mut(&lease_id) {
            Some(lease) if !lease.is_expired_at(now) => {
                lease.keepalive(now);
                true
            }
            _ => false,
        }
    }

    /// Attach a key to a lease.
    pub fn attach_key(&mut self, lease_id: LeaseId, key: Vec<u8>) -> bool {
        match self.leases.get_mut(&lease_id) {
            Some(lease) => {
                lease.attached_keys.insert(key);
                true
            }
            None => false,
        }
    }

    /// Detach a key from a lease.
    pub fn detach_key(&mut self, lease_id: LeaseId, key: &[u8]) -> bool {
        self.leases
            .get_mut(&lease_id)
            .is_some_and(|lease| lease.attached_keys.remove(key))
    }

    /// IDs of leases expired at `now` (not removed).
    pub fn collect_expired(&self, now: Tick) -> Vec<LeaseId> {
        let mut ids: Vec<LeaseId> = self
            .leases
            .values()
            .filter(|lease| lease.is_expired_at(now))
            .map(|lease| lease.lease_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Earliest deadline among active leases.
    pub fn next_deadline(&self) -> Option<Tick> {
        self.leases.values().map(|l| l.deadline).min()
    }
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_assigns_sequential_ids() {
        let mut table = LeaseTable::new();
        assert_eq!(table.grant(1_000, Tick::zero()), 1);
        assert_eq!(table.grant(1_000, Tick::zero()), 2);
        assert_eq!(table.lease_count(), 2);
    }

    #[test]
    fn test_expiry_and_remaining() {
        let mut table = LeaseTable::new();
        let id = table.grant(10_000, Tick::new(1_000));

        let lease = table.get_live(id, Tick::new(1_500)).unwrap();
        assert_eq!(lease.remaining_seconds_at(Tick::new(1_500)), 10);

        assert!(table.get_live(id, Tick::new(11_000)).is_none());
        assert_eq!(table.collect_expired(Tick::new(11_000)), vec![id]);
        assert!(table.collect_expired(Tick::new(10_999)).is_empty());
    }

    #[test]
    fn test_keepalive_extends_deadline() {
        let mut table = LeaseTable::new();
        let id = table.grant(5_000, Tick::zero());
        assert!(table.keepalive(id, Tick::new(4_000)));
        assert!(table.get_live(id, Tick::new(8_000)).is_some());
        assert!(!table.keepalive(id, Tick::new(9_000)));
    }

    #[test]
    fn test_attach_detach() {
        let mut table = LeaseTable::new();
        let id = table.grant(5_000, Tick::zero());
        assert!(table.attach_key(id, b"k".to_vec()));
        assert!(table.detach_key(id, b"k"));
        assert!(!table.detach_key(id, b"k"));
        assert!(!table.attach_key(99, b"k".to_vec()));
    }
}
