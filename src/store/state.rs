//! MVCC key index.
//!
//! Keeps the current value of every key plus a per-revision history used
//! to replay changes to watchers. Every successful put or delete commits at
//! its own revision; deleting an absent key commits nothing.

use super::watch::{WatchBatch, WatchEvent, WatchRange};
use super::{KeyValue, LeaseId, StoreError};
use crate::subnet::Revision;
use std::collections::BTreeMap;

/// A record in the key index.
#[derive(Debug, Clone)]
pub struct KvRecord {
    /// The key.
    pub key: Vec<u8>,

    /// The value.
    pub value: Vec<u8>,

    /// Revision when this key was created.
    pub create_revision: Revision,

    /// Revision of the last modification.
    pub mod_revision: Revision,

    /// Version counter, increments on each mutation.
    pub version: u64,

    /// Associated lease ID (if any).
    pub lease_id: Option<LeaseId>,

    /// Tombstone marker.
    pub deleted: bool,
}

impl KvRecord {
    fn to_key_value(&self) -> KeyValue {
        KeyValue {
            key: self.key.clone(),
            value: self.value.clone(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
            lease: self.lease_id,
        }
    }
}

/// MVCC key index with revision history.
#[derive(Debug, Default)]
pub struct KvState {
    /// Current revision.
    current_revision: Revision,

    /// Key -> current record (tombstones included).
    index: BTreeMap<Vec<u8>, KvRecord>,

    /// Revision -> record committed at that revision.
    history: BTreeMap<Revision, KvRecord>,

    /// History below this revision is discarded.
    compaction_floor: Revision,

    /// Live (non-deleted) keys.
    live_key_count: usize,
}

impl KvState {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current revision.
    pub fn current_revision(&self) -> Revision {
        self.current_revision
    }

    /// Get the compaction floor.
    pub fn compaction_floor(&self) -> Revision {
        self.compaction_floor
    }

    /// Number of live keys.
    pub fn live_key_count(&self) -> usize {
        self.live_key_count
    }

    /// Get a key's current record.
    pub fn get(&self, key: &[u8]) -> Option<&KvRecord> {
        self.index.get(key).filter(|r| !r.deleted)
    }

    /// Get a key's current pair.
    pub fn get_kv(&self, key: &[u8]) -> Option<KeyValue> {
        self.get(key).map(KvRecord::to_key_value)
    }

    /// Every live pair under `prefix`, sorted by key.
    pub fn prefix(&self, prefix: &[u8]) -> Vec<KeyValue> {
        self.index
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, r)| !r.deleted)
            .map(|(_, r)| r.to_key_value())
            .collect()
    }

    /// Put a key-value pair.
    ///
    /// Returns the new revision and the previous live record, if any.
    pub fn put(
        &mut self,
        key: Vec<u8>,
        value: Vec<u8>,
        lease_id: Option<LeaseId>,
    ) -> (Revision, Option<KvRecord>) {
        let revision = self.current_revision + 1;
        self.current_revision = revision;

        let prev = self.index.get(&key).filter(|p| !p.deleted).cloned();
        let (create_revision, version) = match &prev {
            Some(p) => (p.create_revision, p.version + 1),
            None => {
                self.live_key_count += 1;
                (revision, 1)
            }
        };

        let record = KvRecord {
            key: key.clone(),
            value,
            create_revision,
            mod_revision: revision,
            version,
            lease_id,
            deleted: false,
        };
        self.history.insert(revision, record.clone());
        self.index.insert(key, record);

        (revision, prev)
    }

    /// Delete a key.
    ///
    /// Returns the new revision and the deleted record, or `None` if the key
    /// was absent (no revision is consumed).
    pub fn delete(&mut self, key: &[u8]) -> Option<(Revision, KvRecord)> {
        let prev = self.get(key)?.clone();

        let revision = self.current_revision + 1;
        self.current_revision = revision;

        let mut tombstone = prev.clone();
        tombstone.mod_revision = revision;
        tombstone.value.clear();
        tombstone.lease_id = None;
        tombstone.deleted = true;

        self.history.insert(revision, tombstone.clone());
        self.index.insert(key.to_vec(), tombstone);
        self.live_key_count = self.live_key_count.saturating_sub(1);

        Some((revision, prev))
    }

    /// Changes at or after `start` that fall in `range`, one batch per revision.
    pub fn batches_since(
        &self,
        range: &WatchRange,
        start: Revision,
    ) -> Result<Vec<WatchBatch>, StoreError> {
        if start < self.compaction_floor {
            return Err(StoreError::Compacted {
                revision: start,
                compaction_floor: self.compaction_floor,
            });
        }

        Ok(self
            .history
            .range(start..)
            .filter(|(_, record)| range.matches_key(&record.key))
            .map(|(revision, record)| {
                let event = if record.deleted {
                    WatchEvent::delete(record.key.clone(), *revision)
                } else {
                    WatchEvent::put(record.to_key_value())
                };
                WatchBatch {
                    revision: *revision,
                    events: vec![event],
                }
            })
            .collect())
    }

    /// Compact history below `revision`.
    ///
    /// Returns the number of history entries removed.
    pub fn compact(&mut self, revision: Revision) -> usize {
        if revision <= self.compaction_floor {
            return 0;
        }
        let keep = self.history.split_off(&revision);
        let removed = self.history.len();
        self.history = keep;
        self.index.retain(|_, r| !r.deleted || r.mod_revision >= revision);
        self.compaction_floor = revision;
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::watch::EventType;

    #[test]
    fn test_put_update_preserves_create_revision() {
        let mut state = KvState::new();
        let (r1, prev) = state.put(b"k".to_vec(), b"v1".to_vec(), None);
        assert!(prev.is_none());
        let (r2, prev) = state.put(b"k".to_vec(), b"v2".to_vec(), Some(3));
        assert_eq!(prev.unwrap().value, b"v1");

        let rec = state.get(b"k").unwrap();
        assert_eq!((r1, r2), (1, 2));
        assert_eq!(rec.create_revision, 1);
        assert_eq!(rec.mod_revision, 2);
        assert_eq!(rec.version, 2);
        assert_eq!(rec.lease_id, Some(3));
    }

    #[test]
    fn test_delete_absent_consumes_no_revision() {
        let mut state = KvState::new();
        state.put(b"a".to_vec(), b"1".to_vec(), None);
        assert!(state.delete(b"missing").is_none());
        assert_eq!(state.current_revision(), 1);

        let (rev, prev) = state.delete(b"a").unwrap();
        assert_eq!(rev, 2);
        assert_eq!(prev.value, b"1");
        assert!(state.get(b"a").is_none());
        assert_eq!(state.live_key_count(), 0);
    }

    #[test]
    fn test_prefix_is_sorted_and_bounded() {
        let mut state = KvState::new();
        state.put(b"/p/b".to_vec(), b"2".to_vec(), None);
        state.put(b"/p/a".to_vec(), b"1".to_vec(), None);
        state.put(b"/q/a".to_vec(), b"3".to_vec(), None);
        state.put(b"/p/c".to_vec(), b"4".to_vec(), None);
        state.delete(b"/p/c");

        let kvs = state.prefix(b"/p/");
        let keys: Vec<_> = kvs.iter().map(|kv| kv.key.as_slice()).collect();
        assert_eq!(keys, vec![b"/p/a".as_slice(), b"/p/b".as_slice()]);
    }

    #[test]
    fn test_batches_since_filters_range() {
        let mut state = KvState::new();
        state.put(b"/p/a".to_vec(), b"1".to_vec(), None);
        state.put(b"/q/a".to_vec(), b"2".to_vec(), None);
        state.delete(b"/p/a");

        let batches = state
            .batches_since(&WatchRange::prefix(b"/p/".to_vec()), 1)
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].revision, 1);
        assert_eq!(batches[0].events[0].kind, EventType::Put);
        assert_eq!(batches[1].revision, 3);
        assert_eq!(batches[1].events[0].kind, EventType::Delete);

        let later = state
            .batches_since(&WatchRange::prefix(b"/p/".to_vec()), 2)
            .unwrap();
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn test_compaction() {
        let mut state = KvState::new();
        for i in 0..5u8 {
            state.put(vec![b'k', i], vec![i], None);
        }
        assert_eq!(state.compact(3), 2);
        assert_eq!(state.compaction_floor(), 3);
        assert!(matches!(
            state.batches_since(&WatchRange::prefix(b"k".to_vec()), 2),
            Err(StoreError::Compacted { revision: 2, compaction_floor: 3 })
        ));
        assert_eq!(
            state
                .batches_since(&WatchRange::prefix(b"k".to_vec()), 3)
                .unwrap()
                .len(),
            3
        );
    }
}
