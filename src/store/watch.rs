//! Watch ranges and change-event batches.
//!
//! A watch covers either one key or every key under a prefix. The store
//! delivers changes as batches; each batch carries the revision it was
//! committed at and the events of that revision that fall in the range.

use super::{KeyValue, LeaseId};
use crate::subnet::Revision;
use serde::{Deserialize, Serialize};

/// Key range covered by a watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchRange {
    /// Exactly one key.
    Key(Vec<u8>),
    /// Every key starting with the prefix.
    Prefix(Vec<u8>),
}

impl WatchRange {
    /// Watch a single key.
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self::Key(key.into())
    }

    /// Watch a prefix.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Check if this range covers a key.
    pub fn matches_key(&self, key: &[u8]) -> bool {
        match self {
            Self::Key(k) => key == k.as_slice(),
            Self::Prefix(p) => key.starts_with(p),
        }
    }
}

/// Type of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Key was created or updated.
    Put,
    /// Key was deleted (explicitly or by lease expiry).
    Delete,
}

/// One change to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Type of change.
    pub kind: EventType,
    /// Key after a put; for deletes only `key` and `mod_revision` are meaningful.
    pub kv: KeyValue,
}

impl WatchEvent {
    /// A put event carrying the new pair.
    pub fn put(kv: KeyValue) -> Self {
        Self {
            kind: EventType::Put,
            kv,
        }
    }

    /// A delete event for `key` at `revision`.
    pub fn delete(key: Vec<u8>, revision: Revision) -> Self {
        Self {
            kind: EventType::Delete,
            kv: KeyValue {
                key,
                value: Vec::new(),
                create_revision: 0,
                mod_revision: revision,
                version: 0,
                lease: None,
            },
        }
    }

    /// The changed key.
    pub fn key(&self) -> &[u8] {
        &self.kv.key
    }

    /// The stored value (empty for deletes).
    pub fn value(&self) -> &[u8] {
        &self.kv.value
    }

    /// The lease bound to the new value, if any.
    pub fn lease(&self) -> Option<LeaseId> {
        self.kv.lease
    }
}

/// Events committed at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchBatch {
    /// Revision of the batch.
    pub revision: Revision,
    /// Events in commit order.
    pub events: Vec<WatchEvent>,
}

impl WatchBatch {
    /// Check if the batch carries no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Split events in commit order into one batch per revision.
    ///
    /// Stores that deliver several revisions in one response use this to
    /// present them the way [`WatchBatch`] consumers expect.
    pub fn group_by_revision(events: impl IntoIterator<Item = WatchEvent>) -> Vec<WatchBatch> {
        let mut batches: Vec<WatchBatch> = Vec::new();
        for event in events {
            let revision = event.kv.mod_revision;
            match batches.last_mut() {
                Some(batch) if batch.revision == revision => batch.events.push(event),
                _ => batches.push(WatchBatch {
                    revision,
                    events: vec![event],
                }),
            }
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_range_matches_exactly() {
        let range = WatchRange::key(b"/a/b".to_vec());
        assert!(range.matches_key(b"/a/b"));
        assert!(!range.matches_key(b"/a/bc"));
        assert!(!range.matches_key(b"/a"));
    }

    #[test]
    fn test_prefix_range() {
        let range = WatchRange::prefix(b"/net/subnets/".to_vec());
        assert!(range.matches_key(b"/net/subnets/10.0.0.0-24"));
        assert!(!range.matches_key(b"/net/config"));
    }

    #[test]
    fn test_delete_event_shape() {
        let ev = WatchEvent::delete(b"/k".to_vec(), 9);
        assert_eq!(ev.kind, EventType::Delete);
        assert!(ev.value().is_empty());
        assert_eq!(ev.lease(), None);
        assert_eq!(ev.kv.mod_revision, 9);
    }

    #[test]
    fn test_group_by_revision() {
        let put = |key: &[u8], revision| {
            WatchEvent::put(KeyValue {
                key: key.to_vec(),
                value: b"v".to_vec(),
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease: None,
            })
        };
        let batches = WatchBatch::group_by_revision(vec![
            put(b"/a", 4),
            WatchEvent::delete(b"/b".to_vec(), 4),
            put(b"/c", 5),
        ]);

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].revision, 4);
        assert_eq!(batches[0].events.len(), 2);
        assert_eq!(batches[0].events[1].kind, EventType::Delete);
        assert_eq!(batches[1].revision, 5);
        assert!(WatchBatch::group_by_revision(Vec::new()).is_empty());
    }
}
