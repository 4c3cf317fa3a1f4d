// Last-known-state cache for joining clients.
//
// Every sync pack that passes through the relay is offered to the cache.
// For each `(kind, entity id)` the cache keeps the entry with the highest
// sequence number ever seen; an update with an equal or lower sequence is
// dropped, no matter when it arrives. A `hey` from a new client is answered
// with a copy of the whole cache.
//
// Retention can be switched off in `RelayConfig`; the cache then ignores
// updates and always snapshots as empty (every kind present, no entities).

use vred_protocol::{CachedEntry, StateSnapshot, SyncEntry, SyncKind};

pub struct StateCache {
    retain: bool,
    latest: StateSnapshot,
}

impl StateCache {
    pub fn new(retain: bool) -> Self {
        Self {
            retain,
            latest: StateSnapshot::new(),
        }
    }

    /// Apply a sync pack. Returns how many entries replaced stored state.
    pub fn update(&mut self, kind: SyncKind, entries: &[SyncEntry]) -> usize {
        if !self.retain {
            return 0;
        }
        let bucket = self.latest.entities_mut(kind);
        let mut applied = 0;
        for entry in entries {
            let newer = bucket
                .get(&entry.entity_id)
                .is_none_or(|stored| stored.sequence < entry.sequence);
            if newer {
                bucket.insert(
                    entry.entity_id.clone(),
                    CachedEntry {
                        sequence: entry.sequence,
                        payload: entry.payload.clone(),
                    },
                );
                applied += 1;
            }
        }
        applied
    }

    /// Point-in-time copy of everything stored.
    pub fn snapshot(&self) -> StateSnapshot {
        self.latest.clone()
    }

    pub fn get(&self, kind: SyncKind, entity_id: &str) -> Option<&CachedEntry> {
        self.latest.get(kind, entity_id)
    }

    /// Number of entities stored across all kinds.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use vred_protocol::{Payload, Sequence};

    use super::*;

    fn pos(id: &str, seq: i64, x: i32) -> SyncEntry {
        SyncEntry::new(id, seq, Payload::vector(x, 0, 0))
    }

    #[test]
    fn keeps_highest_sequence_in_order() {
        let mut cache = StateCache::new(true);
        assert_eq!(cache.update(SyncKind::Pos, &[pos("a", 1, 10)]), 1);
        assert_eq!(cache.update(SyncKind::Pos, &[pos("a", 2, 20)]), 1);

        let stored = cache.get(SyncKind::Pos, "a").unwrap();
        assert_eq!(stored.sequence, Sequence(2));
        assert_eq!(stored.payload, Payload::vector(20, 0, 0));
    }

    #[test]
    fn late_lower_sequence_is_discarded() {
        let mut cache = StateCache::new(true);
        cache.update(SyncKind::Pos, &[pos("a", 5, 50)]);
        assert_eq!(cache.update(SyncKind::Pos, &[pos("a", 3, 30)]), 0);

        let stored = cache.get(SyncKind::Pos, "a").unwrap();
        assert_eq!(stored.sequence, Sequence(5));
        assert_eq!(stored.payload, Payload::vector(50, 0, 0));
    }

    #[test]
    fn equal_sequence_does_not_replace() {
        let mut cache = StateCache::new(true);
        cache.update(SyncKind::Rot, &[pos("a", 5, 1)]);
        assert_eq!(cache.update(SyncKind::Rot, &[pos("a", 5, 2)]), 0);
        assert_eq!(
            cache.get(SyncKind::Rot, "a").unwrap().payload,
            Payload::vector(1, 0, 0)
        );
    }

    #[test]
    fn kinds_are_separate_buckets() {
        let mut cache = StateCache::new(true);
        cache.update(SyncKind::Pos, &[pos("a", 9, 1)]);
        cache.update(SyncKind::Scale, &[pos("a", 1, 2)]);
        cache.update(
            SyncKind::State,
            &[SyncEntry::new("a", 1, Payload::Flag(false))],
        );

        assert_eq!(cache.get(SyncKind::Pos, "a").unwrap().sequence, Sequence(9));
        assert_eq!(cache.get(SyncKind::Scale, "a").unwrap().sequence, Sequence(1));
        assert!(cache.get(SyncKind::Rot, "a").is_none());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn mixed_pack_applies_per_entry() {
        let mut cache = StateCache::new(true);
        cache.update(SyncKind::Pos, &[pos("a", 10, 1), pos("b", 10, 1)]);
        let applied = cache.update(
            SyncKind::Pos,
            &[pos("a", 9, 2), pos("b", 11, 2), pos("c", 0, 2)],
        );
        assert_eq!(applied, 2);
        assert_eq!(cache.get(SyncKind::Pos, "a").unwrap().sequence, Sequence(10));
        assert_eq!(cache.get(SyncKind::Pos, "b").unwrap().sequence, Sequence(11));
        assert_eq!(cache.get(SyncKind::Pos, "c").unwrap().sequence, Sequence(0));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut cache = StateCache::new(true);
        cache.update(SyncKind::Pos, &[pos("a", 1, 1)]);
        let snapshot = cache.snapshot();
        cache.update(SyncKind::Pos, &[pos("a", 2, 2)]);

        assert_eq!(
            snapshot.get(SyncKind::Pos, "a").unwrap().sequence,
            Sequence(1)
        );
    }

    #[test]
    fn retention_disabled_stores_nothing() {
        let mut cache = StateCache::new(false);
        assert_eq!(cache.update(SyncKind::Pos, &[pos("a", 1, 1)]), 0);
        assert!(cache.is_empty());

        let snapshot = cache.snapshot();
        for kind in SyncKind::ALL {
            assert!(snapshot.entities(kind).is_empty());
        }
        assert_eq!(snapshot.iter().count(), 4);
    }
}
