//! Bounded cache of skipped message keys
//!
//! Holds keys derived while walking a receiving chain past counters that
//! have not arrived yet. Capacity is fixed; when full the oldest inserted
//! key is evicted and counted.

use std::collections::{BTreeMap, HashMap};

use crate::{chain::MessageKey, key_exchange::PublicKey};

type Slot = (PublicKey, u32);

/// Insertion-ordered, capacity-bounded map from `(ratchet key, counter)` to
/// message key.
#[derive(Debug)]
pub struct SkippedKeys {
    capacity: usize,
    entries: HashMap<Slot, (u64, MessageKey)>,
    order: BTreeMap<u64, Slot>,
    next_sequence: u64,
    evicted: u64,
}

impl SkippedKeys {
    /// Create an empty cache holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_sequence: 0,
            evicted: 0,
        }
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no keys are cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total keys evicted because the cache was full.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// True if a key for this slot is cached.
    pub fn contains(&self, ratchet_key: &PublicKey, counter: u32) -> bool {
        self.entries.contains_key(&(*ratchet_key, counter))
    }

    /// Look up a key without consuming it.
    pub fn get(&self, ratchet_key: &PublicKey, counter: u32) -> Option<&MessageKey> {
        self.entries.get(&(*ratchet_key, counter)).map(|(_, key)| key)
    }

    /// Remove and return a key.
    pub fn take(&mut self, ratchet_key: &PublicKey, counter: u32) -> Option<MessageKey> {
        let (sequence, key) = self.entries.remove(&(*ratchet_key, counter))?;
        self.order.remove(&sequence);
        Some(key)
    }

    /// Insert a key, evicting the oldest entries while over capacity.
    pub fn insert(&mut self, ratchet_key: PublicKey, key: MessageKey) {
        if self.capacity == 0 {
            self.evicted += 1;
            return;
        }

        let slot = (ratchet_key, key.counter());
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if let Some((old_sequence, _)) = self.entries.insert(slot, (sequence, key)) {
            self.order.remove(&old_sequence);
        }
        self.order.insert(sequence, slot);

        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.evicted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainKey;

    fn keys(count: u32) -> Vec<MessageKey> {
        let mut chain = ChainKey::new([3u8; 32]);
        (0..count).map(|_| chain.advance().unwrap()).collect()
    }

    fn ratchet_key(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; 32])
    }

    #[test]
    fn take_consumes_entry() {
        let mut cache = SkippedKeys::new(10);
        let key = keys(1).remove(0);
        cache.insert(ratchet_key(1), key.clone());

        assert_eq!(cache.take(&ratchet_key(1), 0), Some(key));
        assert_eq!(cache.take(&ratchet_key(1), 0), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn slots_are_scoped_by_ratchet_key() {
        let mut cache = SkippedKeys::new(10);
        cache.insert(ratchet_key(1), keys(1).remove(0));

        assert!(cache.contains(&ratchet_key(1), 0));
        assert!(!cache.contains(&ratchet_key(2), 0));
    }

    #[test]
    fn oldest_entries_are_evicted_first() {
        let mut cache = SkippedKeys::new(3);
        for key in keys(5) {
            cache.insert(ratchet_key(1), key);
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.evicted(), 2);
        assert!(!cache.contains(&ratchet_key(1), 0));
        assert!(!cache.contains(&ratchet_key(1), 1));
        assert!(cache.contains(&ratchet_key(1), 2));
        assert!(cache.contains(&ratchet_key(1), 4));
    }

    #[test]
    fn taking_from_the_middle_keeps_order() {
        let mut cache = SkippedKeys::new(3);
        let mut all = keys(4);
        let last = all.pop().unwrap();
        for key in all {
            cache.insert(ratchet_key(1), key);
        }

        cache.take(&ratchet_key(1), 1);
        cache.insert(ratchet_key(2), last);
        assert_eq!(cache.evicted(), 0);

        cache.insert(ratchet_key(2), keys(1).remove(0));
        assert_eq!(cache.evicted(), 1);
        assert!(!cache.contains(&ratchet_key(1), 0), "oldest survivor goes first");
        assert!(cache.contains(&ratchet_key(1), 2));
    }

    #[test]
    fn zero_capacity_counts_every_insert() {
        let mut cache = SkippedKeys::new(0);
        cache.insert(ratchet_key(1), keys(1).remove(0));
        assert!(cache.is_empty());
        assert_eq!(cache.evicted(), 1);
    }
}
