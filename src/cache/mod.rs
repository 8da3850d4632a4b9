//! LRU-bounded caches fronting random reads.
//!
//! [`LruCache`] is the shared primitive behind the two caches a column
//! family owns: the *block cache* (decoded data blocks, keyed by file
//! number and block offset) and the *table cache* (open sstable handles,
//! keyed by file number — see [`crate::sstable::TableCache`]).
//!
//! # Structure
//!
//! Entries live in an arena; an ordered key set maps keys to arena slots,
//! and the slots carry prev/next indices forming a doubly-linked LRU list,
//! most-recently-used first. Destroying an entry unlinks it from both
//! collections. Holding links as arena indices rather than pointers keeps
//! the cycle cache → entry → cache expressible without ownership loops.
//!
//! # Reclaim
//!
//! Eviction is opportunistic rather than strictly size-counted: each entry
//! carries a byte charge, the cache has a soft budget, and the reclaimer
//! walks from the LRU tail until occupancy is back under budget. Pinned
//! entries report `is_evictable() == false` and are skipped — a block that
//! is currently being read must not vanish under the reader.
//!
//! Caches are owned by a single shard; cross-shard sharing never happens.
//! The engine serialises access with a mutex where background work is
//! involved.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::block::Block;

/// Key of a cached, decoded data block: `(file_number, block_offset)`.
pub type BlockCacheKey = (u64, u64);

/// The per-shard cache of decoded sstable data blocks.
pub type BlockCache = LruCache<BlockCacheKey, Arc<Block>>;

/// Default soft budget for the block cache (8 MiB).
pub const DEFAULT_BLOCK_CACHE_BUDGET: usize = 8 << 20;

/// Default entry budget charge for the table cache (entries, not bytes).
pub const DEFAULT_TABLE_CACHE_SLOTS: usize = 500;

struct Entry<K, V> {
    key: K,
    value: V,
    charge: usize,
    pins: u32,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An ordered map layered over an intrusive (index-linked) LRU list.
pub struct LruCache<K: Ord + Clone, V: Clone> {
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    map: BTreeMap<K, usize>,
    /// Most-recently-used entry.
    head: Option<usize>,
    /// Least-recently-used entry; eviction starts here.
    tail: Option<usize>,
    charge: usize,
    budget: usize,
}

impl<K: Ord + Clone, V: Clone> LruCache<K, V> {
    /// A cache with the given soft byte budget.
    pub fn new(budget: usize) -> Self {
        LruCache {
            slots: Vec::new(),
            free: Vec::new(),
            map: BTreeMap::new(),
            head: None,
            tail: None,
            charge: 0,
            budget,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Accounted occupancy in charge units.
    pub fn charge(&self) -> usize {
        self.charge
    }

    /// The soft budget the reclaimer targets.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Look up `key`; a hit is spliced to the head of the LRU.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let slot = *self.map.get(key)?;
        self.splice_to_head(slot);
        self.slots[slot].as_ref().map(|e| e.value.clone())
    }

    /// Return the existing entry for `key`, or populate it via `factory`.
    ///
    /// The factory returns `(value, charge)`. On success the entry is at
    /// the head of the LRU and a reclaim pass runs if the budget is now
    /// exceeded. A factory error inserts nothing.
    pub fn find_or_insert<E>(
        &mut self,
        key: K,
        factory: impl FnOnce() -> Result<(V, usize), E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let (value, charge) = factory()?;
        self.insert(key, value.clone(), charge);
        Ok(value)
    }

    /// Insert or replace `key`, placing it at the head of the LRU.
    pub fn insert(&mut self, key: K, value: V, charge: usize) {
        if let Some(&slot) = self.map.get(&key) {
            // Replace in place, keeping pins.
            if let Some(entry) = self.slots[slot].as_mut() {
                self.charge = self.charge - entry.charge + charge;
                entry.value = value;
                entry.charge = charge;
            }
            self.splice_to_head(slot);
        } else {
            let slot = self.alloc_slot(Entry {
                key: key.clone(),
                value,
                charge,
                pins: 0,
                prev: None,
                next: self.head,
            });
            if let Some(old_head) = self.head {
                if let Some(e) = self.slots[old_head].as_mut() {
                    e.prev = Some(slot);
                }
            }
            self.head = Some(slot);
            if self.tail.is_none() {
                self.tail = Some(slot);
            }
            self.map.insert(key, slot);
            self.charge += charge;
        }

        if self.charge > self.budget {
            self.reclaim();
        }
    }

    /// Splice an existing entry to the head of the LRU (read hit).
    pub fn touch(&mut self, key: &K) {
        if let Some(&slot) = self.map.get(key) {
            self.splice_to_head(slot);
        }
    }

    /// Pin `key`: the entry becomes non-evictable until unpinned.
    pub fn pin(&mut self, key: &K) {
        if let Some(&slot) = self.map.get(key)
            && let Some(entry) = self.slots[slot].as_mut()
        {
            entry.pins += 1;
        }
    }

    /// Release one pin on `key`.
    pub fn unpin(&mut self, key: &K) {
        if let Some(&slot) = self.map.get(key)
            && let Some(entry) = self.slots[slot].as_mut()
        {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    /// Whether the reclaimer may evict `key`.
    pub fn is_evictable(&self, key: &K) -> bool {
        self.map
            .get(key)
            .and_then(|&slot| self.slots[slot].as_ref())
            .is_some_and(|e| e.pins == 0)
    }

    /// Unlink and destroy the entry for `key`, if present.
    pub fn evict(&mut self, key: &K) -> bool {
        match self.map.remove(key) {
            Some(slot) => {
                self.destroy_slot(slot);
                true
            }
            None => false,
        }
    }

    /// Drop every entry, pinned or not.
    ///
    /// Catastrophe path: used when eviction itself cannot make progress
    /// (population failed mid-reclaim). Callers retry the failed operation
    /// against the emptied cache.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.map.clear();
        self.head = None;
        self.tail = None;
        self.charge = 0;
    }

    /// Evict from the LRU tail until occupancy is within budget or only
    /// pinned entries remain.
    pub fn reclaim(&mut self) {
        let mut cursor = self.tail;
        while self.charge > self.budget {
            let Some(slot) = cursor else { break };
            let Some(entry) = self.slots[slot].as_ref() else {
                break;
            };
            let prev = entry.prev;
            if entry.pins == 0 {
                let key = entry.key.clone();
                trace!(evicted_charge = entry.charge, "cache reclaim evicts tail entry");
                self.map.remove(&key);
                self.destroy_slot(slot);
            }
            cursor = prev;
        }
    }

    fn alloc_slot(&mut self, entry: Entry<K, V>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    /// Unlink a slot from the LRU list and release it.
    fn destroy_slot(&mut self, slot: usize) {
        let Some(entry) = self.slots[slot].take() else {
            return;
        };
        match entry.prev {
            Some(p) => {
                if let Some(e) = self.slots[p].as_mut() {
                    e.next = entry.next;
                }
            }
            None => self.head = entry.next,
        }
        match entry.next {
            Some(n) => {
                if let Some(e) = self.slots[n].as_mut() {
                    e.prev = entry.prev;
                }
            }
            None => self.tail = entry.prev,
        }
        self.charge -= entry.charge;
        self.free.push(slot);
    }

    fn splice_to_head(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(e) => (e.prev, e.next),
            None => return,
        };
        // Unlink.
        if let Some(p) = prev
            && let Some(e) = self.slots[p].as_mut()
        {
            e.next = next;
        }
        match next {
            Some(n) => {
                if let Some(e) = self.slots[n].as_mut() {
                    e.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        // Relink at head.
        let old_head = self.head;
        if let Some(e) = self.slots[slot].as_mut() {
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head
            && let Some(e) = self.slots[h].as_mut()
        {
            e.prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    /// Keys in LRU order, most recent first. Test and debugging aid.
    #[cfg(test)]
    pub(crate) fn lru_keys(&self) -> Vec<K> {
        let mut keys = Vec::new();
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let Some(entry) = self.slots[slot].as_ref() else {
                break;
            };
            keys.push(entry.key.clone());
            cursor = entry.next;
        }
        keys
    }
}
