// Global string intern table.
//
// Every string is interned: identical bytes yield the same StringId,
// so string equality anywhere in the VM is id equality. The map holds
// ids only (a weak view of the pool); dead strings are unlinked by the
// sweep before their objects are freed.

use ahash::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use crate::gc::{GcPool, StringId};

pub struct StringInterner {
    /// Content hash -> candidate ids; collisions resolved by byte
    /// comparison.
    map: HashMap<u64, Vec<StringId>, RandomState>,
    hashbuilder: RandomState,
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            hashbuilder: RandomState::new(),
        }
    }

    #[inline(always)]
    pub fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        let mut hasher = self.hashbuilder.build_hasher();
        bytes.hash(&mut hasher);
        hasher.finish()
    }

    /// Look up existing content. Cheapest checks first: length, then
    /// bytes.
    pub fn find(&self, pool: &GcPool, bytes: &[u8], hash: u64) -> Option<StringId> {
        let ids = self.map.get(&hash)?;
        for &id in ids {
            let s = pool.string(id);
            if s.len() == bytes.len() && *s.bytes == *bytes {
                return Some(id);
            }
        }
        None
    }

    pub fn insert(&mut self, hash: u64, id: StringId) {
        self.map.entry(hash).or_default().push(id);
    }

    /// Unlink a dying string (called by the sweep, before the object is
    /// freed).
    pub fn remove_dead(&mut self, id: StringId, hash: u64) {
        if let Some(ids) = self.map.get_mut(&hash) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.map.remove(&hash);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}
