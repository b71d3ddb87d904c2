// Hybrid array + hash table.
//
// The array part stores keys 1..=asize densely. The hash part is a
// power-of-two node vector using main-position chaining: colliding keys
// are linked through per-node `next` indices, and a key that sits
// outside its main position is evicted when the owner of that position
// shows up. Rehash picks the array/hash split that keeps the array part
// at least half full.

use super::Value;
use crate::gc::{GcId, TableId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// Key is nil or NaN; tables cannot store it.
    InvalidKey,
}

/// Node key state. Dead keys keep their slot so collision chains stay
/// intact until the next rehash.
#[derive(Clone, Copy, Debug)]
enum NodeKey {
    Empty,
    Dead,
    Key(Value),
}

#[derive(Clone, Copy, Debug)]
struct Node {
    key: NodeKey,
    value: Value,
    /// Index of the next node in this collision chain, -1 for none.
    next: i32,
}

impl Node {
    const EMPTY: Node = Node {
        key: NodeKey::Empty,
        value: Value::Nil,
        next: -1,
    };

    #[inline(always)]
    fn live_key(&self) -> Option<Value> {
        match self.key {
            NodeKey::Key(k) => Some(k),
            _ => None,
        }
    }
}

pub struct Table {
    array: Vec<Value>,
    nodes: Vec<Node>,
    /// One past the last slot inspected by the free-slot scan; counts down.
    lastfree: usize,
    pub metatable: Option<TableId>,
    /// Frozen tables reject every mutating entry point.
    pub readonly: bool,
    /// Bitmask of tag methods known to be absent when this table is used
    /// as a metatable. Any mutation clears it.
    pub tmcache: u8,
}

impl Table {
    pub fn new(asize: usize, hsize: usize) -> Self {
        let nsize = if hsize == 0 {
            0
        } else {
            hsize.next_power_of_two()
        };
        Self {
            array: vec![Value::Nil; asize],
            nodes: vec![Node::EMPTY; nsize],
            lastfree: nsize,
            metatable: None,
            readonly: false,
            tmcache: 0,
        }
    }

    #[inline(always)]
    pub fn array_capacity(&self) -> usize {
        self.array.len()
    }

    #[inline(always)]
    pub fn node_capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Estimated heap footprint, for per-category accounting.
    pub fn byte_size(&self) -> usize {
        size_of::<Table>()
            + self.array.len() * size_of::<Value>()
            + self.nodes.len() * size_of::<Node>()
    }

    #[inline(always)]
    fn main_position(&self, key: &Value) -> usize {
        debug_assert!(!self.nodes.is_empty());
        (key.key_hash() as usize) & (self.nodes.len() - 1)
    }

    // ============ Lookup ============

    pub fn get(&self, key: &Value) -> Value {
        if let Some(i) = key.as_array_index() {
            if (i as usize) <= self.array.len() {
                return self.array[i as usize - 1];
            }
        }
        self.hash_get(key)
    }

    fn hash_get(&self, key: &Value) -> Value {
        if self.nodes.is_empty() || key.is_nil() {
            return Value::Nil;
        }
        let mut pos = self.main_position(key) as i32;
        while pos >= 0 {
            let node = &self.nodes[pos as usize];
            if let Some(k) = node.live_key() {
                if k.raw_equal(key) {
                    return node.value;
                }
            }
            pos = node.next;
        }
        Value::Nil
    }

    // ============ Mutation ============

    /// Raw set, bypassing metamethods. Read-only enforcement happens in
    /// the VM before any state changes here.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), TableError> {
        match key {
            Value::Nil => return Err(TableError::InvalidKey),
            Value::Number(n) if n.is_nan() => return Err(TableError::InvalidKey),
            _ => {}
        }
        self.tmcache = 0;
        if let Some(i) = key.as_array_index() {
            let idx = i as usize;
            if idx <= self.array.len() {
                self.array[idx - 1] = value;
                return Ok(());
            }
            // Appending one past the bound grows the array part and pulls
            // any directly following keys out of the hash part.
            if idx == self.array.len() + 1 && !value.is_nil() {
                self.array.push(value);
                self.migrate_tail();
                return Ok(());
            }
        }
        if value.is_nil() {
            // Deleting an absent key is a no-op; never allocates.
            self.hash_delete(&key);
            return Ok(());
        }
        self.hash_set(key, value);
        Ok(())
    }

    /// After an append, keys n+2, n+3, ... may already live in the hash
    /// part; keep moving them over while they are contiguous.
    fn migrate_tail(&mut self) {
        loop {
            let next_key = Value::Number((self.array.len() + 1) as f64);
            let v = self.hash_get(&next_key);
            if v.is_nil() {
                break;
            }
            self.hash_delete(&next_key);
            self.array.push(v);
        }
    }

    fn hash_delete(&mut self, key: &Value) {
        if self.nodes.is_empty() {
            return;
        }
        let mut pos = self.main_position(key) as i32;
        while pos >= 0 {
            let node = &mut self.nodes[pos as usize];
            if let Some(k) = node.live_key() {
                if k.raw_equal(key) {
                    // Keep the key so the chain through this slot survives.
                    node.key = NodeKey::Dead;
                    node.value = Value::Nil;
                    return;
                }
            }
            pos = node.next;
        }
    }

    fn hash_set(&mut self, key: Value, value: Value) {
        if !self.nodes.is_empty() {
            // Update in place when the key already exists.
            let mut pos = self.main_position(&key) as i32;
            while pos >= 0 {
                let node = &mut self.nodes[pos as usize];
                if let Some(k) = node.live_key() {
                    if k.raw_equal(&key) {
                        node.value = value;
                        return;
                    }
                }
                pos = node.next;
            }
        }
        self.insert_new_key(key, value);
    }

    fn insert_new_key(&mut self, key: Value, value: Value) {
        if self.nodes.is_empty() {
            self.rehash(Some(&key));
            self.insert_new_key(key, value);
            return;
        }
        let mp = self.main_position(&key);
        if matches!(self.nodes[mp].key, NodeKey::Empty) {
            self.nodes[mp] = Node {
                key: NodeKey::Key(key),
                value,
                next: -1,
            };
            return;
        }
        let Some(free) = self.find_free_slot() else {
            self.rehash(Some(&key));
            self.insert_new_key(key, value);
            return;
        };
        let colliding_key = self.nodes[mp].live_key();
        let colliding_mp = colliding_key.map(|k| self.main_position(&k));
        if colliding_mp == Some(mp) || colliding_key.is_none() {
            // Owner (or a dead slot anchoring a chain) is in place: the new
            // key goes to the free slot, linked right after the main position.
            self.nodes[free] = Node {
                key: NodeKey::Key(key),
                value,
                next: self.nodes[mp].next,
            };
            self.nodes[mp].next = free as i32;
        } else {
            // Squatter from another chain: evict it to the free slot and
            // claim the main position.
            let squatter_mp = colliding_mp.unwrap();
            let mut prev = squatter_mp;
            while self.nodes[prev].next != mp as i32 {
                prev = self.nodes[prev].next as usize;
            }
            self.nodes[prev].next = free as i32;
            self.nodes[free] = self.nodes[mp];
            self.nodes[mp] = Node {
                key: NodeKey::Key(key),
                value,
                next: -1,
            };
        }
    }

    fn find_free_slot(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if matches!(self.nodes[self.lastfree].key, NodeKey::Empty) {
                return Some(self.lastfree);
            }
        }
        None
    }

    // ============ Rehash ============

    /// Rebuild with the array/hash split that keeps the array part more
    /// than half full: integer keys are counted into log2 buckets, and
    /// the largest power of two with majority occupancy wins.
    fn rehash(&mut self, extra: Option<&Value>) {
        const MAX_BITS: usize = 30;
        let mut nums = [0usize; MAX_BITS + 1];
        let mut total_int = 0usize;
        let mut total_other = 0usize;

        // Bucket b counts integer keys in (2^(b-1), 2^b].
        let mut count_key = |k: &Value| {
            if let Some(i) = k.as_array_index() {
                let bucket = if i == 1 {
                    0
                } else {
                    (64 - ((i - 1) as u64).leading_zeros() as usize).min(MAX_BITS)
                };
                nums[bucket] += 1;
                total_int += 1;
            } else {
                total_other += 1;
            }
        };

        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                count_key(&Value::Number((i + 1) as f64));
            }
        }
        for node in &self.nodes {
            if let Some(k) = node.live_key() {
                if !node.value.is_nil() {
                    count_key(&k);
                }
            }
        }
        if let Some(k) = extra {
            count_key(k);
        }

        // Optimal array size: largest 2^i where more than 2^(i-1) of the
        // candidate keys fall in 1..=2^i.
        let mut optimal = 0usize;
        let mut in_range = 0usize;
        let mut twopow = 1usize;
        let mut used_in_optimal = 0usize;
        for bucket in nums.iter().take(MAX_BITS + 1) {
            in_range += bucket;
            if in_range > twopow / 2 {
                optimal = twopow;
                used_in_optimal = in_range;
            }
            twopow = twopow.saturating_mul(2);
        }

        let hash_count = total_int - used_in_optimal + total_other;
        let new_nsize = if hash_count == 0 {
            0
        } else {
            hash_count.next_power_of_two()
        };

        let old_array = std::mem::replace(&mut self.array, vec![Value::Nil; optimal]);
        let old_nodes = std::mem::replace(&mut self.nodes, vec![Node::EMPTY; new_nsize]);
        self.lastfree = new_nsize;

        for (i, v) in old_array.into_iter().enumerate() {
            if v.is_nil() {
                continue;
            }
            if i < optimal {
                self.array[i] = v;
            } else {
                self.hash_set(Value::Number((i + 1) as f64), v);
            }
        }
        for node in old_nodes {
            if let Some(k) = node.live_key() {
                if !node.value.is_nil() {
                    if let Some(idx) = k.as_array_index() {
                        if (idx as usize) <= optimal {
                            self.array[idx as usize - 1] = node.value;
                            continue;
                        }
                    }
                    self.hash_set(k, node.value);
                }
            }
        }
    }

    // ============ Length ============

    /// A border: index n with t[n] non-nil and t[n+1] nil, found by
    /// binary search over the array part; the hash part is consulted
    /// only when the array part is fully occupied.
    pub fn length(&self) -> usize {
        let asize = self.array.len();
        if asize > 0 && self.array[asize - 1].is_nil() {
            let mut lo = 0usize; // array[lo-1] known non-nil (or lo == 0)
            let mut hi = asize; // array[hi-1] known nil
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if self.array[mid - 1].is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo;
        }
        if self.nodes.is_empty() {
            return asize;
        }
        // Array part full: probe upward through the hash part.
        let mut i = asize;
        let mut j = asize + 1;
        while !self.hash_get(&Value::Number(j as f64)).is_nil() {
            i = j;
            if j > usize::MAX / 2 {
                // Pathological table; fall back to a linear scan.
                let mut n = asize + 1;
                while !self.get(&Value::Number(n as f64)).is_nil() {
                    n += 1;
                }
                return n - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let mid = (i + j) / 2;
            if self.hash_get(&Value::Number(mid as f64)).is_nil() {
                j = mid;
            } else {
                i = mid;
            }
        }
        i
    }

    // ============ Iteration ============

    /// Stateless iteration: given the previous key (nil to start),
    /// return the next key/value pair. Array part first, then nodes.
    pub fn next(&self, key: &Value) -> Result<Option<(Value, Value)>, TableError> {
        let start_node = if key.is_nil() {
            0
        } else if let Some(i) = key.as_array_index().filter(|&i| (i as usize) <= self.array.len()) {
            // Resume inside the array part.
            for idx in i as usize..self.array.len() {
                if !self.array[idx].is_nil() {
                    return Ok(Some((Value::Number((idx + 1) as f64), self.array[idx])));
                }
            }
            0
        } else {
            self.find_node(key).ok_or(TableError::InvalidKey)? + 1
        };
        if key.is_nil() {
            for idx in 0..self.array.len() {
                if !self.array[idx].is_nil() {
                    return Ok(Some((Value::Number((idx + 1) as f64), self.array[idx])));
                }
            }
        }
        for idx in start_node..self.nodes.len() {
            let node = &self.nodes[idx];
            if let Some(k) = node.live_key() {
                if !node.value.is_nil() {
                    return Ok(Some((k, node.value)));
                }
            }
        }
        Ok(None)
    }

    fn find_node(&self, key: &Value) -> Option<usize> {
        if self.nodes.is_empty() {
            return None;
        }
        let mut pos = self.main_position(key) as i32;
        while pos >= 0 {
            let node = &self.nodes[pos as usize];
            if let Some(k) = node.live_key() {
                if k.raw_equal(key) {
                    return Some(pos as usize);
                }
            }
            pos = node.next;
        }
        None
    }

    /// Array-part values, for GC traversal.
    pub fn iter_array(&self) -> impl Iterator<Item = &Value> {
        self.array.iter()
    }

    /// Live hash-part entries, for GC traversal and heap dumps.
    pub fn iter_entries(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.nodes.iter().filter_map(|n| {
            n.live_key()
                .filter(|_| !n.value.is_nil())
                .map(|k| (k, n.value))
        })
    }

    /// Count of live entries across both parts.
    pub fn entry_count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count() + self.iter_entries().count()
    }

    /// Hash-part "next" links must stay inside the node vector.
    pub fn check_links(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| n.next < self.nodes.len() as i32)
    }

    // ============ Weak-table support ============

    /// Drop entries whose weak half is dead. Dead hash keys keep their
    /// slot (as Dead) so live collision chains are not broken.
    pub fn clear_dead_entries<F>(&mut self, weak_keys: bool, weak_values: bool, mut is_dead: F)
    where
        F: FnMut(GcId) -> bool,
    {
        let dead_value = |v: &Value, is_dead: &mut F| match v.gc_id() {
            Some(id) => is_dead(id),
            None => false,
        };
        if weak_values {
            for v in self.array.iter_mut() {
                if dead_value(v, &mut is_dead) {
                    *v = Value::Nil;
                }
            }
        }
        for node in self.nodes.iter_mut() {
            let Some(k) = node.live_key() else { continue };
            if node.value.is_nil() {
                continue;
            }
            let drop = (weak_keys && dead_value(&k, &mut is_dead))
                || (weak_values && dead_value(&node.value, &mut is_dead));
            if drop {
                node.key = NodeKey::Dead;
                node.value = Value::Nil;
            }
        }
    }
}
