// File: src/table.rs
//
// Open-addressed hash table keyed by interned strings, used for
// globals, instance fields, class methods, and module namespaces.
// Keys compare by handle identity (interning canonicalizes contents);
// a raw-slice lookup rehashes the bytes and compares contents instead.
// Linear probing with tombstone deletion.

use crate::value::{ObjId, Value};

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD_FACTOR: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySlot {
    Empty,
    Tombstone,
    Occupied(ObjId),
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    key: KeySlot,
    hash: u64,
    value: Value,
}

impl Bucket {
    const EMPTY: Bucket = Bucket { key: KeySlot::Empty, hash: 0, value: Value::Null };
}

#[derive(Debug, Default)]
pub struct Table {
    buckets: Vec<Bucket>,
    /// Live entries.
    len: usize,
    /// Occupied plus tombstoned buckets; drives the load factor so a
    /// table churned by deletions still resizes before probes can loop.
    filled: usize,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or overwrite. Returns true when the key was new.
    pub fn set(&mut self, key: ObjId, hash: u64, value: Value) -> bool {
        self.grow_if_needed();

        let index = self.find_slot(key, hash);
        let bucket = &mut self.buckets[index];
        let is_new = !matches!(bucket.key, KeySlot::Occupied(_));
        if is_new {
            if bucket.key == KeySlot::Empty {
                self.filled += 1;
            }
            self.len += 1;
        }
        *bucket = Bucket { key: KeySlot::Occupied(key), hash, value };
        is_new
    }

    pub fn get(&self, key: ObjId, hash: u64) -> Option<Value> {
        if self.len == 0 {
            return None;
        }
        let index = self.probe(hash, |slot| slot == KeySlot::Occupied(key))?;
        Some(self.buckets[index].value)
    }

    /// Lookup by raw contents; `resolve` maps an interned key handle to
    /// its characters.
    pub fn get_slice<'a>(
        &self,
        key: &str,
        hash: u64,
        resolve: impl Fn(ObjId) -> &'a str,
    ) -> Option<Value> {
        if self.len == 0 {
            return None;
        }
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            let bucket = &self.buckets[index];
            match bucket.key {
                KeySlot::Empty => return None,
                KeySlot::Tombstone => {}
                KeySlot::Occupied(id) => {
                    if bucket.hash == hash && resolve(id) == key {
                        return Some(bucket.value);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Tombstone the entry. Returns true when the key was present.
    pub fn remove(&mut self, key: ObjId, hash: u64) -> bool {
        if self.len == 0 {
            return false;
        }
        let Some(index) = self.probe(hash, |slot| slot == KeySlot::Occupied(key)) else {
            return false;
        };
        self.buckets[index].key = KeySlot::Tombstone;
        self.buckets[index].value = Value::Null;
        self.len -= 1;
        true
    }

    /// Occupied entries, in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjId, Value)> + '_ {
        self.buckets.iter().filter_map(|bucket| match bucket.key {
            KeySlot::Occupied(id) => Some((id, bucket.value)),
            _ => None,
        })
    }

    /// Probe for an occupied bucket matching `matches`, skipping
    /// tombstones, stopping at the first empty bucket.
    fn probe(&self, hash: u64, matches: impl Fn(KeySlot) -> bool) -> Option<usize> {
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        loop {
            let bucket = &self.buckets[index];
            match bucket.key {
                KeySlot::Empty => return None,
                _ if matches(bucket.key) => return Some(index),
                _ => {}
            }
            index = (index + 1) & mask;
        }
    }

    /// Slot for inserting `key`: its existing bucket, or the first
    /// tombstone seen on the way, or the empty bucket that ended the
    /// probe.
    fn find_slot(&self, key: ObjId, hash: u64) -> usize {
        let mask = self.buckets.len() - 1;
        let mut index = (hash as usize) & mask;
        let mut first_tombstone = None;
        loop {
            match self.buckets[index].key {
                KeySlot::Empty => return first_tombstone.unwrap_or(index),
                KeySlot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                KeySlot::Occupied(existing) => {
                    if existing == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow_if_needed(&mut self) {
        let capacity = self.buckets.len();
        if capacity == 0 {
            self.buckets = vec![Bucket::EMPTY; INITIAL_CAPACITY];
            return;
        }
        if (self.filled + 1) as f32 / capacity as f32 <= MAX_LOAD_FACTOR {
            return;
        }

        let old = std::mem::replace(&mut self.buckets, vec![Bucket::EMPTY; capacity * 2]);
        self.filled = self.len;
        for bucket in old {
            if let KeySlot::Occupied(key) = bucket.key {
                let index = self.find_slot(key, bucket.hash);
                self.buckets[index] = bucket;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(n: u32) -> (ObjId, u64) {
        // Synthetic interned ids with deliberately clustered hashes to
        // exercise probing.
        (ObjId(n), (n % 4) as u64)
    }

    #[test]
    fn insert_then_get() {
        let mut table = Table::new();
        let (k, h) = key(1);
        assert!(table.set(k, h, Value::Int(10)));
        assert_eq!(table.get(k, h), Some(Value::Int(10)));
        assert!(!table.set(k, h, Value::Int(20)));
        assert_eq!(table.get(k, h), Some(Value::Int(20)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_leaves_a_tombstone_probes_skip() {
        let mut table = Table::new();
        // Three colliding keys probe into consecutive buckets.
        for n in [1, 5, 9] {
            let (k, h) = key(n);
            table.set(k, h, Value::Int(n as i64));
        }
        let (middle, middle_hash) = key(5);
        assert!(table.remove(middle, middle_hash));
        assert_eq!(table.get(middle, middle_hash), None);
        // The key displaced past the tombstone is still reachable.
        let (last, last_hash) = key(9);
        assert_eq!(table.get(last, last_hash), Some(Value::Int(9)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn tombstones_are_reused_on_insert() {
        let mut table = Table::new();
        for n in [1, 5] {
            let (k, h) = key(n);
            table.set(k, h, Value::Int(n as i64));
        }
        let (k, h) = key(1);
        table.remove(k, h);
        let (k2, _) = key(5);
        // A new colliding key lands in the tombstoned bucket.
        let (k3, h3) = (ObjId(13), 1u64);
        table.set(k3, h3, Value::Int(13));
        assert_eq!(table.get(k3, h3), Some(Value::Int(13)));
        assert_eq!(table.get(k2, 1), Some(Value::Int(5)));
    }

    #[test]
    fn entries_survive_rehash_growth() {
        let mut table = Table::new();
        for n in 0..100u32 {
            table.set(ObjId(n), n as u64, Value::Int(n as i64));
        }
        for n in 0..100u32 {
            assert_eq!(table.get(ObjId(n), n as u64), Some(Value::Int(n as i64)));
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn iter_visits_occupied_buckets_only() {
        let mut table = Table::new();
        for n in 0..10u32 {
            table.set(ObjId(n), n as u64, Value::Int(n as i64));
        }
        table.remove(ObjId(3), 3);
        let mut seen: Vec<u32> = table.iter().map(|(k, _)| k.0).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn slice_lookup_compares_contents() {
        let names = ["alpha", "beta", "gamma"];
        let mut table = Table::new();
        for (i, name) in names.iter().enumerate() {
            let hash = crate::value::hash_bytes(name.as_bytes());
            table.set(ObjId(i as u32), hash, Value::Int(i as i64));
        }
        let hash = crate::value::hash_bytes(b"beta");
        let found = table.get_slice("beta", hash, |id| names[id.0 as usize]);
        assert_eq!(found, Some(Value::Int(1)));
        let missing_hash = crate::value::hash_bytes(b"delta");
        assert_eq!(table.get_slice("delta", missing_hash, |id| names[id.0 as usize]), None);
    }
}
