//! Open-addressing hash table keyed by interned strings.
//!
//! The same structure backs globals, class methods, instance fields and the
//! heap's string-intern table. Keys are compared by identity; content is only
//! looked at by [`Table::find_string`], which runs before a string object
//! exists.

use crate::value::{StrRef, Value};

const INITIAL_CAPACITY: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
enum Slot {
    /// Never used since the last rebuild. Ends a probe sequence.
    #[default]
    Empty,
    /// Deleted entry. Probing continues past it.
    Tombstone,
    Occupied(StrRef, Value),
}

/// Hash table from interned strings to values.
///
/// `count` tracks occupied plus tombstone slots and is only used for the
/// load factor. `len` is the number of live entries.
#[derive(Clone, Debug, Default)]
pub struct Table {
    count: usize,
    len: usize,
    entries: Vec<Slot>,
}

impl Table {
    pub fn new() -> Self {
        Self {
            count: 0,
            len: 0,
            entries: Vec::new(),
        }
    }

    /// Releases the backing array. Objects referenced by keys and values are
    /// owned by the heap and are left alone.
    pub fn free(&mut self) {
        *self = Self::new();
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Occupied plus tombstone slots.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: StrRef) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        match self.entries[find_entry(&self.entries, key)] {
            Slot::Occupied(_, value) => Some(value),
            _ => None,
        }
    }

    /// Stores `value` under `key`. Returns `true` if the key was not present.
    pub fn set(&mut self, key: StrRef, value: Value) -> bool {
        if exceeds_max_load(self.count + 1, self.capacity()) {
            let capacity = grow_capacity(self.capacity());
            self.adjust_capacity(capacity);
        }

        let index = find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = !matches!(entry, Slot::Occupied(..));

        // A reused tombstone was already counted when it was created.
        if *entry == Slot::Empty {
            self.count += 1;
        }

        *entry = Slot::Occupied(key, value);
        if is_new_key {
            self.len += 1;
        }
        is_new_key
    }

    pub fn delete(&mut self, key: StrRef) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if !matches!(entry, Slot::Occupied(..)) {
            return false;
        }

        *entry = Slot::Tombstone;
        self.len -= 1;
        true
    }

    /// Copies every entry of `from` into `self`, overwriting on key clashes.
    pub fn add_all(&mut self, from: &Table) {
        for (key, value) in from.iter() {
            self.set(key, value);
        }
    }

    /// Looks up an interned string by content.
    ///
    /// `resolve` maps a stored key back to its characters; it is only called
    /// for keys whose hash already matches.
    pub fn find_string<'a, F>(&self, chars: &str, hash: u32, resolve: F) -> Option<StrRef>
    where
        F: Fn(StrRef) -> &'a str,
    {
        if self.count == 0 {
            return None;
        }

        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            match self.entries[index] {
                Slot::Empty => return None,
                Slot::Occupied(key, _) if key.hash() == hash && resolve(key) == chars => {
                    return Some(key)
                }
                _ => (),
            }

            index = (index + 1) & mask;
        }
    }

    /// Drops every entry whose key did not survive the mark phase.
    ///
    /// Only meaningful for the intern table, and only between the end of
    /// marking and the start of sweeping. Returns the number of entries removed.
    pub fn remove_white<F>(&mut self, is_marked: F) -> usize
    where
        F: Fn(StrRef) -> bool,
    {
        let mut removed = 0;
        for entry in self.entries.iter_mut() {
            if let Slot::Occupied(key, _) = *entry {
                if !is_marked(key) {
                    *entry = Slot::Tombstone;
                    removed += 1;
                }
            }
        }

        self.len -= removed;
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (StrRef, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match *entry {
            Slot::Occupied(key, value) => Some((key, value)),
            _ => None,
        })
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        log::trace!(target: "table", "grow {} -> {}", self.capacity(), capacity);

        let old = std::mem::replace(&mut self.entries, vec![Slot::Empty; capacity]);

        self.count = 0;
        for entry in old {
            if let Slot::Occupied(key, _) = entry {
                let index = find_entry(&self.entries, key);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < INITIAL_CAPACITY {
        INITIAL_CAPACITY
    } else {
        capacity * 2
    }
}

/// `count > capacity * 0.75`, in integers.
fn exceeds_max_load(count: usize, capacity: usize) -> bool {
    count * 4 > capacity * 3
}

/// Index of the slot holding `key`, or of the slot where it should go.
///
/// The first tombstone passed over is preferred to the terminating empty slot
/// so deleted slots get reused. Terminates because the load factor keeps at
/// least one slot empty.
fn find_entry(entries: &[Slot], key: StrRef) -> usize {
    let mask = entries.len() - 1;
    let mut index = key.hash() as usize & mask;
    let mut tombstone = None;

    loop {
        match entries[index] {
            Slot::Empty => return tombstone.unwrap_or(index),
            Slot::Tombstone => {
                tombstone.get_or_insert(index);
            }
            Slot::Occupied(k, _) if k == key => return index,
            Slot::Occupied(..) => (),
        }

        index = (index + 1) & mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcRef;

    fn key(id: usize, hash: u32) -> StrRef {
        StrRef::new(GcRef::new(id), hash)
    }

    #[test]
    fn lazy_allocation() {
        let mut table = Table::new();
        assert_eq!(table.capacity(), 0);
        assert_eq!(table.get(key(0, 1)), None);
        assert!(!table.delete(key(0, 1)));
        assert_eq!(table.capacity(), 0);

        let foo = key(0, 0xdead_beef);
        assert!(table.set(foo, Value::Number(1.0)));
        assert_eq!(table.capacity(), 8);
        assert_eq!(table.get(foo), Some(Value::Number(1.0)));
        assert_eq!(table.get(key(1, 7)), None);
    }

    #[test]
    fn overwrite_is_not_new() {
        let mut table = Table::new();
        let foo = key(0, 3);
        assert!(table.set(foo, Value::Nil));
        assert!(!table.set(foo, Value::Bool(true)));
        assert_eq!(table.get(foo), Some(Value::Bool(true)));
        assert_eq!(table.count(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn seventh_insert_grows_to_sixteen() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..7).map(|i| key(i, i as u32 * 31)).collect();

        for (i, &k) in keys.iter().take(6).enumerate() {
            assert!(table.set(k, Value::Number(i as f64)));
        }
        assert_eq!(table.capacity(), 8);

        assert!(table.set(keys[6], Value::Number(6.0)));
        assert_eq!(table.capacity(), 16);

        for (i, &k) in keys.iter().enumerate() {
            assert_eq!(table.get(k), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn tombstone_is_reused() {
        let mut table = Table::new();
        let foo = key(0, 5);
        table.set(foo, Value::Number(1.0));
        assert!(table.delete(foo));
        assert_eq!(table.get(foo), None);
        assert!(!table.delete(foo));

        assert!(table.set(foo, Value::Number(2.0)));
        assert_eq!(table.get(foo), Some(Value::Number(2.0)));
        assert_eq!(table.count(), 1);
    }

    #[test]
    fn colliding_keys_survive_deletion_in_between() {
        let mut table = Table::new();
        let a = key(0, 2);
        let b = key(1, 2);
        let c = key(2, 2);
        table.set(a, Value::Number(1.0));
        table.set(b, Value::Number(2.0));
        table.set(c, Value::Number(3.0));

        assert!(table.delete(b));
        assert_eq!(table.get(c), Some(Value::Number(3.0)));

        // c is found past the tombstone, so this overwrites rather than duplicates.
        assert!(!table.set(c, Value::Number(4.0)));
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(c), Some(Value::Number(4.0)));

        // A fresh colliding key takes b's old slot.
        let d = key(3, 2);
        assert!(table.set(d, Value::Nil));
        assert_eq!(table.count(), 3);
    }

    #[test]
    fn probe_wraps_around() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..4).map(|i| key(i, 7)).collect();
        for &k in &keys {
            table.set(k, Value::Bool(true));
        }
        assert_eq!(table.capacity(), 8);
        for &k in &keys {
            assert_eq!(table.get(k), Some(Value::Bool(true)));
        }
    }

    #[test]
    fn growth_drops_tombstones() {
        let mut table = Table::new();
        for i in 0..6 {
            table.set(key(i, i as u32), Value::Nil);
        }
        for i in 0..5 {
            assert!(table.delete(key(i, i as u32)));
        }
        assert_eq!(table.count(), 6);

        table.set(key(10, 10), Value::Nil);
        assert_eq!(table.capacity(), 16);
        assert_eq!(table.count(), 2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn load_factor_holds_after_every_set() {
        let mut table = Table::new();
        for i in 0..200 {
            table.set(key(i, (i as u32).wrapping_mul(2_654_435_761)), Value::Nil);
            assert!(table.count() * 4 <= table.capacity() * 3);
            assert!(table.capacity().is_power_of_two());
        }
    }

    #[test]
    fn add_all_overwrites_and_keeps_the_rest() {
        let shared = key(0, 1);
        let only_from = key(1, 2);
        let only_to = key(2, 3);

        let mut from = Table::new();
        from.set(shared, Value::Number(1.0));
        from.set(only_from, Value::Number(2.0));

        let mut to = Table::new();
        to.set(shared, Value::Number(10.0));
        to.set(only_to, Value::Number(30.0));

        to.add_all(&from);
        assert_eq!(to.get(shared), Some(Value::Number(1.0)));
        assert_eq!(to.get(only_from), Some(Value::Number(2.0)));
        assert_eq!(to.get(only_to), Some(Value::Number(30.0)));
        assert_eq!(from.len(), 2);
    }

    #[test]
    fn find_string_compares_content() {
        let names = ["hi", "ho", "hi!"];
        let resolve = |k: StrRef| names[k.string().index()];

        let mut table = Table::new();
        assert_eq!(table.find_string("hi", 9, resolve), None);

        let hi = key(0, 9);
        table.set(hi, Value::Nil);
        // Same hash, different content.
        table.set(key(1, 9), Value::Nil);
        table.set(key(2, 9), Value::Nil);

        assert_eq!(table.find_string("hi", 9, resolve), Some(hi));
        assert_eq!(table.find_string("hi!", 9, resolve), Some(key(2, 9)));
        assert_eq!(table.find_string("hi", 10, resolve), None);
        assert_eq!(table.find_string("hu", 9, resolve), None);
    }

    #[test]
    fn find_string_skips_tombstones() {
        let names = ["a", "b"];
        let resolve = |k: StrRef| names[k.string().index()];

        let mut table = Table::new();
        let a = key(0, 4);
        let b = key(1, 4);
        table.set(a, Value::Nil);
        table.set(b, Value::Nil);
        table.delete(a);

        assert_eq!(table.find_string("a", 4, resolve), None);
        assert_eq!(table.find_string("b", 4, resolve), Some(b));
    }

    #[test]
    fn remove_white_keeps_marked() {
        let bar = key(0, 11);
        let baz = key(1, 12);
        let mut table = Table::new();
        table.set(bar, Value::Number(10.0));
        table.set(baz, Value::Number(20.0));

        let removed = table.remove_white(|k| k == bar);
        assert_eq!(removed, 1);
        assert_eq!(table.get(baz), None);
        assert_eq!(table.get(bar), Some(Value::Number(10.0)));
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn len_counts_live_entries_only() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..10).map(|i| key(i, i as u32 % 3)).collect();
        let check = |table: &Table| assert_eq!(table.len(), table.iter().count());

        for &k in &keys {
            table.set(k, Value::Nil);
            check(&table);
        }
        assert_eq!(table.len(), 10);

        table.set(keys[0], Value::Bool(true));
        assert_eq!(table.len(), 10);

        assert!(table.delete(keys[1]));
        assert!(!table.delete(keys[1]));
        check(&table);
        assert_eq!(table.len(), 9);

        table.set(keys[1], Value::Nil);
        check(&table);
        assert_eq!(table.len(), 10);

        let removed = table.remove_white(|k| k.string().index() % 2 == 0);
        assert_eq!(removed, 5);
        check(&table);
        assert_eq!(table.len(), 5);
        assert!(table.count() > table.len());
    }

    #[test]
    fn free_releases_storage() {
        let mut table = Table::new();
        table.set(key(0, 0), Value::Nil);
        table.free();
        assert_eq!(table.capacity(), 0);
        assert_eq!(table.count(), 0);
        assert!(table.is_empty());
    }
}
