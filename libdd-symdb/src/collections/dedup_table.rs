// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{Rewrite, Rewrites, SetHasher};
use crate::symbols::Symbol;
use crate::SymdbError;
use hashbrown::HashTable;
use parking_lot::{RwLock, RwLockReadGuard};
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Inner<T> {
    items: Vec<T>,
    /// Indexes into `items`, hashed by value.
    index: HashTable<u32>,
}

impl<T: Symbol> Inner<T> {
    fn find(&self, hash: u64, value: &T) -> Option<u32> {
        let items = &self.items;
        self.index
            .find(hash, |&id| items[id as usize] == *value)
            .copied()
    }

    /// Appends `value`, which must not be in the table yet.
    fn insert_unique(&mut self, hash: u64, value: T) -> Result<u32, SymdbError> {
        let id = u32::try_from(self.items.len())
            .map_err(|_| SymdbError::other("symbol table is full"))?;
        let Inner { items, index } = self;
        items.try_reserve(1)?;
        index.try_reserve(1, |&i| SetHasher::default().hash_one(&items[i as usize]))?;
        items.push(value);
        index.insert_unique(hash, id, |&i| {
            SetHasher::default().hash_one(&items[i as usize])
        });
        Ok(id)
    }
}

/// An append-only, deduplicating symbol table. Values get dense ids in
/// insertion order and keep them for the lifetime of the table.
///
/// The table is seeded with the default value at id 0, so that a reference
/// of 0 means "none": the empty string, no mapping, no function.
pub struct DedupTable<T> {
    inner: RwLock<Inner<T>>,
    size: AtomicUsize,
}

impl<T: Symbol> Default for DedupTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Symbol> DedupTable<T> {
    pub fn new() -> Self {
        let empty = T::default();
        let size = empty.size();
        let mut inner = Inner {
            items: Vec::new(),
            index: HashTable::new(),
        };
        let hash = SetHasher::default().hash_one(&empty);
        inner.items.push(empty);
        inner.index.insert_unique(hash, 0, |_| hash);
        Self {
            inner: RwLock::new(inner),
            size: AtomicUsize::new(size),
        }
    }

    /// Number of values, the seeded default included.
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    /// A table always holds at least its seeded default value.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Approximate number of bytes held by the values.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn get(&self, id: u32) -> Option<T> {
        self.inner.read().items.get(id as usize).cloned()
    }

    /// Returns the id of `value` if it is in the table.
    pub fn find(&self, value: &T) -> Option<u32> {
        let hash = SetHasher::default().hash_one(value);
        self.inner.read().find(hash, value)
    }

    /// Read access to the values, in id order. Writers are blocked while the
    /// guard is held.
    pub fn items(&self) -> TableGuard<'_, T> {
        TableGuard(self.inner.read())
    }

    /// Copies the values, in id order.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.read().items.clone()
    }

    /// Rewrites the foreign references of `elems` and adds the values that
    /// are not in the table yet. Returns the table id of every element, by
    /// position.
    ///
    /// Lookups are done under the read lock; only the values that were not
    /// found are looked up again and inserted under the write lock.
    pub fn ingest(&self, elems: Vec<T>, rewrites: &Rewrites) -> Result<Vec<u32>, SymdbError>
    where
        T: Rewrite,
    {
        let mut elems = elems;
        for elem in elems.iter_mut() {
            elem.rewrite(rewrites)?;
        }
        let hashes: Vec<u64> = elems
            .iter()
            .map(|e| SetHasher::default().hash_one(e))
            .collect();

        let mut ids = vec![0u32; elems.len()];
        let mut missing = Vec::new();
        {
            let inner = self.inner.read();
            for (i, (elem, &hash)) in elems.iter().zip(&hashes).enumerate() {
                match inner.find(hash, elem) {
                    Some(id) => ids[i] = id,
                    None => missing.push(i),
                }
            }
        }
        if missing.is_empty() {
            return Ok(ids);
        }

        let mut inner = self.inner.write();
        let mut added = 0;
        for i in missing {
            let hash = hashes[i];
            // Another writer, or an earlier duplicate in `elems`, may have
            // inserted the value since the read pass.
            ids[i] = match inner.find(hash, &elems[i]) {
                Some(id) => id,
                None => {
                    let value = std::mem::take(&mut elems[i]);
                    added += value.size();
                    inner.insert_unique(hash, value)?
                }
            };
        }
        self.size.fetch_add(added, Ordering::Relaxed);
        Ok(ids)
    }

    /// Looks up or inserts every value of `elems` as is, and appends their
    /// ids to `dst`.
    pub fn append(&self, dst: &mut Vec<u32>, elems: &[T]) -> Result<(), SymdbError> {
        dst.try_reserve(elems.len())?;
        let mut inner = self.inner.write();
        let mut added = 0;
        for elem in elems {
            let hash = SetHasher::default().hash_one(elem);
            let id = match inner.find(hash, elem) {
                Some(id) => id,
                None => {
                    added += elem.size();
                    inner.insert_unique(hash, elem.clone())?
                }
            };
            dst.push(id);
        }
        self.size.fetch_add(added, Ordering::Relaxed);
        Ok(())
    }
}

/// Shared access to the values of a [`DedupTable`].
pub struct TableGuard<'a, T>(RwLockReadGuard<'a, Inner<T>>);

impl<T> std::ops::Deref for TableGuard<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::{Function, Line, Location};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn seeded_with_default() {
        let table = DedupTable::<String>::new();
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(&String::new()), Some(0));
        let ids = table
            .ingest(strings(&["", "a", "b", "a"]), &Rewrites::default())
            .unwrap();
        assert_eq!(ids, vec![0, 1, 2, 1]);
        assert_eq!(&*table.items(), &strings(&["", "a", "b"])[..]);
    }

    #[test]
    fn ingest_is_idempotent() {
        let table = DedupTable::<String>::new();
        let values = strings(&["foo", "bar", "foo", "baz"]);
        let first = table.ingest(values.clone(), &Rewrites::default()).unwrap();
        let size = table.size();
        let second = table.ingest(values, &Rewrites::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(table.len(), 4);
        assert_eq!(size, table.size());
    }

    #[test]
    fn ingest_rewrites_references() {
        let mut rewrites = Rewrites::default();
        rewrites.functions.insert(100, 1);
        let table = DedupTable::<Location>::new();
        let loc = |function_id| Location {
            lines: vec![Line { function_id, line: 7 }],
            ..Default::default()
        };
        let ids = table.ingest(vec![loc(100)], &rewrites).unwrap();
        assert_eq!(ids, vec![1]);
        assert_eq!(table.get(1), Some(loc(1)));
        assert!(table.ingest(vec![loc(101)], &rewrites).is_err());
    }

    #[test]
    fn append_does_not_rewrite() {
        let table = DedupTable::<Function>::new();
        let f = Function {
            name: 9,
            ..Default::default()
        };
        let mut ids = Vec::new();
        table.append(&mut ids, &[f, Function::default(), f]).unwrap();
        assert_eq!(ids, vec![1, 0, 1]);
        assert_eq!(table.get(1), Some(f));
    }

    #[test]
    fn concurrent_ingest() {
        let table = Arc::new(DedupTable::<String>::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let values: Vec<String> = (0..200).map(|i| format!("s{}", (i * (t + 1)) % 100)).collect();
                    let ids = table.ingest(values.clone(), &Rewrites::default()).unwrap();
                    for (v, id) in values.iter().zip(ids) {
                        assert_eq!(table.get(id).as_ref(), Some(v));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 101);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: if cfg!(miri) { 4 } else { 64 },
            .. ProptestConfig::default()
        })]

        #[test]
        fn proptest_dense_ids(values in proptest::collection::vec("[a-c]{0,3}", 0..64)) {
            let table = DedupTable::<String>::new();
            let ids = table.ingest(values.clone(), &Rewrites::default()).unwrap();
            let items = table.snapshot();
            for (v, &id) in values.iter().zip(&ids) {
                prop_assert_eq!(&items[id as usize], v);
            }
            let mut distinct = values.clone();
            distinct.push(String::new());
            distinct.sort();
            distinct.dedup();
            prop_assert_eq!(items.len(), distinct.len());
        }
    }

    #[test]
    fn auto_traits_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}
        require_send::<DedupTable<Location>>();
        require_sync::<DedupTable<Location>>();
    }
}
