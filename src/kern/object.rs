//! Fixed-size id -> object tables
//!
//! An [`ObjectTable`] hands out dense integer ids for shared objects.
//! Slots hold `Arc` clones: inserting takes a reference, removing drops
//! it, and lookups clone a fresh reference under the lock so the caller
//! always sees a live object even if a concurrent remove races with it.
//! Reference drops that may free the object happen outside the table
//! lock.

use alloc::sync::Arc;

use crate::kern::lock::SpinLock;
use crate::types::ObjectId;

pub struct ObjectTable<T, const N: usize> {
    slots: SpinLock<[Option<Arc<T>>; N]>,
}

impl<T, const N: usize> ObjectTable<T, N> {
    pub const fn new() -> Self {
        Self {
            slots: SpinLock::new([const { None }; N]),
        }
    }

    /// Store a reference to `object` in the first free slot and return
    /// its id. Returns `None` when the table is full; the table is left
    /// unchanged in that case.
    pub fn insert(&self, object: &Arc<T>) -> Option<ObjectId> {
        let mut slots = self.slots.lock();
        for (id, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(object.clone());
                return Some(id);
            }
        }
        None
    }

    /// Drop the table's reference for `id`. Unknown ids are a no-op.
    /// The reference is released after the table lock is dropped, so an
    /// object destructor never runs under the lock.
    pub fn remove(&self, id: ObjectId) {
        let victim = {
            let mut slots = self.slots.lock();
            match slots.get_mut(id) {
                Some(slot) => slot.take(),
                None => None,
            }
        };
        drop(victim);
    }

    /// Return a new reference to the object at `id`, if any
    pub fn lookup(&self, id: ObjectId) -> Option<Arc<T>> {
        let slots = self.slots.lock();
        slots.get(id).and_then(|slot| slot.clone())
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total capacity
    pub const fn capacity(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let table: ObjectTable<u32, 4> = ObjectTable::new();

        let obj = Arc::new(7u32);
        let id = table.insert(&obj).unwrap();
        assert_eq!(Arc::strong_count(&obj), 2);

        let found = table.lookup(id).unwrap();
        assert!(Arc::ptr_eq(&found, &obj));
        assert_eq!(Arc::strong_count(&obj), 3);
        drop(found);

        table.remove(id);
        assert_eq!(Arc::strong_count(&obj), 1);
        assert!(table.lookup(id).is_none());
    }

    #[test]
    fn test_capacity_exhaustion() {
        let table: ObjectTable<u32, 2> = ObjectTable::new();

        let a = Arc::new(1u32);
        let b = Arc::new(2u32);
        let c = Arc::new(3u32);

        assert!(table.insert(&a).is_some());
        assert!(table.insert(&b).is_some());

        // The table is full; the insert fails without taking a reference.
        assert!(table.insert(&c).is_none());
        assert_eq!(Arc::strong_count(&c), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let table: ObjectTable<u32, 2> = ObjectTable::new();
        table.remove(0);
        table.remove(99);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_are_reused() {
        let table: ObjectTable<u32, 2> = ObjectTable::new();

        let a = Arc::new(1u32);
        let id = table.insert(&a).unwrap();
        table.remove(id);

        let b = Arc::new(2u32);
        assert_eq!(table.insert(&b), Some(id));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(64))]

        // Arbitrary insert/remove interleavings: lookups always agree
        // with a shadow model and every reference taken is returned.
        #[test]
        fn prop_slots_track_references(
            ops in proptest::collection::vec((0u8..2, 0usize..6), 1..100),
        ) {
            use proptest::prelude::{prop_assert, prop_assert_eq};

            let table: ObjectTable<u32, 4> = ObjectTable::new();
            let pool: alloc::vec::Vec<Arc<u32>> =
                (0..4u32).map(Arc::new).collect();
            let mut model: [Option<(ObjectId, usize)>; 4] = [None; 4];

            for (op, arg) in ops {
                match op {
                    0 => {
                        let victim = arg % 4;
                        if !model.iter().flatten().any(|(_, v)| *v == victim) {
                            if let Some(id) = table.insert(&pool[victim]) {
                                let slot = model.iter_mut().find(|s| s.is_none()).unwrap();
                                *slot = Some((id, victim));
                            }
                        }
                    }
                    _ => {
                        if let Some((id, _)) = model[arg % 4].take() {
                            table.remove(id);
                        }
                    }
                }

                for entry in model.iter().flatten() {
                    let found = table.lookup(entry.0);
                    prop_assert!(found.is_some());
                    prop_assert!(Arc::ptr_eq(&found.unwrap(), &pool[entry.1]));
                }
            }

            // Release everything; each object ends with exactly the
            // pool's reference.
            for entry in model.iter_mut() {
                if let Some((id, _)) = entry.take() {
                    table.remove(id);
                }
            }
            for object in pool.iter() {
                prop_assert_eq!(Arc::strong_count(object), 1);
            }
        }
    }

    #[test]
    fn test_release_fires_once() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Probe;

        impl Drop for Probe {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let table: ObjectTable<Probe, 2> = ObjectTable::new();
        let obj = Arc::new(Probe);
        let id = table.insert(&obj).unwrap();

        drop(obj);
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);

        table.remove(id);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }
}
