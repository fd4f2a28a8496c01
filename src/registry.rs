use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_utils::Backoff;

pub type ThreadId = u64;

/// Set of threads the sampler should visit.
///
/// Holds a single atomic pointer to an immutable sorted array. Mutations copy
/// the array, edit the copy and CAS it in, retrying on contention. Readers
/// just load the pointer, so `snapshot` is wait-free and never sees a torn
/// update.
#[derive(Debug)]
pub struct ThreadRegistry {
    ids: ArcSwap<Vec<ThreadId>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry {
            ids: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Adds `id`. No-op if it is already tracked.
    pub fn track(&self, id: ThreadId) {
        self.update(|ids| match ids.binary_search(&id) {
            Ok(_) => None,
            Err(pos) => {
                let mut next = Vec::with_capacity(ids.len() + 1);
                next.extend_from_slice(&ids[..pos]);
                next.push(id);
                next.extend_from_slice(&ids[pos..]);
                Some(next)
            }
        })
    }

    /// Removes `id`. No-op if it is not tracked.
    pub fn untrack(&self, id: ThreadId) {
        self.update(|ids| match ids.binary_search(&id) {
            Ok(pos) => {
                let mut next = Vec::with_capacity(ids.len() - 1);
                next.extend_from_slice(&ids[..pos]);
                next.extend_from_slice(&ids[pos + 1..]);
                Some(next)
            }
            Err(_) => None,
        })
    }

    /// Sorted, duplicate-free view of the tracked set.
    pub fn snapshot(&self) -> Arc<Vec<ThreadId>> {
        self.ids.load_full()
    }

    pub fn is_tracked(&self, id: ThreadId) -> bool {
        self.ids.load().binary_search(&id).is_ok()
    }

    fn update<F>(&self, edit: F)
    where
        F: Fn(&[ThreadId]) -> Option<Vec<ThreadId>>,
    {
        let backoff = Backoff::new();
        loop {
            let current = self.ids.load_full();
            let Some(next) = edit(&current) else {
                return;
            };
            let previous = self.ids.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                return;
            }
            backoff.spin();
        }
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn track_and_untrack_are_idempotent() {
        let registry = ThreadRegistry::new();
        registry.track(5);
        registry.track(1);
        registry.track(3);
        registry.track(3);
        assert_eq!(*registry.snapshot(), vec![1, 3, 5]);

        registry.untrack(3);
        registry.untrack(42);
        assert_eq!(*registry.snapshot(), vec![1, 5]);
        assert!(registry.is_tracked(5));
        assert!(!registry.is_tracked(3));
    }

    #[test]
    fn snapshot_is_stable_after_mutation() {
        let registry = ThreadRegistry::new();
        registry.track(1);
        let before = registry.snapshot();
        registry.track(2);
        assert_eq!(*before, vec![1]);
        assert_eq!(*registry.snapshot(), vec![1, 2]);
    }

    #[test]
    fn concurrent_mutation_stays_sorted() {
        let registry = Arc::new(ThreadRegistry::new());
        let writers: Vec<_> = (0..8u64)
            .map(|t| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for round in 0..200u64 {
                        let id = t * 1000 + round;
                        registry.track(id);
                        if round % 2 == 1 {
                            registry.untrack(id);
                        }
                    }
                })
            })
            .collect();

        let reader = {
            let registry = registry.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    let snap = registry.snapshot();
                    assert!(snap.windows(2).all(|w| w[0] < w[1]));
                }
            })
        };

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        let expected: Vec<u64> = (0..8u64)
            .flat_map(|t| {
                (0..200u64)
                    .filter(|r| r % 2 == 0)
                    .map(move |r| t * 1000 + r)
            })
            .collect();
        assert_eq!(*registry.snapshot(), expected);
    }
}
