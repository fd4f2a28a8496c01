use std::{
    borrow::Borrow,
    fmt,
    hash::Hash,
    sync::{
        atomic::{AtomicU32, Ordering},
        OnceLock,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::error::PoolError;

/// Largest index a pool hands out. Indices travel through the RLE log, which
/// reserves the top bit of every word.
pub const MAX_POOL_INDEX: u32 = 0x7FFF_FFFF;

// Segment `k` holds `1 << (k + FIRST_SEGMENT_BITS)` slots, so 27 segments
// cover the whole 31-bit index space without ever moving a published value.
const FIRST_SEGMENT_BITS: u32 = 5;
const SEGMENT_COUNT: usize = (32 - FIRST_SEGMENT_BITS) as usize;

struct Segments<T> {
    segments: [OnceLock<Box<[OnceLock<T>]>>; SEGMENT_COUNT],
}

#[inline]
fn locate(index: u32) -> (usize, usize) {
    let adjusted = index as u64 + (1 << FIRST_SEGMENT_BITS);
    let bit = 63 - adjusted.leading_zeros();
    let segment = (bit - FIRST_SEGMENT_BITS) as usize;
    let offset = (adjusted - (1 << bit)) as usize;
    (segment, offset)
}

impl<T> Segments<T> {
    fn new() -> Self {
        Segments {
            segments: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    fn publish(&self, index: u32, value: T) {
        let (segment, offset) = locate(index);
        let slots = self.segments[segment].get_or_init(|| {
            let size = 1usize << (segment as u32 + FIRST_SEGMENT_BITS);
            (0..size).map(|_| OnceLock::new()).collect()
        });
        // Each index is reserved exactly once, so the slot is always empty.
        let _ = slots[offset].set(value);
    }

    fn get(&self, index: u32) -> Option<&T> {
        let (segment, offset) = locate(index);
        self.segments[segment].get()?.get(offset)?.get()
    }
}

/// Append-only interning table.
///
/// The first value inserted owns its index forever; value-equal inserts
/// return that same index. Reads never take a lock. Inserts take a short
/// shard lock in the dedup index, which only ever contends with other
/// inserts hashing to the same shard.
pub struct ConstantPool<T> {
    name: &'static str,
    index: DashMap<T, u32>,
    slots: Segments<T>,
    next: AtomicU32,
}

impl<T> ConstantPool<T>
where
    T: Eq + Hash + Clone,
{
    pub fn new(name: &'static str) -> Self {
        ConstantPool {
            name,
            index: DashMap::new(),
            slots: Segments::new(),
            next: AtomicU32::new(0),
        }
    }

    /// Returns the index of `value`, inserting it if it has not been seen.
    pub fn get_or_insert<Q>(&self, value: &Q) -> Result<u32, PoolError>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = T> + ?Sized,
    {
        if let Some(index) = self.index.get(value) {
            return Ok(*index);
        }
        match self.index.entry(value.to_owned()) {
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                let index = self
                    .next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n <= MAX_POOL_INDEX).then_some(n + 1)
                    })
                    .map_err(|_| PoolError::Exhausted { pool: self.name })?;
                // Publish before the index becomes discoverable through the
                // map, so anyone holding an index can always resolve it.
                self.slots.publish(index, entry.key().clone());
                entry.insert(index);
                Ok(index)
            }
        }
    }

    /// O(1) lookup. `None` for indices this pool never handed out.
    pub fn get(&self, index: u32) -> Option<&T> {
        if index > MAX_POOL_INDEX {
            return None;
        }
        self.slots.get(index)
    }

    pub fn len(&self) -> usize {
        self.next.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> fmt::Debug for ConstantPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantPool")
            .field("name", &self.name)
            .field("len", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}
