//! Object pools for the small, frequently churned allocations of the tree.
//!
//! Node splits and leaf reloads allocate and free coordinate cells and
//! fixed-size arrays at a high rate. Both pools hand out owned values
//! (`get`) and take them back (`release`); ownership of a pooled value
//! belongs to whoever currently holds it.

use parking_lot::Mutex;

/// Allocation counters of a pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Values created from scratch.
    pub allocated: u64,
    /// Values handed out from the free list.
    pub reused: u64,
    /// Values currently waiting in the free list.
    pub available: usize,
}

/// Batch allocator of boxed objects with free-list recycling.
pub struct ObjectPool<T> {
    /// Number of objects created when the free list runs dry.
    batch: usize,
    /// Maximum number of released objects kept.
    retain: usize,
    inner: Mutex<PoolInner<Box<T>>>,
}

struct PoolInner<V> {
    free_list: Vec<V>,
    allocated: u64,
    reused: u64,
}

impl<V> PoolInner<V> {
    fn new() -> Self {
        Self {
            free_list: Vec::new(),
            allocated: 0,
            reused: 0,
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated,
            reused: self.reused,
            available: self.free_list.len(),
        }
    }
}

impl<T: Default> ObjectPool<T> {
    /// Creates a pool allocating `batch` objects at a time and keeping at
    /// most `retain` released ones.
    pub fn new(batch: usize, retain: usize) -> Self {
        Self {
            batch: batch.max(1),
            retain,
            inner: Mutex::new(PoolInner::new()),
        }
    }

    /// Takes an object from the pool, allocating a batch if none is free.
    ///
    /// The object is reset to its default state.
    pub fn get(&self) -> Box<T> {
        let mut inner = self.inner.lock();
        if let Some(mut object) = inner.free_list.pop() {
            inner.reused += 1;
            *object = T::default();
            return object;
        }

        // Refill: one object goes out, the rest of the batch stays
        let refill = (self.batch - 1).min(self.retain);
        inner.free_list.reserve(refill);
        for _ in 0..refill {
            inner.free_list.push(Box::default());
        }
        inner.allocated += (refill + 1) as u64;
        Box::default()
    }

    /// Returns an object to the pool.
    pub fn release(&self, object: Box<T>) {
        let mut inner = self.inner.lock();
        if inner.free_list.len() < self.retain {
            inner.free_list.push(object);
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }
}

/// Pool of vectors that all share one preallocated capacity.
pub struct ArrayPool<T> {
    /// Capacity every handed-out array is guaranteed to have.
    array_len: usize,
    /// Maximum number of released arrays kept.
    retain: usize,
    inner: Mutex<PoolInner<Vec<T>>>,
}

impl<T> ArrayPool<T> {
    pub fn new(array_len: usize, retain: usize) -> Self {
        Self {
            array_len,
            retain,
            inner: Mutex::new(PoolInner::new()),
        }
    }

    /// Takes an empty array with at least `array_len` capacity.
    pub fn get(&self) -> Vec<T> {
        let mut inner = self.inner.lock();
        if let Some(array) = inner.free_list.pop() {
            inner.reused += 1;
            return array;
        }
        inner.allocated += 1;
        Vec::with_capacity(self.array_len)
    }

    /// Returns an array to the pool. Its contents are dropped.
    pub fn release(&self, mut array: Vec<T>) {
        array.clear();
        if array.capacity() < self.array_len {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.free_list.len() < self.retain {
            inner.free_list.push(array);
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }
}
