use super::allocator::{
    system_alloc_fn, system_dealloc_fn, AllocFn, Allocator, AllocatorState, DeallocFn,
};
use crate::sync::{Arc, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;

/// Parameters for creating a [`MemoryCache`].
#[derive(Clone)]
pub struct MemoryCacheCreateInfo {
    /// minimum size in bytes for an allocation (defaults to 4kB)
    pub min_size: usize,

    /// maximum size-tolerance for recycling free chunks
    pub size_tolerance: f32,

    /// callable to perform backing allocations with
    pub alloc_fn: AllocFn,

    /// callable to perform backing de-allocations with
    pub dealloc_fn: DeallocFn,
}

impl Default for MemoryCacheCreateInfo {
    fn default() -> Self {
        Self {
            min_size: 1 << 12,
            size_tolerance: 2.0,
            alloc_fn: system_alloc_fn(),
            dealloc_fn: system_dealloc_fn(),
        }
    }
}

struct CacheInner {
    /// freed chunks, organized by size. Values are stacks of addresses.
    free_chunks: BTreeMap<usize, Vec<*mut u8>>,

    /// live chunks, keyed by address, value is the chunk's actual size.
    used_chunks: HashMap<usize, usize>,
}

/// Size-bucketed recycling allocator.
///
/// Freed chunks are kept in an ordered size map and handed back to later
/// allocations whose request fits within `size_tolerance`. Every address is
/// in exactly one of the two tables.
pub struct MemoryCache {
    format: MemoryCacheCreateInfo,
    inner: Mutex<CacheInner>,
}

// Safety: MemoryCache owns the chunks in both tables; all access is
// serialized by the inner mutex.
unsafe impl Send for MemoryCache {}
// Safety: same as above, shared references only reach the tables through
// the mutex.
unsafe impl Sync for MemoryCache {}

impl MemoryCache {
    #[must_use]
    pub fn new(create_info: MemoryCacheCreateInfo) -> Self {
        Self {
            format: create_info,
            inner: Mutex::new(CacheInner {
                free_chunks: BTreeMap::new(),
                used_chunks: HashMap::new(),
            }),
        }
    }

    /// Create a shared cache handle.
    #[must_use]
    pub fn create(create_info: MemoryCacheCreateInfo) -> Arc<Self> {
        Arc::new(Self::new(create_info))
    }

    fn shrink_inner(&self, inner: &mut CacheInner) {
        for (_, chunks) in std::mem::take(&mut inner.free_chunks) {
            for ptr in chunks {
                (self.format.dealloc_fn)(ptr);
            }
        }
    }
}

impl Allocator for MemoryCache {
    fn allocate(&self, num_bytes: usize) -> Option<NonNull<u8>> {
        if num_bytes == 0 {
            return None;
        }
        let num_bytes = num_bytes.max(self.format.min_size);

        let mut inner = self.inner.lock().unwrap();

        // upper bound for the accepted size of a recycled chunk
        let max_num_bytes =
            (num_bytes as f64 * f64::from(self.format.size_tolerance.max(1.0))) as usize;

        // smallest free chunk that is large enough
        let found = inner
            .free_chunks
            .range(num_bytes..)
            .next()
            .map(|(&size, _)| size);

        if let Some(size) = found {
            if size <= max_num_bytes {
                let chunks = inner.free_chunks.get_mut(&size)?;
                let ptr = chunks.pop()?;
                if chunks.is_empty() {
                    inner.free_chunks.remove(&size);
                }
                inner.used_chunks.insert(ptr as usize, size);
                return NonNull::new(ptr);
            }
        }

        // nothing suitable cached, allocate fresh
        let mut ptr = (self.format.alloc_fn)(num_bytes);
        if ptr.is_null() {
            // release all cached chunks and retry once
            self.shrink_inner(&mut inner);
            ptr = (self.format.alloc_fn)(num_bytes);
        }
        if ptr.is_null() {
            return None;
        }
        inner.used_chunks.insert(ptr as usize, num_bytes);
        NonNull::new(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock().unwrap();

        // move the chunk from the used table into the free table
        if let Some(size) = inner.used_chunks.remove(&(ptr.as_ptr() as usize)) {
            inner
                .free_chunks
                .entry(size)
                .or_default()
                .push(ptr.as_ptr());
        }
        // foreign pointer: ignored
    }

    fn shrink(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.shrink_inner(&mut inner);
    }

    fn state(&self) -> AllocatorState {
        let inner = self.inner.lock().unwrap();

        let num_bytes_used: usize = inner.used_chunks.values().sum();
        let num_bytes_free: usize = inner
            .free_chunks
            .iter()
            .map(|(size, chunks)| size * chunks.len())
            .sum();
        let num_free_chunks: usize = inner.free_chunks.values().map(Vec::len).sum();

        AllocatorState {
            num_allocations: num_free_chunks + inner.used_chunks.len(),
            num_bytes_allocated: num_bytes_used + num_bytes_free,
            num_bytes_used,
        }
    }
}

impl Drop for MemoryCache {
    fn drop(&mut self) {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, chunks) in std::mem::take(&mut inner.free_chunks) {
            for ptr in chunks {
                (self.format.dealloc_fn)(ptr);
            }
        }
        for (addr, _) in inner.used_chunks.drain() {
            (self.format.dealloc_fn)(addr as *mut u8);
        }
    }
}
