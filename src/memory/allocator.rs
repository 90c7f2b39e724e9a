use crate::sync::Arc;
use crate::util;
use std::ptr::NonNull;

/// Backing allocation callable, shared so sinks can outlive a single holder.
pub type AllocFn = Arc<dyn Fn(usize) -> *mut u8 + Send + Sync>;

/// Backing deallocation callable, matched to an [`AllocFn`].
pub type DeallocFn = Arc<dyn Fn(*mut u8) + Send + Sync>;

/// Aggregate describing the current state of an [`Allocator`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorState {
    /// total number of internal allocations held.
    pub num_allocations: usize,

    /// total number of internally allocated bytes.
    pub num_bytes_allocated: usize,

    /// total number of bytes in active (client-) allocations.
    pub num_bytes_used: usize,
}

/// A polymorphic memory resource.
///
/// Concrete implementations ([`BuddyPool`](crate::BuddyPool),
/// [`MemoryCache`](crate::MemoryCache)) are internally locked; shared
/// handles are `Arc<dyn Allocator>`.
///
/// Allocators never panic on exhaustion: `allocate` reports failure by
/// returning `None` and `state()` keeps counting.
pub trait Allocator: Send + Sync {
    /// Allocate a contiguous block of memory.
    ///
    /// Returns `None` if the request cannot be served.
    fn allocate(&self, num_bytes: usize) -> Option<NonNull<u8>>;

    /// Free a block of memory previously returned by this allocator.
    ///
    /// Pointers not owned by this allocator are ignored.
    ///
    /// # Safety
    /// - `ptr` must not be used after this call if it was owned by this
    ///   allocator.
    /// - `ptr` must not be freed again.
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// Release cached/unused memory without disturbing live allocations.
    fn shrink(&self);

    /// Return a summary of the allocator's internal state.
    fn state(&self) -> AllocatorState;
}

/// Default backing allocation: cache-line-aligned system malloc.
#[must_use]
pub fn system_alloc_fn() -> AllocFn {
    Arc::new(|num_bytes| util::aligned_alloc(num_bytes, util::CACHE_LINE_SIZE))
}

/// Default backing deallocation, matched to [`system_alloc_fn`].
#[must_use]
pub fn system_dealloc_fn() -> DeallocFn {
    Arc::new(|ptr| {
        // Safety: only pointers produced by the paired alloc fn reach here.
        unsafe { util::aligned_free(ptr) };
    })
}
