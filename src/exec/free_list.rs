use crate::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use crate::sync::cell::UnsafeCell;
use crate::sync::{unsafe_cell_get, unsafe_cell_get_mut, Mutex};
use crate::util;
#[cfg(all(debug_assertions, not(loom)))]
use fixedbitset::FixedBitSet;
use std::mem::MaybeUninit;

/// Index returned when the free list is exhausted.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Storage cell: an object slot plus the free-list link.
#[repr(C)]
struct Storage<T> {
    object: UnsafeCell<MaybeUninit<T>>,

    /// When the slot is free (or in the process of being freed as part of a
    /// batch) this holds the next free slot's index. When the slot is live
    /// it holds the slot's own index.
    next_free: AtomicU32,
}

/// A batch of slots chained for release in a single atomic operation.
///
/// Adding slots does not destroy or modify the objects; it merely links
/// them so [`FixedSizeFreeList::destroy_batch`] can splice the whole chain
/// onto the free list with one CAS.
#[derive(Debug)]
pub struct Batch {
    first: u32,
    last: u32,
    num_objects: u32,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            first: INVALID_INDEX,
            last: INVALID_INDEX,
            num_objects: 0,
        }
    }
}

impl Batch {
    #[must_use]
    pub fn num_objects(&self) -> u32 {
        self.num_objects
    }
}

/// Lock-free paged pool of fixed-size objects.
///
/// `create`/`destroy` are lock-free in steady state; a single internal
/// mutex serializes lazy page growth only. The 64-bit head packs a 32-bit
/// monotonic tag with the first free index; the tag increments on every
/// CAS so the list does not suffer from the ABA problem.
pub struct FixedSizeFreeList<T> {
    /// simple counter that makes the head update with every CAS
    allocation_tag: AtomicU32,

    /// packs `{tag:32, first_free_index:32}`
    first_free_object_and_tag: AtomicU64,

    /// size (in objects) of a single page, a power of two
    page_size: u32,

    /// bits to shift an object index right to get the page number
    page_shift: u32,

    /// mask to and an object index with to get the index inside the page
    object_mask: u32,

    /// total number of pages that are usable
    num_pages: u32,

    /// number of objects covered by allocated pages
    num_objects_allocated: AtomicU32,

    /// first object to use when the free list is empty (may require
    /// allocating a new page)
    first_free_object_in_new_page: AtomicU32,

    /// page table; entries are published with release stores under the
    /// page mutex
    pages: Box<[AtomicPtr<Storage<T>>]>,

    /// serializes page allocation only
    page_mutex: Mutex<()>,

    /// live-slot tracking backing the double-create/double-destroy
    /// assertions
    #[cfg(all(debug_assertions, not(loom)))]
    live: Mutex<FixedBitSet>,
}

// Safety: the list owns its pages; slot handoff is synchronized through
// the tagged head and per-slot next links.
unsafe impl<T: Send> Send for FixedSizeFreeList<T> {}
// Safety: same as above; shared references hand out slots exclusively.
unsafe impl<T: Send> Sync for FixedSizeFreeList<T> {}

impl<T> FixedSizeFreeList<T> {
    /// Create a list holding at most `max_objects`, grown in pages of
    /// `page_size` objects.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is zero or not a power of two.
    #[must_use]
    pub fn new(max_objects: u32, page_size: u32) -> Self {
        assert!(
            page_size > 0 && page_size.is_power_of_two(),
            "page_size must be a non-zero power of two"
        );

        let num_pages = max_objects.div_ceil(page_size);
        let mut pages = Vec::with_capacity(num_pages as usize);
        for _ in 0..num_pages {
            pages.push(AtomicPtr::new(std::ptr::null_mut()));
        }

        Self {
            allocation_tag: AtomicU32::new(1),
            first_free_object_and_tag: AtomicU64::new(u64::from(INVALID_INDEX)),
            page_size,
            page_shift: page_size.trailing_zeros(),
            object_mask: page_size - 1,
            num_pages,
            num_objects_allocated: AtomicU32::new(0),
            first_free_object_in_new_page: AtomicU32::new(0),
            pages: pages.into_boxed_slice(),
            page_mutex: Mutex::new(()),
            #[cfg(all(debug_assertions, not(loom)))]
            live: Mutex::new(FixedBitSet::with_capacity(num_pages as usize * page_size as usize)),
        }
    }

    /// Maximum number of objects the list can hold.
    #[must_use]
    pub fn max_objects(&self) -> u32 {
        self.num_pages * self.page_size
    }

    #[inline]
    fn storage_ptr(&self, index: u32) -> *mut Storage<T> {
        debug_assert!(index < self.num_objects_allocated.load(Ordering::Acquire));
        let page = self.pages[(index >> self.page_shift) as usize].load(Ordering::Acquire);
        debug_assert!(!page.is_null());
        // Safety: index & object_mask < page_size, inside the page.
        unsafe { page.add((index & self.object_mask) as usize) }
    }

    /// Allocate further pages until `index` is covered. Returns false when
    /// the configured maximum is reached.
    fn grow(&self, index: u32) -> bool {
        let _guard = self.page_mutex.lock().unwrap();

        while index >= self.num_objects_allocated.load(Ordering::Acquire) {
            let next_page = (self.num_objects_allocated.load(Ordering::Relaxed) / self.page_size)
                as usize;
            if next_page == self.num_pages as usize {
                return false; // out of space
            }

            let num_bytes = self.page_size as usize * size_of::<Storage<T>>();
            let alignment = align_of::<Storage<T>>().max(util::CACHE_LINE_SIZE);
            let page = util::aligned_alloc(num_bytes, alignment).cast::<Storage<T>>();
            if page.is_null() {
                return false;
            }

            // initialize every slot's fields before the page is published
            for i in 0..self.page_size as usize {
                // Safety: page covers page_size slots; nothing references
                // them before the release stores below.
                unsafe {
                    let slot = page.add(i);
                    std::ptr::addr_of_mut!((*slot).object)
                        .write(UnsafeCell::new(MaybeUninit::uninit()));
                    std::ptr::addr_of_mut!((*slot).next_free).write(AtomicU32::new(INVALID_INDEX));
                }
            }

            self.pages[next_page].store(page, Ordering::Release);
            self.num_objects_allocated
                .fetch_add(self.page_size, Ordering::Release);
        }
        true
    }

    #[cfg(all(debug_assertions, not(loom)))]
    fn mark_live(&self, index: u32) {
        let mut live = self.live.lock().unwrap();
        debug_assert!(!live.contains(index as usize), "slot is already live");
        live.insert(index as usize);
    }

    #[cfg(all(debug_assertions, not(loom)))]
    fn mark_free(&self, index: u32) {
        let mut live = self.live.lock().unwrap();
        debug_assert!(live.contains(index as usize), "double destroy of slot");
        live.set(index as usize, false);
    }

    /// Claim a slot and move `object` into it. Returns the slot index, or
    /// hands the object back if the list is full.
    pub fn create(&self, object: T) -> Result<u32, T> {
        let index = loop {
            // take the first object from the linked list
            let first_free_and_tag = self.first_free_object_and_tag.load(Ordering::Acquire);
            let first_free = first_free_and_tag as u32;

            if first_free == INVALID_INDEX {
                // the free list is empty, claim a slot never used before
                let index = self
                    .first_free_object_in_new_page
                    .fetch_add(1, Ordering::Relaxed);
                if index >= self.num_objects_allocated.load(Ordering::Acquire)
                    && !self.grow(index)
                {
                    return Err(object);
                }
                break index;
            }

            let storage = self.storage_ptr(first_free);
            // Safety: storage points at an allocated slot; the atomic load
            // is safe even while another thread claims the slot (the CAS
            // below detects that via the tag).
            let next_free = unsafe { (*storage).next_free.load(Ordering::Acquire) };

            let tag = self.allocation_tag.fetch_add(1, Ordering::Relaxed);
            let new_first_free_and_tag = u64::from(next_free) | (u64::from(tag) << 32);

            if self
                .first_free_object_and_tag
                .compare_exchange_weak(
                    first_free_and_tag,
                    new_first_free_and_tag,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break first_free;
            }
        };

        #[cfg(all(debug_assertions, not(loom)))]
        self.mark_live(index);

        let storage = self.storage_ptr(index);
        // Safety: the slot was claimed exclusively above.
        unsafe {
            unsafe_cell_get_mut!((*storage).object).write(object);
            // a live slot's next pointer holds its own index
            (*storage).next_free.store(index, Ordering::Release);
        }
        Ok(index)
    }

    /// Access a live object by index.
    ///
    /// # Safety
    /// - `index` must have been returned by [`create`](Self::create) and not
    ///   yet destroyed.
    /// - No concurrent mutable access to the same slot.
    #[must_use]
    pub unsafe fn get(&self, index: u32) -> &T {
        let storage = self.storage_ptr(index);
        // Safety: upheld by caller; the slot holds an initialized object.
        unsafe { unsafe_cell_get!((*storage).object).assume_init_ref() }
    }

    /// Mutably access a live object by index.
    ///
    /// # Safety
    /// - Same as [`get`](Self::get), plus exclusive access to the slot.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, index: u32) -> &mut T {
        let storage = self.storage_ptr(index);
        // Safety: upheld by caller; the slot holds an initialized object.
        unsafe { unsafe_cell_get_mut!((*storage).object).assume_init_mut() }
    }

    /// Destroy a live object and return its slot to the free list.
    ///
    /// # Safety
    /// - `index` must be live and not accessed concurrently.
    pub unsafe fn destroy(&self, index: u32) {
        debug_assert!(index != INVALID_INDEX);

        #[cfg(all(debug_assertions, not(loom)))]
        self.mark_free(index);

        let storage = self.storage_ptr(index);
        // Safety: slot is live and exclusively owned by the caller.
        unsafe { unsafe_cell_get_mut!((*storage).object).assume_init_drop() };

        loop {
            // make the current head the next pointer of the freed slot
            let first_free_and_tag = self.first_free_object_and_tag.load(Ordering::Acquire);
            let first_free = first_free_and_tag as u32;
            // Safety: storage stays valid; only this thread writes the link.
            unsafe { (*storage).next_free.store(first_free, Ordering::Release) };

            let tag = self.allocation_tag.fetch_add(1, Ordering::Relaxed);
            let new_first_free_and_tag = u64::from(index) | (u64::from(tag) << 32);

            if self
                .first_free_object_and_tag
                .compare_exchange_weak(
                    first_free_and_tag,
                    new_first_free_and_tag,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    /// Link a live slot into `batch` for a later [`destroy_batch`](Self::destroy_batch).
    ///
    /// # Safety
    /// - `index` must be live, owned by the caller, and not already batched.
    pub unsafe fn add_to_batch(&self, batch: &mut Batch, index: u32) {
        // trying to reuse a batch that has already been destroyed
        debug_assert!(batch.num_objects != u32::MAX, "batch was already destroyed");
        let storage = self.storage_ptr(index);
        // trying to batch a slot that is already in a free list
        debug_assert!(
            // Safety: the slot is allocated; relaxed read of the liveness marker.
            unsafe { (*storage).next_free.load(Ordering::Relaxed) } == index,
            "slot is not live"
        );

        if batch.first == INVALID_INDEX {
            batch.first = index;
        } else {
            let last = self.storage_ptr(batch.last);
            // Safety: batch.last is owned by this batch.
            unsafe { (*last).next_free.store(index, Ordering::Release) };
        }
        batch.last = index;
        batch.num_objects += 1;
    }

    /// Destroy every object in `batch` and splice the whole chain onto the
    /// free list in a single CAS.
    ///
    /// # Safety
    /// - All batched slots must still be owned by the caller.
    pub unsafe fn destroy_batch(&self, batch: &mut Batch) {
        if batch.first == INVALID_INDEX {
            return;
        }

        // call destructors; the chain ends at batch.last, whose link still
        // holds the liveness marker
        if std::mem::needs_drop::<T>() {
            let mut index = batch.first;
            loop {
                let storage = self.storage_ptr(index);
                #[cfg(all(debug_assertions, not(loom)))]
                self.mark_free(index);
                // Safety: batched slots are owned by the caller.
                unsafe { unsafe_cell_get_mut!((*storage).object).assume_init_drop() };
                if index == batch.last {
                    break;
                }
                // Safety: links inside a batch are stable.
                index = unsafe { (*storage).next_free.load(Ordering::Relaxed) };
            }
        } else {
            #[cfg(all(debug_assertions, not(loom)))]
            {
                let mut index = batch.first;
                loop {
                    self.mark_free(index);
                    if index == batch.last {
                        break;
                    }
                    let storage = self.storage_ptr(index);
                    // Safety: links inside a batch are stable.
                    index = unsafe { (*storage).next_free.load(Ordering::Relaxed) };
                }
            }
        }

        let last = self.storage_ptr(batch.last);
        loop {
            // make the current head the next pointer of the last batched slot
            let first_free_and_tag = self.first_free_object_and_tag.load(Ordering::Acquire);
            let first_free = first_free_and_tag as u32;
            // Safety: batch.last is owned until the CAS below succeeds.
            unsafe { (*last).next_free.store(first_free, Ordering::Release) };

            let tag = self.allocation_tag.fetch_add(1, Ordering::Relaxed);
            let new_first_free_and_tag = u64::from(batch.first) | (u64::from(tag) << 32);

            if self
                .first_free_object_and_tag
                .compare_exchange_weak(
                    first_free_and_tag,
                    new_first_free_and_tag,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // mark the batch as spent
                batch.first = INVALID_INDEX;
                batch.last = INVALID_INDEX;
                batch.num_objects = u32::MAX;
                return;
            }
        }
    }
}

impl<T> Drop for FixedSizeFreeList<T> {
    fn drop(&mut self) {
        // Live objects are not dropped here; destroying them is the owner's
        // responsibility before the list goes away.
        #[cfg(all(debug_assertions, not(loom)))]
        debug_assert!(
            self.live.lock().unwrap().count_ones(..) == 0,
            "free list dropped with live objects"
        );

        let num_pages = self.num_objects_allocated.load(Ordering::Acquire) / self.page_size;
        for page in 0..num_pages as usize {
            let ptr = self.pages[page].load(Ordering::Acquire);
            if !ptr.is_null() {
                // Safety: the page came from util::aligned_alloc in grow().
                unsafe { util::aligned_free(ptr.cast::<u8>()) };
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::atomic::AtomicUsize;
    use crate::sync::Arc;
    use std::collections::HashSet;

    #[test]
    fn test_create_get_destroy() {
        let list = FixedSizeFreeList::<u64>::new(64, 16);

        let a = list.create(11).unwrap();
        let b = list.create(22).unwrap();
        assert_ne!(a, b);

        // Safety: Test code; both indices are live.
        unsafe {
            assert_eq!(*list.get(a), 11);
            assert_eq!(*list.get(b), 22);
            *list.get_mut(a) += 1;
            assert_eq!(*list.get(a), 12);

            list.destroy(a);
            list.destroy(b);
        }
    }

    #[test]
    fn test_reuse_is_lifo() {
        let list = FixedSizeFreeList::<u32>::new(64, 16);
        let a = list.create(1).unwrap();
        // Safety: Test code.
        unsafe { list.destroy(a) };
        let b = list.create(2).unwrap();
        assert_eq!(a, b);
        // Safety: Test code.
        unsafe { list.destroy(b) };
    }

    #[test]
    fn test_exhaustion() {
        let list = FixedSizeFreeList::<u32>::new(8, 4);
        let mut indices = Vec::new();
        for i in 0..8 {
            indices.push(list.create(i).unwrap());
        }
        // a full list hands the object back
        assert_eq!(list.create(99).unwrap_err(), 99);

        // freed slots become available again
        // Safety: Test code.
        unsafe { list.destroy(indices.pop().unwrap()) };
        indices.push(list.create(100).unwrap());

        for idx in indices {
            // Safety: Test code.
            unsafe { list.destroy(idx) };
        }
    }

    #[test]
    fn test_page_growth() {
        // 4 pages of 4 objects, grown on demand
        let list = FixedSizeFreeList::<u32>::new(16, 4);
        let indices: Vec<u32> = (0..16).map(|i| list.create(i).unwrap()).collect();
        assert_eq!(indices.iter().collect::<HashSet<_>>().len(), 16);

        for (i, &idx) in indices.iter().enumerate() {
            // Safety: Test code.
            unsafe { assert_eq!(*list.get(idx), i as u32) };
        }
        for idx in indices {
            // Safety: Test code.
            unsafe { list.destroy(idx) };
        }
    }

    #[test]
    fn test_drop_runs_destructors() {
        let counter = Arc::new(AtomicUsize::new(0));

        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let list = FixedSizeFreeList::<Probe>::new(16, 16);
        let a = list.create(Probe(counter.clone())).ok().unwrap();
        let b = list.create(Probe(counter.clone())).ok().unwrap();

        // Safety: Test code.
        unsafe { list.destroy(a) };
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        // Safety: Test code.
        unsafe { list.destroy(b) };
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_batch_destroy() {
        let counter = Arc::new(AtomicUsize::new(0));

        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let list = FixedSizeFreeList::<Probe>::new(32, 8);
        let mut batch = Batch::default();
        for _ in 0..10 {
            let idx = list.create(Probe(counter.clone())).ok().unwrap();
            // Safety: Test code; idx is live and unbatched.
            unsafe { list.add_to_batch(&mut batch, idx) };
        }
        assert_eq!(batch.num_objects(), 10);

        // Safety: Test code.
        unsafe { list.destroy_batch(&mut batch) };
        assert_eq!(counter.load(Ordering::Relaxed), 10);

        // the spliced slots are reusable
        let indices: Vec<u32> = (0..10)
            .map(|_| list.create(Probe(counter.clone())).ok().unwrap())
            .collect();
        for idx in indices {
            // Safety: Test code.
            unsafe { list.destroy(idx) };
        }
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let list = FixedSizeFreeList::<u32>::new(8, 8);
        let mut batch = Batch::default();
        // Safety: Test code.
        unsafe { list.destroy_batch(&mut batch) };
        let idx = list.create(1).unwrap();
        // Safety: Test code.
        unsafe { list.destroy(idx) };
    }

    #[test]
    fn test_concurrent_create_uniqueness() {
        // no index may be handed to two threads at once
        const THREADS: usize = 8;
        const PER_THREAD: usize = 512;

        let list = Arc::new(FixedSizeFreeList::<usize>::new(
            (THREADS * PER_THREAD) as u32,
            64,
        ));
        let mut handles = Vec::new();

        for t in 0..THREADS {
            let l = list.clone();
            handles.push(crate::sync::thread::spawn(move || {
                let mut owned = Vec::with_capacity(PER_THREAD);
                for i in 0..PER_THREAD {
                    let idx = l.create(t * PER_THREAD + i).unwrap();
                    owned.push(idx);

                    // churn the free list a little
                    if i % 4 == 0 {
                        let victim = owned.swap_remove(owned.len() / 2);
                        // Safety: Test code; victim belongs to this thread.
                        unsafe { l.destroy(victim) };
                    }
                }
                owned
            }));
        }

        let mut all: Vec<u32> = Vec::new();
        for h in handles {
            all.extend(h.join().unwrap());
        }

        let unique: HashSet<u32> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "duplicate live index observed");

        for idx in all {
            // Safety: Test code.
            unsafe { list.destroy(idx) };
        }
    }
}
