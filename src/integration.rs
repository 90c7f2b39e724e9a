#[cfg(all(test, not(loom)))]
mod tests {
    use crate::exec::promise::wait_all;
    use crate::sync::Arc;
    use crate::{
        Allocator, BuddyPool, BuddyPoolCreateInfo, MemoryCache, MemoryCacheCreateInfo, TaskFuture,
        ThreadPool,
    };
    use std::ptr::NonNull;

    #[test]
    fn test_tasks_share_buddy_pool() {
        let allocator: Arc<dyn Allocator> = BuddyPool::create(BuddyPoolCreateInfo::new(1 << 22));
        let pool = ThreadPool::new(4);

        let futures: Vec<TaskFuture<bool>> = (0..64)
            .map(|i: usize| {
                let alloc = allocator.clone();
                pool.post(move || {
                    let num_bytes = 512 << (i % 4);
                    let Some(ptr) = alloc.allocate(num_bytes) else {
                        return false;
                    };
                    let fill = (i & 0xFF) as u8;
                    // Safety: Test code; the allocation spans num_bytes.
                    unsafe {
                        std::ptr::write_bytes(ptr.as_ptr(), fill, num_bytes);
                        let intact = std::slice::from_raw_parts(ptr.as_ptr(), num_bytes)
                            .iter()
                            .all(|&b| b == fill);
                        alloc.free(ptr);
                        intact
                    }
                })
            })
            .collect();

        wait_all(&futures);
        assert!(futures.into_iter().all(TaskFuture::get));
        assert_eq!(allocator.state().num_bytes_used, 0);
    }

    #[test]
    fn test_tasks_share_memory_cache() {
        let allocator: Arc<dyn Allocator> = MemoryCache::create(MemoryCacheCreateInfo::default());
        let pool = ThreadPool::new(2);

        let futures: Vec<TaskFuture<bool>> = (0..32)
            .map(|i: usize| {
                let alloc = allocator.clone();
                pool.post(move || {
                    let num_bytes = 4096 * (1 + i % 3);
                    let Some(ptr) = alloc.allocate(num_bytes) else {
                        return false;
                    };
                    // Safety: Test code.
                    unsafe {
                        ptr.as_ptr().write(0xEE);
                        let intact = ptr.as_ptr().read() == 0xEE;
                        alloc.free(ptr);
                        intact
                    }
                })
            })
            .collect();

        wait_all(&futures);
        assert!(futures.into_iter().all(TaskFuture::get));
        assert_eq!(allocator.state().num_bytes_used, 0);

        // everything freed by the tasks is now recyclable
        allocator.shrink();
        assert_eq!(allocator.state().num_bytes_allocated, 0);
    }

    #[test]
    fn test_in_place_construction() {
        // two-step placement: the allocator yields raw storage, the caller
        // constructs in place and destroys explicitly before free
        let allocator = MemoryCache::create(MemoryCacheCreateInfo::default());

        let raw = allocator.allocate(size_of::<[u64; 8]>()).unwrap();
        let ptr = raw.as_ptr().cast::<[u64; 8]>();
        // Safety: Test code; the chunk is at least size_of::<[u64; 8]>()
        // bytes and cache-line aligned.
        unsafe {
            ptr.write([7; 8]);
            assert_eq!((*ptr)[3], 7);
            std::ptr::drop_in_place(ptr);
            allocator.free(NonNull::new(ptr.cast::<u8>()).unwrap());
        }
    }
}
