//! Loom-based concurrency tests.
//!
//! Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
//!
//! Exercises the lock-free freelist, the semaphore and the queue cell
//! protocol under every thread interleaving loom can explore.
//!
//! # Design notes
//!
//! Loom enumerates interleavings exhaustively, so:
//!   - Thread counts are kept at 2 (state space is exponential).
//!   - Loop iterations are minimised to 1-2 per thread.
//!   - The full `ThreadPool` is not modeled directly: its queue holds 1024
//!     tracked atomics, which blows up the state space. The cell
//!     claim/advance protocol is modeled standalone instead.
#[cfg(loom)]
mod tests {
    use crate::exec::free_list::FixedSizeFreeList;
    use crate::exec::semaphore::Semaphore;
    use crate::sync::atomic::{AtomicU32, Ordering};
    use crate::sync::Arc;

    const INVALID: u32 = u32::MAX;

    fn bounded(preemption: usize) -> loom::model::Builder {
        let mut builder = loom::model::Builder::new();
        builder.preemption_bound = Some(preemption);
        builder
    }

    // =====================================================================
    // 1. FixedSizeFreeList
    // =====================================================================

    #[test]
    fn loom_free_list_concurrent_create_unique() {
        bounded(3).check(|| {
            let list = Arc::new(FixedSizeFreeList::<u32>::new(4, 4));

            let l1 = list.clone();
            let t1 = loom::thread::spawn(move || l1.create(1).unwrap());
            let l2 = list.clone();
            let t2 = loom::thread::spawn(move || l2.create(2).unwrap());

            let a = t1.join().unwrap();
            let b = t2.join().unwrap();
            assert_ne!(a, b, "two threads claimed the same slot");

            // Safety: both indices are live and owned here.
            unsafe {
                let mut values = [*list.get(a), *list.get(b)];
                values.sort_unstable();
                assert_eq!(values, [1, 2]);
                list.destroy(a);
                list.destroy(b);
            }
        });
    }

    #[test]
    fn loom_free_list_create_destroy_race() {
        bounded(2).check(|| {
            let list = Arc::new(FixedSizeFreeList::<u32>::new(4, 4));

            let l1 = list.clone();
            let t1 = loom::thread::spawn(move || {
                let idx = l1.create(10).unwrap();
                // Safety: idx belongs to this thread.
                unsafe { l1.destroy(idx) };
            });
            let l2 = list.clone();
            let t2 = loom::thread::spawn(move || {
                let idx = l2.create(20).unwrap();
                // Safety: idx belongs to this thread.
                unsafe { l2.destroy(idx) };
            });
            t1.join().unwrap();
            t2.join().unwrap();

            // the list is fully reusable afterwards
            let a = list.create(30).unwrap();
            let b = list.create(40).unwrap();
            assert_ne!(a, b);
            // Safety: Test code.
            unsafe {
                assert_eq!(*list.get(a), 30);
                assert_eq!(*list.get(b), 40);
                list.destroy(a);
                list.destroy(b);
            }
        });
    }

    // =====================================================================
    // 2. Semaphore
    // =====================================================================

    #[test]
    fn loom_semaphore_handoff() {
        bounded(2).check(|| {
            let sem = Arc::new(Semaphore::new(0));

            let s = sem.clone();
            let consumer = loom::thread::spawn(move || s.acquire());

            sem.release(1);
            consumer.join().unwrap();
            assert!(!sem.try_acquire());
        });
    }

    #[test]
    fn loom_semaphore_two_waiters() {
        bounded(2).check(|| {
            let sem = Arc::new(Semaphore::new(0));

            let s1 = sem.clone();
            let t1 = loom::thread::spawn(move || s1.acquire());
            let s2 = sem.clone();
            let t2 = loom::thread::spawn(move || s2.acquire());

            sem.release(2);
            t1.join().unwrap();
            t2.join().unwrap();
            assert!(!sem.try_acquire());
        });
    }

    // =====================================================================
    // 3. Queue cell protocol (standalone model of the thread pool ring)
    // =====================================================================

    #[test]
    fn loom_queue_cell_single_claim() {
        // two consumers race to claim one published cell; exactly one wins
        bounded(3).check(|| {
            let cell = Arc::new(AtomicU32::new(7));

            let c1 = cell.clone();
            let t1 = loom::thread::spawn(move || c1.swap(INVALID, Ordering::AcqRel));
            let c2 = cell.clone();
            let t2 = loom::thread::spawn(move || c2.swap(INVALID, Ordering::AcqRel));

            let a = t1.join().unwrap();
            let b = t2.join().unwrap();

            let claims = u32::from(a != INVALID) + u32::from(b != INVALID);
            assert_eq!(claims, 1, "cell claimed twice or lost");
        });
    }

    #[test]
    fn loom_queue_publish_advance() {
        // two producers publish into a 2-cell ring; both cells end up
        // holding distinct indices and the tail reaches 2
        bounded(3).check(|| {
            let queue = Arc::new([AtomicU32::new(INVALID), AtomicU32::new(INVALID)]);
            let tail = Arc::new(AtomicU32::new(0));

            let publish = |queue: Arc<[AtomicU32; 2]>, tail: Arc<AtomicU32>, index: u32| loop {
                let old_tail = tail.load(Ordering::Acquire);
                let cell = &queue[(old_tail as usize) & 1];
                let success = cell
                    .compare_exchange(INVALID, index, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok();
                let _ = tail.compare_exchange(
                    old_tail,
                    old_tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                if success {
                    return;
                }
            };

            let (q1, t1) = (queue.clone(), tail.clone());
            let p1 = loom::thread::spawn(move || publish(q1, t1, 1));
            let (q2, t2) = (queue.clone(), tail.clone());
            let p2 = loom::thread::spawn(move || publish(q2, t2, 2));
            p1.join().unwrap();
            p2.join().unwrap();

            assert_eq!(tail.load(Ordering::Acquire), 2);
            let a = queue[0].load(Ordering::Acquire);
            let b = queue[1].load(Ordering::Acquire);
            assert!(a != INVALID && b != INVALID);
            assert_ne!(a, b, "an index was published twice");
        });
    }
}
