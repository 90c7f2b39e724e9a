use super::free_list::{FixedSizeFreeList, INVALID_INDEX};
use super::promise::TaskFuture;
use super::semaphore::Semaphore;
use crate::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use crate::sync::thread::{self, JoinHandle};
use crate::sync::Arc;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Capacity of the task queue and the backing task pool.
const QUEUE_SIZE: usize = 1024;
const _: () = assert!(QUEUE_SIZE.is_power_of_two());

/// Cache-line-sized wrapper to keep hot cursors off each other's lines.
#[repr(align(64))]
struct CacheAligned<T>(T);

/// A posted task: the bound invoker, taken out of the slot exactly once by
/// whichever thread claims it from the queue.
struct Task {
    invoker: Option<Box<dyn FnOnce() + Send + 'static>>,
}

struct PoolShared {
    /// slot storage for posted tasks
    tasks: FixedSizeFreeList<Task>,

    /// ring of task slot indices; [`INVALID_INDEX`] marks an empty cell
    queue: Box<[AtomicU32]>,

    /// per-worker read cursors
    heads: Box<[CacheAligned<AtomicU32>]>,

    /// write cursor; slot index is `tail & (QUEUE_SIZE - 1)`
    tail: CacheAligned<AtomicU32>,

    /// wakes worker threads
    semaphore: Semaphore,

    quit: AtomicBool,
}

impl PoolShared {
    fn new(num_threads: usize) -> Self {
        let mut queue = Vec::with_capacity(QUEUE_SIZE);
        for _ in 0..QUEUE_SIZE {
            queue.push(AtomicU32::new(INVALID_INDEX));
        }
        let mut heads = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            heads.push(CacheAligned(AtomicU32::new(0)));
        }

        Self {
            tasks: FixedSizeFreeList::new(QUEUE_SIZE as u32, QUEUE_SIZE as u32),
            queue: queue.into_boxed_slice(),
            heads: heads.into_boxed_slice(),
            tail: CacheAligned(AtomicU32::new(0)),
            semaphore: Semaphore::new(0),
            quit: AtomicBool::new(false),
        }
    }

    /// Minimum read cursor across all workers.
    fn min_head(&self) -> u32 {
        let mut head = self.tail.0.load(Ordering::Acquire);
        for h in self.heads.iter() {
            head = head.min(h.0.load(Ordering::Acquire));
        }
        head
    }

    /// Run and release the task stored at `index`.
    fn run_task(&self, index: u32) {
        // Safety: claiming the index from the queue transferred exclusive
        // ownership of the slot to this thread.
        unsafe {
            let task = self.tasks.get_mut(index);
            if let Some(invoker) = task.invoker.take() {
                // invokers never unwind (they catch panics into the future)
                invoker();
            }
            self.tasks.destroy(index);
        }
    }

    /// Publish a task index into the queue.
    fn queue_task(&self, task_index: u32) {
        // Read the head first because otherwise the tail can already have
        // passed it. It only needs refreshing when the queue looks full,
        // since computing it iterates over all workers.
        let mut head = self.min_head();

        loop {
            let mut old_tail = self.tail.0.load(Ordering::Acquire);

            if old_tail.wrapping_sub(head) >= QUEUE_SIZE as u32 {
                head = self.min_head();
                old_tail = self.tail.0.load(Ordering::Acquire);

                if old_tail.wrapping_sub(head) >= QUEUE_SIZE as u32 {
                    // wake all workers so they clear any claimed-but-unread
                    // cells, then wait for their head cursors to advance
                    self.semaphore.release(self.heads.len() as u32);
                    backoff();
                    continue;
                }
            }

            // write the task index if the cell is empty
            let cell = &self.queue[(old_tail as usize) & (QUEUE_SIZE - 1)];
            let success = cell
                .compare_exchange(
                    INVALID_INDEX,
                    task_index,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok();

            // advance the tail regardless of which producer wrote the cell;
            // a failure just means a concurrent producer already moved it
            let _ = self.tail.0.compare_exchange(
                old_tail,
                old_tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );

            if success {
                return;
            }
        }
    }

    /// Sequentially claim and run every published task. Returns the number
    /// of tasks executed.
    fn poll(&self) -> usize {
        let mut num_processed = 0;
        let mut head = 0u32;
        while head != self.tail.0.load(Ordering::Acquire) {
            let cell = &self.queue[(head as usize) & (QUEUE_SIZE - 1)];
            let index = cell.swap(INVALID_INDEX, Ordering::AcqRel);
            if index != INVALID_INDEX {
                self.run_task(index);
                num_processed += 1;
            }
            head = head.wrapping_add(1);
        }
        num_processed
    }

    fn worker(&self, thread_index: usize) {
        let head = &self.heads[thread_index].0;

        while !self.quit.load(Ordering::Acquire) {
            // wait for jobs
            self.semaphore.acquire();

            // loop over the queue
            loop {
                let h = head.load(Ordering::Relaxed);
                if h == self.tail.0.load(Ordering::Acquire) {
                    break;
                }

                // exchange any task index we find with the empty marker
                let cell = &self.queue[(h as usize) & (QUEUE_SIZE - 1)];
                if cell.load(Ordering::Acquire) != INVALID_INDEX {
                    let index = cell.swap(INVALID_INDEX, Ordering::AcqRel);
                    if index != INVALID_INDEX {
                        self.run_task(index);
                    }
                }
                head.store(h.wrapping_add(1), Ordering::Release);
            }
        }
    }
}

#[cfg(not(loom))]
fn backoff() {
    std::thread::sleep(std::time::Duration::from_micros(100));
}

#[cfg(loom)]
fn backoff() {
    loom::thread::yield_now();
}

/// Work-stealing-style thread pool over a lock-free SPMC ring buffer of
/// task handles.
///
/// Posted tasks live in a fixed-size freelist; workers claim queue cells by
/// exchanging them with the empty marker, so producer FIFO order is visible
/// via the tail cursor but execution order across workers is unspecified.
///
/// A pool with zero threads still accepts [`post`](ThreadPool::post); its
/// tasks run when a caller invokes [`poll`](ThreadPool::poll).
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Vec<JoinHandle<()>>,
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ThreadPool {
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        let mut pool = Self {
            shared: Arc::new(PoolShared::new(0)),
            threads: Vec::new(),
        };
        pool.start(num_threads);
        pool
    }

    fn start(&mut self, num_threads: usize) {
        self.shared = Arc::new(PoolShared::new(num_threads));

        for thread_index in 0..num_threads {
            let shared = self.shared.clone();
            self.threads
                .push(thread::spawn(move || shared.worker(thread_index)));
        }
        if num_threads > 0 {
            tracing::debug!(num_threads, "thread pool started");
        }
    }

    /// The number of worker threads.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Set the number of worker threads. Implies [`join_all`](Self::join_all).
    pub fn set_num_threads(&mut self, num_threads: usize) {
        self.join_all();
        self.start(num_threads);
    }

    /// Post work to be processed by the pool. Returns a future holding the
    /// task's return value.
    pub fn post<F, R>(&self, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise, future) = TaskFuture::pair();
        self.post_invoker(Box::new(move || {
            promise.set(catch_unwind(AssertUnwindSafe(f)));
        }));
        future
    }

    /// Fire-and-forget variant of [`post`](Self::post). A panicking task is
    /// contained and logged.
    pub fn post_no_track<F, R>(&self, f: F)
    where
        F: FnOnce() -> R + Send + 'static,
    {
        self.post_invoker(Box::new(move || {
            if catch_unwind(AssertUnwindSafe(|| drop(f()))).is_err() {
                tracing::debug!("untracked task panicked");
            }
        }));
    }

    fn post_invoker(&self, invoker: Box<dyn FnOnce() + Send + 'static>) {
        // loop until we can get a slot from the free list; the pool is
        // pre-sized to the queue capacity, so running dry means callers
        // outpace task completion
        let mut task = Task {
            invoker: Some(invoker),
        };
        let index = loop {
            match self.shared.tasks.create(task) {
                Ok(index) => break index,
                Err(returned) => {
                    debug_assert!(false, "task slots exhausted");
                    task = returned;
                    thread::yield_now();
                }
            }
        };

        self.shared.queue_task(index);
        self.shared.semaphore.release(1);
    }

    /// Manually run all queued tasks, useful when this pool has no threads.
    /// Returns the number of tasks processed.
    pub fn poll(&self) -> usize {
        self.shared.poll()
    }

    /// Stop execution and join all threads. Already-queued tasks are still
    /// executed (drained on the calling thread after the workers exit).
    pub fn join_all(&mut self) {
        // signal threads that we want to stop and wake them up
        self.shared.quit.store(true, Ordering::Release);
        self.shared.semaphore.release(self.threads.len() as u32);

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }

        let drained = self.shared.poll();
        if drained > 0 {
            tracing::trace!(drained, "ran residual tasks during join");
        }

        // reset cursors
        for head in self.shared.heads.iter() {
            head.0.store(0, Ordering::Release);
        }
        self.shared.tail.0.store(0, Ordering::Release);
        self.shared.quit.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn tail_value(&self) -> u32 {
        self.shared.tail.0.load(Ordering::Acquire)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join_all();
    }
}
