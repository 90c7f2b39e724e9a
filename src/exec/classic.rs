use super::promise::TaskFuture;
use crate::sync::thread::{self, JoinHandle};
use crate::sync::{Arc, Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Scheduling priority of a posted task. Workers always take from the
/// highest-priority non-empty queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    High = 0,
    Default = 1,
}

const NUM_PRIORITIES: usize = 2;

type TaskFn = Box<dyn FnOnce() + Send + 'static>;

struct ClassicState {
    running: bool,
    queues: [VecDeque<TaskFn>; NUM_PRIORITIES],
}

impl ClassicState {
    /// Grab a task from the highest-priority non-empty queue.
    fn pop_highest(&mut self) -> Option<TaskFn> {
        self.queues.iter_mut().find_map(VecDeque::pop_front)
    }
}

struct ClassicShared {
    state: Mutex<ClassicState>,
    condition: Condvar,
}

/// Mutex/condvar thread pool with per-priority task queues.
///
/// The simpler sibling of [`ThreadPool`](crate::ThreadPool): a mutex
/// protects one deque per priority level and a condvar wakes workers.
/// A pool with zero threads runs its tasks via [`poll`](ClassicThreadPool::poll).
pub struct ClassicThreadPool {
    shared: Arc<ClassicShared>,
    threads: Vec<JoinHandle<()>>,
}

impl Default for ClassicThreadPool {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ClassicThreadPool {
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        let mut pool = Self {
            shared: Arc::new(ClassicShared {
                state: Mutex::new(ClassicState {
                    running: false,
                    queues: [VecDeque::new(), VecDeque::new()],
                }),
                condition: Condvar::new(),
            }),
            threads: Vec::new(),
        };
        pool.start(num_threads);
        pool
    }

    fn start(&mut self, num_threads: usize) {
        if num_threads == 0 {
            return;
        }
        self.shared.state.lock().unwrap().running = true;

        for _ in 0..num_threads {
            let shared = self.shared.clone();
            self.threads.push(thread::spawn(move || {
                loop {
                    let task = {
                        let mut state = shared.state.lock().unwrap();
                        loop {
                            if let Some(task) = state.pop_highest() {
                                break task;
                            }
                            // exit once stopped and nothing is left to run
                            if !state.running {
                                return;
                            }
                            state = shared.condition.wait(state).unwrap();
                        }
                    };
                    // run outside the lock; invokers contain panics
                    task();
                }
            }));
        }
        tracing::debug!(num_threads, "classic thread pool started");
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

    /// Post work with [`Priority::Default`].
    pub fn post<F, R>(&self, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.post_with_priority(Priority::Default, f)
    }

    /// Post work to the queue of the given priority.
    pub fn post_with_priority<F, R>(&self, priority: Priority, f: F) -> TaskFuture<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise, future) = TaskFuture::pair();
        let invoker: TaskFn = Box::new(move || {
            promise.set(catch_unwind(AssertUnwindSafe(f)));
        });

        self.shared.state.lock().unwrap().queues[priority as usize].push_back(invoker);
        self.shared.condition.notify_one();
        future
    }

    /// Manually run all queued tasks, useful when this pool has no threads.
    /// Returns the number of tasks processed.
    pub fn poll(&self) -> usize {
        if !self.threads.is_empty() {
            return 0;
        }

        let mut num_processed = 0;
        loop {
            // pop under the lock, run outside it, so tasks may repost
            let task = self.shared.state.lock().unwrap().pop_highest();
            match task {
                Some(task) => {
                    task();
                    num_processed += 1;
                }
                None => break,
            }
        }
        num_processed
    }

    /// Stop execution and join all threads. Workers finish the remaining
    /// queued tasks before exiting; anything left after that (zero-thread
    /// use) is drained on the calling thread.
    pub fn join_all(&mut self) {
        self.shared.state.lock().unwrap().running = false;
        self.shared.condition.notify_all();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.poll();
    }
}

impl Drop for ClassicThreadPool {
    fn drop(&mut self) {
        self.join_all();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::exec::promise::wait_all;
    use crate::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_basic_completion() {
        let mut pool = ClassicThreadPool::new(2);
        assert_eq!(pool.num_threads(), 2);

        let futures: Vec<TaskFuture<usize>> = (0..16).map(|i| pool.post(move || i * i)).collect();
        wait_all(&futures);
        for (i, future) in futures.into_iter().enumerate() {
            assert_eq!(future.get(), i * i);
        }

        pool.set_num_threads(4);
        assert_eq!(pool.num_threads(), 4);
        let futures: Vec<TaskFuture<usize>> = (0..16).map(|i| pool.post(move || i + 1)).collect();
        for (i, future) in futures.into_iter().enumerate() {
            assert_eq!(future.get(), i + 1);
        }
    }

    #[test]
    fn test_priority_order_when_polled() {
        let pool = ClassicThreadPool::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["default-1", "default-2"] {
            let o = order.clone();
            drop(pool.post(move || o.lock().unwrap().push(label)));
        }
        for label in ["high-1", "high-2"] {
            let o = order.clone();
            drop(pool.post_with_priority(Priority::High, move || o.lock().unwrap().push(label)));
        }

        assert_eq!(pool.poll(), 4);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["high-1", "high-2", "default-1", "default-2"]
        );
    }

    #[test]
    fn test_poll_noop_with_threads() {
        let pool = ClassicThreadPool::new(1);
        let future = pool.post(|| 5u32);
        // polling a threaded pool does nothing; the worker runs the task
        let _ = pool.poll();
        assert_eq!(future.get(), 5);
    }

    #[test]
    fn test_join_drains_pending() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ClassicThreadPool::new(2);
        for _ in 0..32 {
            let c = counter.clone();
            drop(pool.post(move || c.fetch_add(1, Ordering::Relaxed)));
        }
        pool.join_all();
        assert_eq!(counter.load(Ordering::Relaxed), 32);

        // a second join is a no-op
        pool.join_all();
        assert_eq!(pool.num_threads(), 0);
    }

    #[test]
    fn test_panic_propagates_through_future() {
        let pool = ClassicThreadPool::new(1);
        let bad = pool.post(|| -> u32 { panic!("task failed") });
        let good = pool.post(|| 11u32);

        let result = std::panic::catch_unwind(AssertUnwindSafe(move || bad.get()));
        assert!(result.is_err());
        assert_eq!(good.get(), 11);
    }
}
