use crate::sync::{Condvar, Mutex};

/// Counting semaphore used to signal worker threads.
///
/// Built on a mutex/condvar pair so it stays modelable under loom; the
/// fast path is a single short critical section.
pub struct Semaphore {
    count: Mutex<u32>,
    condition: Condvar,
}

impl Semaphore {
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            condition: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.condition.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Take a permit if one is available without blocking.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Make `n` permits available and wake up to `n` waiters.
    pub fn release(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut count = self.count.lock().unwrap();
        *count += n;
        drop(count);

        if n == 1 {
            self.condition.notify_one();
        } else {
            self.condition.notify_all();
        }
    }
}
