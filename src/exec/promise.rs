use crate::sync::{Arc, Condvar, Mutex};
use std::any::Any;

/// Payload of a completed task: the return value, or the panic payload of a
/// task that unwound.
type Outcome<R> = Result<R, Box<dyn Any + Send + 'static>>;

struct Shared<R> {
    outcome: Mutex<Option<Outcome<R>>>,
    condition: Condvar,
}

/// Completion side of a posted task. Consumed exactly once by the worker
/// (or the polling thread) that ran the task.
pub(crate) struct Promise<R> {
    shared: Arc<Shared<R>>,
}

impl<R> Promise<R> {
    pub(crate) fn set(self, outcome: Outcome<R>) {
        let mut slot = self.shared.outcome.lock().unwrap();
        debug_assert!(slot.is_none(), "promise completed twice");
        *slot = Some(outcome);
        drop(slot);
        self.shared.condition.notify_all();
    }
}

/// Handle to the eventual result of a task posted to a thread pool.
///
/// A task that panicked completes its future with the panic payload;
/// [`get`](TaskFuture::get) resumes the unwind on the calling thread.
pub struct TaskFuture<R> {
    shared: Arc<Shared<R>>,
}

impl<R> TaskFuture<R> {
    pub(crate) fn pair() -> (Promise<R>, TaskFuture<R>) {
        let shared = Arc::new(Shared {
            outcome: Mutex::new(None),
            condition: Condvar::new(),
        });
        (
            Promise {
                shared: shared.clone(),
            },
            TaskFuture { shared },
        )
    }

    /// True once the task has completed (normally or by panic).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.outcome.lock().unwrap().is_some()
    }

    /// Block until the task has completed.
    pub fn wait(&self) {
        let mut outcome = self.shared.outcome.lock().unwrap();
        while outcome.is_none() {
            outcome = self.shared.condition.wait(outcome).unwrap();
        }
    }

    /// Take the result without blocking. Returns `None` while the task is
    /// still pending.
    ///
    /// # Panics
    ///
    /// Resumes the task's panic if it unwound.
    #[must_use]
    pub fn try_get(&self) -> Option<R> {
        let outcome = self.shared.outcome.lock().unwrap().take()?;
        match outcome {
            Ok(value) => Some(value),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Block until the task has completed and return its value.
    ///
    /// # Panics
    ///
    /// Resumes the task's panic if it unwound, and panics if the result was
    /// already taken via [`try_get`](Self::try_get).
    #[must_use]
    pub fn get(self) -> R {
        self.wait();
        self.try_get().expect("task result was already taken")
    }
}

/// Wait for completion of all tasks, represented by their futures.
pub fn wait_all<R>(futures: &[TaskFuture<R>]) {
    for future in futures {
        future.wait();
    }
}
