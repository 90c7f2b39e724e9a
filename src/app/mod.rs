pub mod precise_sleep;

use crate::exec::thread_pool::ThreadPool;
use crate::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use precise_sleep::PreciseSleep;
use std::time::{Duration, Instant};

/// Parameters for creating an [`Application`].
#[derive(Clone, Debug)]
pub struct ApplicationCreateInfo {
    /// pace the loop to `target_loop_frequency`
    pub loop_throttling: bool,

    /// desired loop frequency in Hz (0: unpaced)
    pub target_loop_frequency: f64,

    /// commandline arguments provided at application start
    pub arguments: Vec<String>,

    /// worker threads of the background queue
    pub num_background_threads: usize,
}

impl Default for ApplicationCreateInfo {
    fn default() -> Self {
        Self {
            loop_throttling: false,
            target_loop_frequency: 0.0,
            arguments: Vec::new(),
            num_background_threads: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
                .max(1),
        }
    }
}

/// Callbacks driven by [`Application::run`]. Implemented by the host
/// application.
pub trait AppDelegate {
    /// Called once before the first loop iteration.
    fn setup(&mut self, app: &Application);

    /// Called every loop iteration with the elapsed seconds since the
    /// previous one.
    fn update(&mut self, app: &Application, delta_seconds: f64);

    /// Called once after the loop has stopped.
    fn teardown(&mut self, app: &Application);

    /// Called every loop iteration before [`update`](Self::update).
    fn poll_events(&mut self, app: &Application);
}

// ---------------------------------------------------------------------------
// SIGINT hook
//
// A process-wide slot holds a pointer to the running-flag of the active
// application. It is set by run() and cleared again on exit; the handler
// itself touches nothing but the atomic.
// ---------------------------------------------------------------------------
#[cfg(all(unix, not(loom)))]
mod signal {
    use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

    static SHUTDOWN_FLAG: AtomicPtr<AtomicBool> = AtomicPtr::new(std::ptr::null_mut());

    extern "C" fn handle_sigint(_signum: libc::c_int) {
        let flag = SHUTDOWN_FLAG.load(Ordering::Acquire);
        if !flag.is_null() {
            // Safety: the pointee outlives registration; run() clears the
            // slot before the flag goes away.
            unsafe { (*flag).store(false, Ordering::Release) };
        }
    }

    pub(super) fn install(running: &AtomicBool) {
        SHUTDOWN_FLAG.store(
            std::ptr::from_ref(running).cast_mut(),
            Ordering::Release,
        );
        let handler = handle_sigint as extern "C" fn(libc::c_int);
        // Safety: FFI call to signal(2) with a handler that only performs
        // async-signal-safe atomic stores.
        unsafe { libc::signal(libc::SIGINT, handler as libc::sighandler_t) };
    }

    pub(super) fn clear() {
        SHUTDOWN_FLAG.store(std::ptr::null_mut(), Ordering::Release);
    }
}

#[cfg(not(all(unix, not(loom))))]
mod signal {
    use crate::sync::atomic::AtomicBool;

    pub(super) fn install(_running: &AtomicBool) {}
    pub(super) fn clear() {}
}

/// Application loop driver.
///
/// Owns two thread pools: a zero-thread `main_queue` polled once per loop
/// iteration on the calling thread, and a threaded `background_queue`.
/// The loop calls the delegate's `poll_events`/`update` hooks until
/// something clears the running flag (the delegate, or SIGINT).
pub struct Application {
    running: AtomicBool,
    return_code: AtomicI32,

    loop_throttling: AtomicBool,
    /// f64 bit pattern, Hz
    target_loop_frequency: AtomicU64,
    /// f64 bit pattern, seconds
    avg_loop_time: AtomicU64,
    timing_interval: f64,

    args: Vec<String>,
    start_time: Instant,

    main_queue: ThreadPool,
    background_queue: ThreadPool,
}

impl Application {
    #[must_use]
    pub fn new(create_info: ApplicationCreateInfo) -> Self {
        Self {
            running: AtomicBool::new(false),
            return_code: AtomicI32::new(0),
            loop_throttling: AtomicBool::new(create_info.loop_throttling),
            target_loop_frequency: AtomicU64::new(create_info.target_loop_frequency.to_bits()),
            avg_loop_time: AtomicU64::new(0.0f64.to_bits()),
            timing_interval: 1.0,
            args: create_info.arguments,
            start_time: Instant::now(),
            main_queue: ThreadPool::new(0),
            background_queue: ThreadPool::new(create_info.num_background_threads.max(1)),
        }
    }

    /// Drive `setup / poll_events / update / teardown` in a loop. Returns
    /// the process exit code, or -1 if the application is already running.
    pub fn run(&self, delegate: &mut dyn AppDelegate) -> i32 {
        if self.running.swap(true, Ordering::AcqRel) {
            return -1;
        }
        signal::install(&self.running);
        tracing::debug!("application loop starting");

        // user setup-hook
        delegate.setup(self);

        let mut sleeper = PreciseSleep::new();
        let mut last_timestamp = Instant::now();
        let mut last_avg = last_timestamp;
        let mut fps_timestamp = last_timestamp;
        let mut num_loop_iterations: usize = 0;

        // main loop
        while self.running.load(Ordering::Acquire) {
            let time_stamp = Instant::now();

            // poll the main queue if no separate worker-threads exist
            if self.main_queue.num_threads() == 0 {
                self.main_queue.poll();
            }

            // poll input events
            delegate.poll_events(self);

            // time elapsed since last frame
            let time_delta = (time_stamp - last_timestamp).as_secs_f64();
            delegate.update(self, time_delta);
            last_timestamp = time_stamp;

            // rolling average over the timing interval
            num_loop_iterations += 1;
            let diff = (last_timestamp - last_avg).as_secs_f64();
            if diff > self.timing_interval {
                let avg = diff / num_loop_iterations as f64;
                self.avg_loop_time.store(avg.to_bits(), Ordering::Relaxed);
                tracing::trace!(avg_loop_time = avg, "timing interval");
                num_loop_iterations = 0;
                last_avg = last_timestamp;
            }

            // loop pacing
            let target = self.target_loop_frequency();
            if self.loop_throttling.load(Ordering::Relaxed) && target > 0.0 {
                let desired = 1.0 / target;
                let actual = fps_timestamp.elapsed().as_secs_f64();
                if actual < desired {
                    sleeper.sleep(Duration::from_secs_f64(desired - actual));
                }
            }
            fps_timestamp = Instant::now();
        }

        // manage teardown, save stuff etc.
        delegate.teardown(self);

        signal::clear();
        self.running.store(false, Ordering::Release);
        tracing::debug!("application loop finished");

        self.return_code.load(Ordering::Acquire)
    }

    /// True while the loop in [`run`](Self::run) is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the loop to stop after the current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Set the exit code returned by [`run`](Self::run).
    pub fn set_return_code(&self, code: i32) {
        self.return_code.store(code, Ordering::Release);
    }

    #[must_use]
    pub fn loop_throttling(&self) -> bool {
        self.loop_throttling.load(Ordering::Relaxed)
    }

    pub fn set_loop_throttling(&self, enabled: bool) {
        self.loop_throttling.store(enabled, Ordering::Relaxed);
    }

    /// Desired loop frequency in Hz (0: unpaced).
    #[must_use]
    pub fn target_loop_frequency(&self) -> f64 {
        f64::from_bits(self.target_loop_frequency.load(Ordering::Relaxed))
    }

    pub fn set_target_loop_frequency(&self, hz: f64) {
        self.target_loop_frequency.store(hz.to_bits(), Ordering::Relaxed);
    }

    /// Seconds since the application was created.
    #[must_use]
    pub fn application_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Current average time per loop-iteration in seconds.
    #[must_use]
    pub fn current_loop_time(&self) -> f64 {
        f64::from_bits(self.avg_loop_time.load(Ordering::Relaxed))
    }

    /// The commandline arguments provided at application start.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// This queue is processed by the main thread, once per loop iteration.
    #[must_use]
    pub fn main_queue(&self) -> &ThreadPool {
        &self.main_queue
    }

    /// The background queue is processed by a background threadpool.
    #[must_use]
    pub fn background_queue(&self) -> &ThreadPool {
        &self.background_queue
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const NUM_RUNS: u32 = 100;

    #[derive(Default)]
    struct CountingDelegate {
        setup_complete: bool,
        teardown_complete: bool,
        background_task_complete: bool,
        main_queue_task_complete: bool,
        num_updates: u32,
        num_poll_events: u32,
    }

    impl AppDelegate for CountingDelegate {
        fn setup(&mut self, _app: &Application) {
            self.setup_complete = true;
        }

        fn update(&mut self, app: &Application, _delta_seconds: f64) {
            self.num_updates += 1;
            if self.num_updates >= NUM_RUNS {
                app.stop();
            }
        }

        fn teardown(&mut self, app: &Application) {
            self.teardown_complete = true;
            let future = app.background_queue().post(|| true);
            self.background_task_complete = future.get();
        }

        fn poll_events(&mut self, _app: &Application) {
            self.num_poll_events += 1;
        }
    }

    #[test]
    fn test_basic_run() {
        let app = Application::new(ApplicationCreateInfo::default());
        let mut delegate = CountingDelegate::default();

        assert_eq!(app.run(&mut delegate), 0);
        assert!(delegate.setup_complete);
        assert!(delegate.teardown_complete);
        assert!(delegate.background_task_complete);
        assert_eq!(delegate.num_updates, NUM_RUNS);
        assert_eq!(delegate.num_poll_events, delegate.num_updates);
        assert!(!app.is_running());
    }

    #[test]
    fn test_main_queue_polled_by_loop() {
        use crate::sync::Arc;

        struct MainQueueDelegate {
            inner: CountingDelegate,
            ran: Arc<AtomicBool>,
        }
        impl AppDelegate for MainQueueDelegate {
            fn setup(&mut self, app: &Application) {
                self.inner.setup(app);
                let ran = self.ran.clone();
                app.main_queue()
                    .post_no_track(move || ran.store(true, Ordering::Release));
            }
            fn update(&mut self, app: &Application, delta: f64) {
                // the task posted during setup ran on the first iteration,
                // before poll_events/update
                if self.inner.num_updates == 0 {
                    self.inner.main_queue_task_complete = self.ran.load(Ordering::Acquire);
                }
                self.inner.update(app, delta);
            }
            fn teardown(&mut self, app: &Application) {
                self.inner.teardown(app);
            }
            fn poll_events(&mut self, app: &Application) {
                self.inner.poll_events(app);
            }
        }

        let app = Application::new(ApplicationCreateInfo::default());
        assert_eq!(app.main_queue().num_threads(), 0);
        assert!(app.background_queue().num_threads() >= 1);

        let mut delegate = MainQueueDelegate {
            inner: CountingDelegate::default(),
            ran: Arc::new(AtomicBool::new(false)),
        };
        assert_eq!(app.run(&mut delegate), 0);
        assert!(delegate.inner.main_queue_task_complete);
    }

    #[test]
    fn test_return_code() {
        struct QuitDelegate;
        impl AppDelegate for QuitDelegate {
            fn setup(&mut self, _app: &Application) {}
            fn update(&mut self, app: &Application, _delta: f64) {
                app.set_return_code(3);
                app.stop();
            }
            fn teardown(&mut self, _app: &Application) {}
            fn poll_events(&mut self, _app: &Application) {}
        }

        let app = Application::new(ApplicationCreateInfo::default());
        assert_eq!(app.run(&mut QuitDelegate), 3);
    }

    #[test]
    fn test_loop_pacing() {
        struct PacedDelegate {
            num_updates: u32,
        }
        impl AppDelegate for PacedDelegate {
            fn setup(&mut self, _app: &Application) {}
            fn update(&mut self, app: &Application, _delta: f64) {
                self.num_updates += 1;
                if self.num_updates >= 10 {
                    app.stop();
                }
            }
            fn teardown(&mut self, _app: &Application) {}
            fn poll_events(&mut self, _app: &Application) {}
        }

        let app = Application::new(ApplicationCreateInfo {
            loop_throttling: true,
            target_loop_frequency: 200.0,
            ..ApplicationCreateInfo::default()
        });
        assert!(app.loop_throttling());
        assert_eq!(app.target_loop_frequency(), 200.0);

        let start = Instant::now();
        assert_eq!(app.run(&mut PacedDelegate { num_updates: 0 }), 0);
        // 10 iterations at 200 Hz: at least 9 paced gaps of 5 ms
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_arguments() {
        let app = Application::new(ApplicationCreateInfo {
            arguments: vec!["app".into(), "--flag".into()],
            ..ApplicationCreateInfo::default()
        });
        assert_eq!(app.args(), ["app", "--flag"]);
        assert!(app.application_time() >= 0.0);
    }
}
