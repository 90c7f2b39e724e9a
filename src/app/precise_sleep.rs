use std::time::{Duration, Instant};

/// Sleep for a duration with high precision.
///
/// OS sleeps overshoot by a jitter that depends on scheduler and timer
/// granularity. This keeps a running estimate of the real cost of a 1 ms
/// sleep (Welford's online mean/variance) and only sleeps while the
/// remaining time exceeds `mean + stddev`; the rest is spin-waited on the
/// monotonic clock.
///
/// See <https://blat-blatnik.github.io/computerBear/making-accurate-sleep-function/>
pub struct PreciseSleep {
    estimate: f64,
    mean: f64,
    m2: f64,
    count: u64,
}

impl Default for PreciseSleep {
    fn default() -> Self {
        Self::new()
    }
}

impl PreciseSleep {
    #[must_use]
    pub fn new() -> Self {
        Self {
            estimate: 5e-3,
            mean: 5e-3,
            m2: 0.0,
            count: 1,
        }
    }

    /// Sleep for `duration`, adaptively mixing OS sleeps and spinning.
    pub fn sleep(&mut self, duration: Duration) {
        let mut seconds = duration.as_secs_f64();

        while seconds > self.estimate {
            let start = Instant::now();
            std::thread::sleep(Duration::from_millis(1));
            let observed = start.elapsed().as_secs_f64();
            seconds -= observed;

            // increment, handle overflow
            self.count = self.count.wrapping_add(1).max(2);

            let delta = observed - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (observed - self.mean);
            let stddev = (self.m2 / (self.count - 1) as f64).sqrt();
            self.estimate = self.mean + stddev;
        }

        // spin off the remainder
        let start = Instant::now();
        while start.elapsed().as_secs_f64() < seconds {
            std::hint::spin_loop();
        }
    }
}
