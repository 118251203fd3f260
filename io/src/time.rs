use std::time::{Duration, Instant};

/// Monotonic time source. All loop timestamps are microseconds relative to
/// the clock's origin, so they fit `u64` for the lifetime of any process.
#[derive(Debug, Clone)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    /// Microseconds elapsed since the clock was created.
    #[inline]
    pub fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocking sleep helper for tools and tests. Never call this from a loop
/// callback.
pub fn sleep(dur: Duration) {
    std::thread::sleep(dur);
}
