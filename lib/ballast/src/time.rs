use std::time::{Duration, Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    since_epoch().as_secs()
}

/// Returns the current unix timestamp in milliseconds.
#[inline]
pub fn timestamp_millis() -> u64 {
    let elapsed = since_epoch();
    elapsed.as_secs() * 1000 + u64::from(elapsed.subsec_millis())
}

#[inline]
fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("System clock predates the unix epoch")
}

/// Monotonic stopwatch. Wall-clock adjustments have no effect on it.
pub struct Timer {
    started: Instant,
}

impl Timer {
    #[inline]
    pub fn start() -> Timer {
        Timer {
            started: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[inline]
    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }
}
