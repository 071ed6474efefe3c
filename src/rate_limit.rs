//! Bounds the rate at which operations are admitted.

use std::sync::Mutex;
use std::time::Duration;

use instant::Instant;

use crate::util::lock;

/// Admits at most `rate` operations per second, measured over windows of one
/// second.
///
/// Operations deferred past their window still count against the windows
/// they were deferred into, so a burst is spread out rather than forgotten.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u32,
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    start: Instant,
    count: u32,
}

const WINDOW: Duration = Duration::from_secs(1);

impl RateLimiter {
    pub fn new(rate: u32) -> Self {
        assert!(rate > 0, "rate must be positive");

        Self {
            rate,
            window: Mutex::new(Window {
                start: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Records an operation at `now` and returns how long the caller should
    /// wait before going ahead with it.
    pub fn record_at(&self, now: Instant) -> Option<Duration> {
        let mut window = lock(&self.window);

        if now.saturating_duration_since(window.start) >= WINDOW {
            let elapsed_windows = now.saturating_duration_since(window.start).as_nanos()
                / WINDOW.as_nanos();
            window.start += WINDOW * elapsed_windows as u32;
            let drained = (self.rate as u128).saturating_mul(elapsed_windows);
            window.count = window
                .count
                .saturating_sub(u32::try_from(drained).unwrap_or(u32::MAX));
        }

        window.count = window.count.saturating_add(1);

        // operations beyond the budget are pushed into later windows
        let overflow_windows = (window.count - 1) / self.rate;
        if overflow_windows == 0 {
            None
        } else {
            let admitted_at = window.start + WINDOW * overflow_windows;
            Some(admitted_at.saturating_duration_since(now))
        }
    }

    /// Records an operation and waits until it may go ahead.
    pub async fn record(&self) {
        if let Some(delay) = self.record_at(Instant::now()) {
            futures_timer::Delay::new(delay).await;
        }
    }
}
