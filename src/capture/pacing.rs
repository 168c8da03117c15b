use std::time::{Duration, Instant};

/// Interval for a target frame rate. `fps` below 1 is treated as 1.
pub fn tick_interval(fps: u32) -> Duration {
    Duration::from_secs(1) / fps.max(1)
}

/// Absolute-deadline tick scheduler.
///
/// Deadlines advance by exactly one interval per tick, so per-frame work does
/// not accumulate drift. A tick that overran its deadline resets the schedule
/// to "now" instead of bursting to catch up.
#[derive(Clone, Debug)]
pub struct TickPacer {
    interval: Duration,
    next_tick: Instant,
}

impl TickPacer {
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            next_tick: start,
        }
    }

    /// Advance the schedule after a tick that finished at `now`; returns how
    /// long to wait before the next tick.
    pub fn advance(&mut self, now: Instant) -> Duration {
        self.next_tick += self.interval;
        if self.next_tick <= now {
            self.next_tick = now;
            return Duration::ZERO;
        }
        self.next_tick - now
    }
}
