//! Block-time performance meter
//!
//! Each block contributes one sample: the wall time spent in `step_block`
//! divided by the audio time the block represents. A value of 1.0 means the
//! engine used the whole block duration. Samples accumulate over a window and
//! the average and maximum are published once the window is a second old.

/// Length of the publishing window in seconds
pub const METER_WINDOW: f64 = 1.0;

#[derive(Debug, Clone, Default)]
pub(crate) struct Meter {
    count: u32,
    total: f64,
    max: f64,
    window_start: f64,
    last_average: f64,
    last_max: f64,
}

impl Meter {
    /// Record one block's load, `now` in seconds on any monotonic clock
    pub(crate) fn add(&mut self, load: f64, now: f64) {
        self.count += 1;
        self.total += load;
        self.max = self.max.max(load);

        if now - self.window_start >= METER_WINDOW {
            self.last_average = self.total / self.count as f64;
            self.last_max = self.max;
            self.count = 0;
            self.total = 0.0;
            self.max = 0.0;
            self.window_start = now;
        }
    }

    pub(crate) fn average(&self) -> f64 {
        self.last_average
    }

    pub(crate) fn max(&self) -> f64 {
        self.last_max
    }
}
