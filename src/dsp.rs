//! Small DSP helpers used by the host boundary modules

/// Limits how fast a signal may rise or fall
///
/// Rates are in units per second.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SlewLimiter {
    out: f32,
    rise: f32,
    fall: f32,
}

impl SlewLimiter {
    pub fn new(rise: f32, fall: f32) -> Self {
        Self {
            out: 0.0,
            rise,
            fall,
        }
    }

    pub fn set_rise_fall(&mut self, rise: f32, fall: f32) {
        self.rise = rise;
        self.fall = fall;
    }

    pub fn reset(&mut self) {
        self.out = 0.0;
    }

    pub fn value(&self) -> f32 {
        self.out
    }

    /// Move towards `input` by at most the rise/fall rate over `delta_time` seconds
    pub fn process(&mut self, delta_time: f32, input: f32) -> f32 {
        let lo = self.out - self.fall * delta_time;
        let hi = self.out + self.rise * delta_time;
        self.out = input.max(lo).min(hi);
        self.out
    }
}

/// Emits a high state for a fixed duration after being triggered
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PulseGenerator {
    remaining: f32,
}

/// Default trigger length, 1ms
pub const PULSE_DURATION: f32 = 1e-3;

impl PulseGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.remaining = 0.0;
    }

    /// Start (or extend) a pulse of `duration` seconds
    pub fn trigger(&mut self, duration: f32) {
        if duration > self.remaining {
            self.remaining = duration;
        }
    }

    /// Advance by `delta_time` seconds, returning whether the pulse is high
    pub fn process(&mut self, delta_time: f32) -> bool {
        if self.remaining > 0.0 {
            self.remaining -= delta_time;
            true
        } else {
            false
        }
    }
}

/// One-pole RC filter, used as a DC blocker on host audio outputs
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RcFilter {
    c: f32,
    x: f32,
    y: f32,
}

impl RcFilter {
    /// `cutoff` is normalized: frequency in Hz times sample time
    pub fn set_cutoff_freq(&mut self, cutoff: f32) {
        self.c = 2.0 / (2.0 * std::f32::consts::PI * cutoff);
    }

    pub fn process(&mut self, x: f32) {
        let y = (x + self.x - self.y * (1.0 - self.c)) / (1.0 + self.c);
        self.x = x;
        self.y = y;
    }

    pub fn lowpass(&self) -> f32 {
        self.y
    }

    pub fn highpass(&self) -> f32 {
        self.x - self.y
    }
}

/// First-order exponential approach towards the input
///
/// `out += (in - out) * lambda * delta_time`, with `lambda = 1 / tau`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExponentialFilter {
    pub out: f32,
    lambda: f32,
}

impl ExponentialFilter {
    pub fn set_tau(&mut self, tau: f32) {
        self.lambda = 1.0 / tau;
    }

    pub fn reset(&mut self) {
        self.out = 0.0;
    }

    pub fn process(&mut self, delta_time: f32, input: f32) -> f32 {
        let next = self.out + (input - self.out) * self.lambda * delta_time;
        // settle once the step vanishes below float resolution
        self.out = if next == self.out { input } else { next };
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_slew_rises_at_rate() {
        let mut slew = SlewLimiter::new(10.0, 10.0);
        let dt = 0.01;
        assert_relative_eq!(slew.process(dt, 1.0), 0.1);
        assert_relative_eq!(slew.process(dt, 1.0), 0.2);
        for _ in 0..20 {
            slew.process(dt, 1.0);
        }
        assert_relative_eq!(slew.value(), 1.0);
    }

    #[test]
    fn test_slew_falls_at_rate() {
        let mut slew = SlewLimiter::new(1000.0, 5.0);
        slew.process(1.0, 2.0);
        assert_relative_eq!(slew.value(), 2.0);
        assert_relative_eq!(slew.process(0.1, 0.0), 1.5);
        slew.reset();
        assert_eq!(slew.value(), 0.0);
    }

    #[test]
    fn test_pulse_lasts_duration() {
        let mut pulse = PulseGenerator::new();
        assert!(!pulse.process(0.25));
        pulse.trigger(1.0);
        let high = (0..8).filter(|_| pulse.process(0.25)).count();
        assert_eq!(high, 4);
    }

    #[test]
    fn test_pulse_retrigger_extends_only() {
        let mut pulse = PulseGenerator::new();
        pulse.trigger(0.01);
        pulse.trigger(0.001);
        assert!(pulse.process(0.005));
        assert!(pulse.process(0.004));
    }

    #[test]
    fn test_dc_blocker_removes_offset() {
        let mut filter = RcFilter::default();
        filter.set_cutoff_freq(10.0 / 48000.0);
        for _ in 0..48000 {
            filter.process(1.0);
        }
        assert!(filter.highpass().abs() < 1e-3);
        assert_relative_eq!(filter.lowpass(), 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_exponential_filter_settles() {
        let mut filter = ExponentialFilter::default();
        filter.set_tau(1.0 / 30.0);
        assert_relative_eq!(filter.process(0.01, 1.0), 0.3, epsilon = 1e-6);
        for _ in 0..2000 {
            filter.process(0.01, 1.0);
        }
        assert_eq!(filter.out, 1.0);
        filter.reset();
        assert_eq!(filter.out, 0.0);
    }
}
