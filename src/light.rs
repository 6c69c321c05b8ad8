//! Panel and plug lights
//!
//! Lights are cosmetic brightness values read by a UI. The engine only writes
//! them from the audio thread, so they are plain floats.

/// Decay rate used when a light fades out
pub const LIGHT_FADE_LAMBDA: f32 = 30.0;

/// A single light brightness value, nominally 0.0–1.0
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Light {
    value: f32,
}

impl Light {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brightness(&self) -> f32 {
        self.value
    }

    pub fn set_brightness(&mut self, brightness: f32) {
        self.value = brightness;
    }

    /// Illuminate immediately, fade out exponentially.
    ///
    /// Brighter targets jump at once; dimmer targets approach with
    /// [`LIGHT_FADE_LAMBDA`] over `delta_time` seconds.
    pub fn set_brightness_smooth(&mut self, brightness: f32, delta_time: f32) {
        if brightness < self.value {
            self.value += (brightness - self.value) * LIGHT_FADE_LAMBDA * delta_time;
        } else {
            self.value = brightness;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rising_brightness_is_immediate() {
        let mut light = Light::new();
        light.set_brightness_smooth(0.8, 1.0 / 48000.0);
        assert_relative_eq!(light.brightness(), 0.8);
    }

    #[test]
    fn test_falling_brightness_decays() {
        let mut light = Light::new();
        light.set_brightness(1.0);
        light.set_brightness_smooth(0.0, 0.01);
        // 1.0 - 1.0 * 30 * 0.01
        assert_relative_eq!(light.brightness(), 0.7, epsilon = 1e-6);
        for _ in 0..200 {
            light.set_brightness_smooth(0.0, 0.01);
        }
        assert!(light.brightness() < 1e-6);
    }
}
