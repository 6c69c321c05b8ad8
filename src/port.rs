//! Polyphonic Ports
//!
//! A port carries up to [`PORT_MAX_CHANNELS`] voltages. The channel count doubles as
//! the connection state: a port with zero channels is disconnected, and every voltage
//! at or above the channel count reads 0V.

use crate::graph::CableKey;
use crate::light::Light;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// Maximum polyphony of a single port, inspired by the number of MIDI channels
pub const PORT_MAX_CHANNELS: usize = 16;

/// Plug lights are stepped once every this many frames
pub const PORT_LIGHT_DIVIDER: i64 = 7;

/// Direction of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Input,
    Output,
}

/// Descriptive metadata for a port, used by UIs and by [`crate::ModuleConfig`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Human-readable name (e.g., "cutoff", "voct", "out")
    pub name: String,
    pub description: String,
}

impl PortInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Voltage storage shared by inputs and outputs
#[derive(Debug, Clone, Default)]
pub struct Port {
    voltages: [f32; PORT_MAX_CHANNELS],
    channels: u8,
    /// Green for positive, red for negative, blue for polyphonic
    pub plug_lights: [Light; 3],
}

impl Port {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the voltage of the given channel.
    pub fn set_voltage(&mut self, voltage: f32, channel: usize) {
        self.voltages[channel] = voltage;
    }

    /// Returns the voltage of the given channel.
    pub fn voltage(&self, channel: usize) -> f32 {
        self.voltages[channel]
    }

    /// Returns the given channel's voltage if polyphonic, otherwise channel 0.
    pub fn poly_voltage(&self, channel: usize) -> f32 {
        if self.is_monophonic() {
            self.voltages[0]
        } else {
            self.voltages[channel]
        }
    }

    /// Returns the voltage if a cable is connected, otherwise `normal`.
    pub fn normal_voltage(&self, normal: f32, channel: usize) -> f32 {
        if self.is_connected() {
            self.voltages[channel]
        } else {
            normal
        }
    }

    pub fn normal_poly_voltage(&self, normal: f32, channel: usize) -> f32 {
        if self.is_connected() {
            self.poly_voltage(channel)
        } else {
            normal
        }
    }

    /// The voltages of the active channels
    pub fn voltages(&self) -> &[f32] {
        &self.voltages[..self.channels as usize]
    }

    /// Mutable view over the active channels
    pub fn voltages_mut(&mut self) -> &mut [f32] {
        &mut self.voltages[..self.channels as usize]
    }

    /// Copies the active channels into `out`, which must hold at least `channels()` values.
    pub fn read_voltages(&self, out: &mut [f32]) {
        let n = self.channels as usize;
        out[..n].copy_from_slice(&self.voltages[..n]);
    }

    /// Copies `values` into the active channels.
    ///
    /// Set the channel count first; only `channels()` values are written.
    pub fn write_voltages(&mut self, values: &[f32]) {
        let n = (self.channels as usize).min(values.len());
        self.voltages[..n].copy_from_slice(&values[..n]);
    }

    /// Sets all active voltages to 0
    pub fn clear_voltages(&mut self) {
        let n = self.channels as usize;
        self.voltages[..n].fill(0.0);
    }

    pub fn voltage_sum(&self) -> f32 {
        self.voltages().iter().sum()
    }

    /// Root-mean-square style magnitude: |v| for mono, sqrt of the sum of squares for poly.
    pub fn voltage_rms(&self) -> f32 {
        match self.channels {
            0 => 0.0,
            1 => libm::fabsf(self.voltages[0]),
            _ => {
                let sum: f32 = self.voltages().iter().map(|v| v * v).sum();
                libm::sqrtf(sum)
            }
        }
    }

    /// Sets the number of polyphonic channels and clears voltages above it.
    ///
    /// A disconnected port keeps 0 channels. Asking a connected port for 0
    /// channels clears it and leaves it with 1 channel.
    pub fn set_channels(&mut self, channels: usize) {
        if self.channels == 0 {
            return;
        }
        let channels = channels.min(PORT_MAX_CHANNELS);
        for c in channels..self.channels as usize {
            self.voltages[c] = 0.0;
        }
        self.channels = channels.max(1) as u8;
    }

    /// Number of channels; 0 means disconnected
    pub fn channels(&self) -> usize {
        self.channels as usize
    }

    pub fn is_connected(&self) -> bool {
        self.channels > 0
    }

    pub fn is_monophonic(&self) -> bool {
        self.channels == 1
    }

    pub fn is_polyphonic(&self) -> bool {
        self.channels > 1
    }

    pub(crate) fn set_connected(&mut self) {
        if self.channels == 0 {
            self.channels = 1;
        }
    }

    pub(crate) fn set_disconnected(&mut self) {
        self.channels = 0;
        self.voltages.fill(0.0);
    }

    /// Copy `source` into this port, sanitizing non-finite voltages.
    ///
    /// The channel count follows the source; channels the source no longer
    /// carries are zeroed.
    pub(crate) fn copy_from(&mut self, source: &Port) {
        let channels = source.channels as usize;
        for (dst, &v) in self.voltages[..channels]
            .iter_mut()
            .zip(&source.voltages[..channels])
        {
            *dst = if v.is_finite() { v } else { 0.0 };
        }
        for c in channels..self.channels as usize {
            self.voltages[c] = 0.0;
        }
        self.channels = source.channels;
    }

    /// Advance the plug lights by `delta_time` seconds
    pub(crate) fn step_lights(&mut self, delta_time: f32) {
        match self.channels {
            0 => {
                for light in &mut self.plug_lights {
                    light.set_brightness(0.0);
                }
            }
            1 => {
                let v = self.voltages[0] / 10.0;
                self.plug_lights[0].set_brightness_smooth(-v, delta_time);
                self.plug_lights[1].set_brightness_smooth(v, delta_time);
                self.plug_lights[2].set_brightness(0.0);
            }
            _ => {
                let v = self.voltage_rms() / 10.0;
                self.plug_lights[0].set_brightness(0.0);
                self.plug_lights[1].set_brightness(0.0);
                self.plug_lights[2].set_brightness_smooth(v, delta_time);
            }
        }
    }
}

/// An input jack. At most one cable may write it.
#[derive(Debug, Clone, Default)]
pub struct Input {
    port: Port,
}

impl Input {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Deref for Input {
    type Target = Port;

    fn deref(&self) -> &Port {
        &self.port
    }
}

impl DerefMut for Input {
    fn deref_mut(&mut self) -> &mut Port {
        &mut self.port
    }
}

/// An output jack, with the cables currently reading from it
#[derive(Debug, Clone, Default)]
pub struct Output {
    port: Port,
    pub(crate) cables: Vec<CableKey>,
}

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cables fanning out of this output
    pub fn cable_count(&self) -> usize {
        self.cables.len()
    }
}

impl Deref for Output {
    type Target = Port;

    fn deref(&self) -> &Port {
        &self.port
    }
}

impl DerefMut for Output {
    fn deref_mut(&mut self) -> &mut Port {
        &mut self.port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn connected(channels: usize, fill: f32) -> Port {
        let mut port = Port::new();
        port.set_connected();
        port.channels = channels as u8;
        for c in 0..channels {
            port.set_voltage(fill + c as f32, c);
        }
        port
    }

    #[test]
    fn test_disconnected_port_ignores_set_channels() {
        let mut port = Port::new();
        port.set_channels(4);
        assert_eq!(port.channels(), 0);
        assert!(!port.is_connected());
    }

    #[test]
    fn test_set_channels_zero_keeps_one() {
        let mut port = connected(3, 1.0);
        port.set_channels(0);
        assert_eq!(port.channels(), 1);
        assert_eq!(port.voltage(0), 0.0);
        assert_eq!(port.voltage(1), 0.0);
        assert_eq!(port.voltage(2), 0.0);
    }

    #[test]
    fn test_poly_voltage_broadcasts_mono() {
        let port = connected(1, 2.5);
        assert_eq!(port.poly_voltage(7), 2.5);
        let poly = connected(4, 0.0);
        assert_eq!(poly.poly_voltage(3), 3.0);
    }

    #[test]
    fn test_normal_voltage() {
        let port = Port::new();
        assert_eq!(port.normal_voltage(5.0, 0), 5.0);
        let port = connected(1, 1.0);
        assert_eq!(port.normal_voltage(5.0, 0), 1.0);
    }

    #[test]
    fn test_sum_and_rms() {
        let mut port = connected(2, 0.0);
        port.set_voltage(3.0, 0);
        port.set_voltage(4.0, 1);
        assert_relative_eq!(port.voltage_sum(), 7.0);
        assert_relative_eq!(port.voltage_rms(), 5.0);

        let mut mono = connected(1, 0.0);
        mono.set_voltage(-2.0, 0);
        assert_relative_eq!(mono.voltage_rms(), 2.0);
        assert_eq!(Port::new().voltage_rms(), 0.0);
    }

    #[test]
    fn test_read_write_voltages() {
        let mut port = connected(3, 0.0);
        port.write_voltages(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(port.voltages(), &[1.0, 2.0, 3.0]);
        let mut out = [0.0; PORT_MAX_CHANNELS];
        port.read_voltages(&mut out);
        assert_eq!(&out[..4], &[1.0, 2.0, 3.0, 0.0]);
        port.clear_voltages();
        assert_eq!(port.voltages(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_copy_from_sanitizes_and_zeroes_excess() {
        let mut output = connected(3, 0.0);
        output.set_voltage(1.0, 0);
        output.set_voltage(f32::NAN, 1);
        output.set_voltage(-2.5, 2);
        let mut input = connected(5, 9.0);

        input.copy_from(&output);

        assert_eq!(input.channels(), 3);
        assert_eq!(input.voltages(), &[1.0, 0.0, -2.5]);
        assert_eq!(input.voltage(3), 0.0);
        assert_eq!(input.voltage(4), 0.0);
    }

    #[test]
    fn test_copy_from_infinity() {
        let mut output = connected(1, 0.0);
        output.set_voltage(f32::INFINITY, 0);
        let mut input = Port::new();
        input.copy_from(&output);
        assert_eq!(input.voltage(0), 0.0);
        assert_eq!(input.channels(), 1);
    }

    #[test]
    fn test_plug_lights_mono_and_poly() {
        let mut mono = connected(1, 0.0);
        mono.set_voltage(5.0, 0);
        mono.step_lights(7.0 / 48000.0);
        assert_relative_eq!(mono.plug_lights[1].brightness(), 0.5);
        assert!(mono.plug_lights[0].brightness() <= 0.0);

        let mut poly = connected(2, 0.0);
        poly.set_voltage(3.0, 0);
        poly.set_voltage(4.0, 1);
        poly.step_lights(7.0 / 48000.0);
        assert_relative_eq!(poly.plug_lights[2].brightness(), 0.5);
        assert_eq!(poly.plug_lights[1].brightness(), 0.0);

        let mut off = Port::new();
        off.plug_lights[2].set_brightness(1.0);
        off.step_lights(1.0);
        assert_eq!(off.plug_lights[2].brightness(), 0.0);
    }

    #[test]
    fn test_output_deref() {
        let mut output = Output::new();
        output.set_connected();
        output.set_voltage(1.0, 0);
        assert_eq!(output.voltage(0), 1.0);
        assert_eq!(output.cable_count(), 0);
    }

    proptest! {
        #[test]
        fn prop_set_channels_zeroes_upper_channels(
            channels in 1usize..=PORT_MAX_CHANNELS,
            new_channels in 0usize..PORT_MAX_CHANNELS,
            seed in -10.0f32..10.0,
        ) {
            prop_assume!(new_channels < channels);
            let mut port = connected(channels, seed);
            let before = port.voltages;

            port.set_channels(new_channels);

            for c in new_channels..channels {
                prop_assert_eq!(port.voltage(c), 0.0);
            }
            for c in 0..new_channels {
                prop_assert_eq!(port.voltage(c), before[c]);
            }
        }

        #[test]
        fn prop_disconnect_clears_everything(channels in 1usize..=PORT_MAX_CHANNELS) {
            let mut port = connected(channels, 1.0);
            port.set_disconnected();
            prop_assert_eq!(port.channels(), 0);
            prop_assert!(port.voltages.iter().all(|&v| v == 0.0));
        }
    }
}
