//! Core Modules
//!
//! Small utility modules registered under the `"Core"` plugin slug. They are
//! the ordinary (non-terminal) building blocks used to wire host inputs to
//! host outputs: a constant source, an amplifier and a summing mixer. All of
//! them are polyphonic; the output carries as many channels as the widest
//! connected input.

use crate::module::{GraphModule, ModuleConfig, ModuleIo, ProcessArgs};
use crate::param::ParamQuantity;
use crate::port::PORT_MAX_CHANNELS;

/// Plugin slug of the built-in modules
pub const CORE_PLUGIN: &str = "Core";

/// Constant voltage source
///
/// Outputs the offset param. With the input patched, the offset is added to
/// every input channel instead.
#[derive(Debug, Default)]
pub struct Offset;

impl Offset {
    pub const OFFSET: usize = 0;
    pub const IN: usize = 0;
    pub const OUT: usize = 0;

    pub fn new() -> Self {
        Self
    }
}

impl GraphModule for Offset {
    fn config(&self) -> ModuleConfig {
        ModuleConfig::new(CORE_PLUGIN, "Offset")
            .param(ParamQuantity::new("offset", -10.0, 10.0, 0.0).with_unit(" V"))
            .input("in")
            .output("out")
    }

    fn process(&mut self, _args: &ProcessArgs<'_>, io: &mut ModuleIo) {
        let offset = io.param(Self::OFFSET);
        let (inputs, outputs) = io.ports_mut();
        let input = &inputs[Self::IN];
        let out = &mut outputs[Self::OUT];

        let channels = input.channels().max(1);
        out.set_channels(channels);
        for c in 0..channels {
            out.set_voltage(input.voltage(c) + offset, c);
        }
    }
}

/// Voltage-controlled amplifier without the voltage control
///
/// `out = in * gain`, channel by channel. The gain param is smoothed when
/// automated through the engine.
#[derive(Debug, Default)]
pub struct Gain;

impl Gain {
    pub const GAIN: usize = 0;
    pub const IN: usize = 0;
    pub const OUT: usize = 0;

    pub fn new() -> Self {
        Self
    }
}

impl GraphModule for Gain {
    fn config(&self) -> ModuleConfig {
        ModuleConfig::new(CORE_PLUGIN, "Gain")
            .param(ParamQuantity::new("gain", 0.0, 2.0, 1.0).smooth())
            .input("in")
            .output("out")
    }

    fn process(&mut self, _args: &ProcessArgs<'_>, io: &mut ModuleIo) {
        let gain = io.param(Self::GAIN);
        let (inputs, outputs) = io.ports_mut();
        let input = &inputs[Self::IN];
        let out = &mut outputs[Self::OUT];

        let channels = input.channels().max(1);
        out.set_channels(channels);
        for c in 0..channels {
            out.set_voltage(input.voltage(c) * gain, c);
        }
    }
}

/// Four-input summing mixer
///
/// Channel `c` of the output is the sum of channel `c` of every input.
/// Monophonic inputs are added to every channel of a polyphonic mix.
#[derive(Debug, Default)]
pub struct Mixer {
    mix: [f32; PORT_MAX_CHANNELS],
}

impl Mixer {
    pub const INPUTS: usize = 4;
    pub const OUT: usize = 0;

    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphModule for Mixer {
    fn config(&self) -> ModuleConfig {
        (1..=Self::INPUTS)
            .fold(ModuleConfig::new(CORE_PLUGIN, "Mixer"), |config, i| {
                config.input(format!("in {i}"))
            })
            .output("out")
    }

    fn process(&mut self, _args: &ProcessArgs<'_>, io: &mut ModuleIo) {
        let (inputs, outputs) = io.ports_mut();
        let channels = inputs
            .iter()
            .map(|input| input.channels())
            .max()
            .unwrap_or(0)
            .max(1);

        self.mix[..channels].fill(0.0);
        for input in inputs.iter().filter(|input| input.is_connected()) {
            for (c, sum) in self.mix[..channels].iter_mut().enumerate() {
                *sum += input.poly_voltage(c);
            }
        }

        let out = &mut outputs[Self::OUT];
        out.set_channels(channels);
        out.write_voltages(&self.mix[..channels]);
    }
}
