//! Host boundary modules
//!
//! These are the patch's only contact with the outside world. Each one holds
//! the [`HostContext`] it was built with and is driven through
//! [`TerminalModule`]: host data is written onto its outputs before any
//! ordinary module runs, and its inputs are read back into host buffers after
//! all of them have run.
//!
//! | Module              | Inputs          | Outputs                                |
//! |---------------------|-----------------|----------------------------------------|
//! | `HostAudio`         | one per channel | one per channel                        |
//! | `HostParameters`    | -               | 24 host parameters                     |
//! | `HostParametersMap` | -               | - (writes mapped module params)        |
//! | `HostTime`          | -               | playing, bar, beat, clock              |
//! | `HostMidi`          | -               | V/Oct, gate, velocity, aftertouch, ... |

use crate::dsp::{ExponentialFilter, PulseGenerator, RcFilter, SlewLimiter, PULSE_DURATION};
use crate::host::{HostContext, MODULE_PARAMETER_COUNT};
use crate::module::{
    GraphModule, ModuleConfig, ModuleIo, ProcessArgs, SampleRateChangeEvent, TerminalModule,
};
use crate::param::{ParamHandle, ParamId, ParamQuantity};
use serde_json::{json, Value};
use std::sync::Arc;

/// Plugin slug shared by every host boundary module
pub const HOST_PLUGIN: &str = "Cardinal";

/// DC blocker corner frequency in Hz
const DC_FILTER_CUTOFF: f32 = 10.0;

// =============================================================================
// Audio
// =============================================================================

/// Host audio in and out
///
/// Host samples arrive as ±1 and are scaled to ±10 V. Patch voltages are
/// summed over their polyphonic channels, scaled back to ±1, optionally
/// DC blocked and mixed into the host output buffers. The stereo variant has
/// a level param and copies the left input to the right output when only
/// the left input is patched.
pub struct HostAudio {
    host: Arc<HostContext>,
    channels: usize,
    dc_filters: Vec<RcFilter>,
    dc_filter_enabled: bool,
    values: Vec<f32>,
}

impl HostAudio {
    pub fn new(host: Arc<HostContext>, channels: usize) -> Self {
        let channels = channels.max(1);
        let mut dc_filters = vec![RcFilter::default(); channels];
        let sample_time = 1.0 / host.sample_rate() as f32;
        for filter in &mut dc_filters {
            filter.set_cutoff_freq(DC_FILTER_CUTOFF * sample_time);
        }
        Self {
            host,
            channels,
            dc_filters,
            dc_filter_enabled: channels == 2,
            values: vec![0.0; channels],
        }
    }

    pub fn stereo(host: Arc<HostContext>) -> Self {
        Self::new(host, 2)
    }

    pub fn with_dc_filter(mut self, enabled: bool) -> Self {
        self.dc_filter_enabled = enabled;
        self
    }

    pub fn dc_filter_enabled(&self) -> bool {
        self.dc_filter_enabled
    }

    fn is_stereo(&self) -> bool {
        self.channels == 2
    }
}

impl GraphModule for HostAudio {
    fn config(&self) -> ModuleConfig {
        let mut config = ModuleConfig::new(HOST_PLUGIN, format!("HostAudio{}", self.channels));
        if self.is_stereo() {
            config = config.param(ParamQuantity::new("Level", 0.0, 2.0, 1.0));
        }
        for c in 1..=self.channels {
            config = config
                .input(format!("Audio {c}"))
                .output(format!("Audio {c}"));
        }
        config
    }

    fn process(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}

    fn as_terminal_mut(&mut self) -> Option<&mut dyn TerminalModule> {
        Some(self)
    }

    fn on_reset(&mut self, _io: &mut ModuleIo) {
        self.dc_filter_enabled = self.is_stereo();
    }

    fn on_sample_rate_change(&mut self, event: &SampleRateChangeEvent, _io: &mut ModuleIo) {
        for filter in &mut self.dc_filters {
            filter.set_cutoff_freq(DC_FILTER_CUTOFF * event.sample_time);
        }
    }

    fn data_to_json(&self) -> Option<serde_json::Value> {
        Some(json!({ "dcFilter": self.dc_filter_enabled }))
    }

    fn data_from_json(&mut self, data: &serde_json::Value) -> Result<(), String> {
        if let Some(enabled) = data.get("dcFilter") {
            self.dc_filter_enabled = enabled
                .as_bool()
                .ok_or_else(|| format!("dcFilter must be a bool, got {enabled}"))?;
        }
        Ok(())
    }
}

impl TerminalModule for HostAudio {
    fn process_terminal_input(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo) {
        if io.is_bypassed() {
            return;
        }
        let k = args.block_offset();
        let audio = self.host.audio();
        for c in 0..self.channels {
            io.output_mut(c).set_voltage(audio.input(c, k) * 10.0, 0);
        }
    }

    fn process_terminal_output(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo) {
        if io.is_bypassed() {
            return;
        }
        let k = args.block_offset();
        let gain = if self.is_stereo() {
            let level = io.param(0);
            level * level
        } else {
            1.0
        };

        for c in 0..self.channels {
            let mut v = io.input(c).voltage_sum() * 0.1;
            if self.dc_filter_enabled {
                self.dc_filters[c].process(v);
                v = self.dc_filters[c].highpass();
            }
            self.values[c] = (v * gain).clamp(-1.0, 1.0);
        }
        if self.is_stereo() && !io.input(1).is_connected() {
            self.values[1] = self.values[0];
        }

        let mut audio = self.host.audio();
        for (c, &v) in self.values.iter().enumerate() {
            audio.add_output(c, k, v);
        }
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Host automation parameters as voltages
///
/// With smoothing on, each output slews towards its parameter so that a jump
/// is spread over one host buffer.
pub struct HostParameters {
    host: Arc<HostContext>,
    slews: [SlewLimiter; MODULE_PARAMETER_COUNT],
}

impl HostParameters {
    pub fn new(host: Arc<HostContext>) -> Self {
        let sample_rate = host.sample_rate() as f32;
        let mut module = Self {
            host,
            slews: [SlewLimiter::default(); MODULE_PARAMETER_COUNT],
        };
        module.reset_slews(sample_rate);
        module
    }

    fn reset_slews(&mut self, sample_rate: f32) {
        let rate = 1.0 / (self.host.buffer_size() as f32 / sample_rate);
        for slew in &mut self.slews {
            slew.reset();
            slew.set_rise_fall(rate, rate);
        }
    }
}

impl GraphModule for HostParameters {
    fn config(&self) -> ModuleConfig {
        (1..=MODULE_PARAMETER_COUNT).fold(
            ModuleConfig::new(HOST_PLUGIN, "HostParameters"),
            |config, i| config.output(format!("Parameter {i}")),
        )
    }

    fn process(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}

    fn as_terminal_mut(&mut self) -> Option<&mut dyn TerminalModule> {
        Some(self)
    }

    fn on_sample_rate_change(&mut self, event: &SampleRateChangeEvent, _io: &mut ModuleIo) {
        self.reset_slews(event.sample_rate);
    }
}

impl TerminalModule for HostParameters {
    fn process_terminal_input(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo) {
        if io.is_bypassed() {
            return;
        }
        let smooth = self.host.smooth_parameters();
        for (i, slew) in self.slews.iter_mut().enumerate() {
            let value = self.host.parameter(i);
            let v = if smooth {
                slew.process(args.sample_time, value)
            } else {
                value
            };
            io.output_mut(i).set_voltage(v, 0);
        }
    }

    fn process_terminal_output(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}
}

// =============================================================================
// Parameter mapping
// =============================================================================

/// Mapping slots of a [`HostParametersMap`]
pub const MAX_MAPPED_PARAMS: usize = 64;

/// Time constant of mapped value easing, in seconds
const MAP_SMOOTH_TAU: f32 = 1.0 / 30.0;

/// Stored for an unassigned host parameter
const UNMAPPED_HOST_PARAM: u64 = u8::MAX as u64;

struct Mapping {
    host_param: Option<usize>,
    inverted: bool,
    smooth: bool,
    handle: Arc<ParamHandle>,
    filter: ExponentialFilter,
    filter_initialized: bool,
    value_reached: bool,
}

impl Mapping {
    fn new() -> Self {
        let mut filter = ExponentialFilter::default();
        filter.set_tau(MAP_SMOOTH_TAU);
        Self {
            host_param: None,
            inverted: false,
            smooth: true,
            handle: ParamHandle::new(),
            filter,
            filter_initialized: false,
            value_reached: false,
        }
    }

    /// Wait for the next host change before touching the param
    fn restart(&mut self) {
        self.filter.reset();
        self.filter_initialized = false;
        self.value_reached = true;
    }

    fn clear(&mut self) {
        self.host_param = None;
        self.handle.preset(None, 0);
        self.restart();
    }

    fn target(&self) -> Option<(i64, ParamId)> {
        self.handle
            .module_id()
            .map(|module_id| (module_id, self.handle.param_id()))
    }
}

/// Host automation parameters written straight into module params
///
/// Each slot pairs a host parameter with a [`ParamHandle`]. Host values are
/// 0..10, like the voltages [`HostParameters`] outputs, and land on the
/// mapped param's full range (inverted if asked). Once per host block,
/// changed values are eased in over about 1/30 s; a jump across the whole
/// range is applied at once.
///
/// The engine registers the handles when the map is added, so mappings
/// built with [`HostParametersMap::with_mapping`] or loaded from a patch
/// take effect immediately. An added map is remapped through
/// [`crate::Engine::update_param_handle`] with [`HostParametersMap::handle`].
pub struct HostParametersMap {
    host: Arc<HostContext>,
    mappings: Vec<Mapping>,
    values: [f32; MODULE_PARAMETER_COUNT],
    changed: [bool; MODULE_PARAMETER_COUNT],
    first_run: bool,
}

impl HostParametersMap {
    pub fn new(host: Arc<HostContext>) -> Self {
        let values = std::array::from_fn(|i| host.parameter(i));
        Self {
            host,
            mappings: (0..MAX_MAPPED_PARAMS).map(|_| Mapping::new()).collect(),
            values,
            changed: [false; MODULE_PARAMETER_COUNT],
            first_run: true,
        }
    }

    /// Drive `param_id` of module `module_id` from host parameter `host_param`
    pub fn with_mapping(
        mut self,
        slot: usize,
        host_param: usize,
        module_id: i64,
        param_id: ParamId,
    ) -> Self {
        if let Some(mapping) = self.mappings.get_mut(slot) {
            mapping.host_param = (host_param < MODULE_PARAMETER_COUNT).then_some(host_param);
            mapping.handle.preset(Some(module_id), param_id);
            mapping.restart();
        }
        self
    }

    pub fn with_options(mut self, slot: usize, inverted: bool, smooth: bool) -> Self {
        if let Some(mapping) = self.mappings.get_mut(slot) {
            mapping.inverted = inverted;
            mapping.smooth = smooth;
        }
        self
    }

    /// The handle behind a slot
    pub fn handle(&self, slot: usize) -> Option<Arc<ParamHandle>> {
        self.mappings.get(slot).map(|m| Arc::clone(&m.handle))
    }

    pub fn host_param(&self, slot: usize) -> Option<usize> {
        self.mappings.get(slot).and_then(|m| m.host_param)
    }

    /// Slots up to and including the last one that targets a module
    fn num_mapped(&self) -> usize {
        self.mappings
            .iter()
            .rposition(|m| m.handle.module_id().is_some())
            .map_or(0, |last| last + 1)
    }
}

impl GraphModule for HostParametersMap {
    fn config(&self) -> ModuleConfig {
        ModuleConfig::new(HOST_PLUGIN, "HostParametersMap")
    }

    fn process(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}

    fn as_terminal_mut(&mut self) -> Option<&mut dyn TerminalModule> {
        Some(self)
    }

    fn param_handles(&self) -> Vec<Arc<ParamHandle>> {
        self.mappings.iter().map(|m| Arc::clone(&m.handle)).collect()
    }

    fn on_reset(&mut self, _io: &mut ModuleIo) {
        for mapping in &mut self.mappings {
            mapping.clear();
        }
        self.values = std::array::from_fn(|i| self.host.parameter(i));
        self.changed = [false; MODULE_PARAMETER_COUNT];
        self.first_run = true;
    }

    fn data_to_json(&self) -> Option<Value> {
        let maps: Vec<Value> = self.mappings[..self.num_mapped()]
            .iter()
            .map(|m| {
                let (module_id, param_id) = m.target().unwrap_or((-1, 0));
                json!({
                    "hostParamId": m.host_param.map_or(UNMAPPED_HOST_PARAM, |p| p as u64),
                    "inverted": m.inverted,
                    "smooth": m.smooth,
                    "moduleId": module_id,
                    "paramId": param_id,
                })
            })
            .collect();
        Some(json!({ "maps": maps }))
    }

    fn data_from_json(&mut self, data: &Value) -> Result<(), String> {
        for mapping in &mut self.mappings {
            mapping.clear();
        }
        let maps = match data.get("maps") {
            None => return Ok(()),
            Some(Value::Array(maps)) => maps,
            Some(_) => return Err("\"maps\" is not an array".into()),
        };

        for (mapping, map) in self.mappings.iter_mut().zip(maps) {
            let (Some(host_param), Some(inverted), Some(smooth), Some(module_id), Some(param_id)) = (
                map.get("hostParamId").and_then(Value::as_u64),
                map.get("inverted").and_then(Value::as_bool),
                map.get("smooth").and_then(Value::as_bool),
                map.get("moduleId").and_then(Value::as_i64),
                map.get("paramId").and_then(Value::as_u64),
            ) else {
                continue;
            };
            mapping.host_param = usize::try_from(host_param)
                .ok()
                .filter(|&p| p < MODULE_PARAMETER_COUNT);
            mapping.inverted = inverted;
            mapping.smooth = smooth;
            if module_id >= 0 {
                mapping.handle.preset(Some(module_id), param_id as ParamId);
            }
        }
        Ok(())
    }
}

impl TerminalModule for HostParametersMap {
    fn process_terminal_input(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo) {
        // once per host block
        if args.block_offset() != 0 || io.is_bypassed() {
            return;
        }

        for (i, (value, changed)) in self.values.iter_mut().zip(&mut self.changed).enumerate() {
            let current = self.host.parameter(i);
            if current != *value {
                *value = current;
                *changed = true;
            }
        }

        let delta_time = args.sample_time * self.host.buffer_size() as f32;
        for mapping in &mut self.mappings {
            let Some(host_param) = mapping.host_param else {
                continue;
            };
            if !mapping.handle.is_resolved() {
                continue;
            }
            if !mapping.filter_initialized {
                mapping.filter.out = mapping.handle.scaled_value();
                mapping.filter_initialized = true;
                continue;
            }

            if self.changed[host_param] && !self.first_run {
                mapping.value_reached = false;
            } else if mapping.value_reached {
                continue;
            }

            let host_value = self.values[host_param];
            let value = 0.1 * if mapping.inverted { 10.0 - host_value } else { host_value };
            if mapping.smooth && (mapping.filter.out - value).abs() < 1.0 {
                mapping.filter.process(delta_time, value);
            } else {
                mapping.filter.out = value;
            }
            mapping.value_reached = mapping.filter.out == value;
            mapping.handle.set_scaled_value(mapping.filter.out);
        }

        self.first_run = false;
        self.changed = [false; MODULE_PARAMETER_COUNT];
    }

    fn process_terminal_output(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}
}

// =============================================================================
// Time
// =============================================================================

/// Output and light indices of [`HostTime`]
pub mod time_ports {
    pub const PLAYING: usize = 0;
    pub const BAR: usize = 1;
    pub const BEAT: usize = 2;
    pub const CLOCK: usize = 3;
}

/// Transport state as gates and triggers
///
/// Emits 10 V while the host is playing, and 1 ms triggers at the start of
/// every bar, beat and clock tick (a clock tick is one `beat_type` note).
/// Triggers need a valid bar/beat/tick position from the host.
pub struct HostTime {
    host: Arc<HostContext>,
    synced: bool,
    bar: i32,
    beat: i32,
    tick: f64,
    tick_clock: f64,
    pending_bar: bool,
    pending_beat: bool,
    pending_clock: bool,
    pulse_bar: PulseGenerator,
    pulse_beat: PulseGenerator,
    pulse_clock: PulseGenerator,
}

impl HostTime {
    pub fn new(host: Arc<HostContext>) -> Self {
        Self {
            host,
            synced: false,
            bar: 1,
            beat: 1,
            tick: 0.0,
            tick_clock: 0.0,
            pending_bar: false,
            pending_beat: false,
            pending_clock: false,
            pulse_bar: PulseGenerator::new(),
            pulse_beat: PulseGenerator::new(),
            pulse_clock: PulseGenerator::new(),
        }
    }

    /// Current bar and beat as counted by this module
    pub fn position(&self) -> (i32, i32) {
        (self.bar, self.beat)
    }

    fn stop(&mut self) {
        self.synced = false;
        self.pending_bar = false;
        self.pending_beat = false;
        self.pending_clock = false;
        self.pulse_bar.reset();
        self.pulse_beat.reset();
        self.pulse_clock.reset();
    }
}

impl GraphModule for HostTime {
    fn config(&self) -> ModuleConfig {
        ModuleConfig::new(HOST_PLUGIN, "HostTime")
            .output("Playing")
            .output("Bar")
            .output("Beat")
            .output("Clock")
            .lights(4)
    }

    fn process(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}

    fn as_terminal_mut(&mut self) -> Option<&mut dyn TerminalModule> {
        Some(self)
    }

    fn on_reset(&mut self, _io: &mut ModuleIo) {
        self.stop();
    }
}

impl TerminalModule for HostTime {
    fn process_terminal_input(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo) {
        use time_ports::*;

        if io.is_bypassed() {
            return;
        }
        let time = self.host.time();
        let dt = args.sample_time;

        if time.playing && time.bbt_valid {
            if !self.synced || (time.reset && args.block_offset() == 0) {
                self.synced = true;
                self.bar = time.bar;
                self.beat = time.beat;
                self.tick = time.tick;
                self.tick_clock = time.tick_clock;
                self.pending_beat = self.tick == 0.0;
                self.pending_bar = self.pending_beat && self.beat == 1;
                self.pending_clock = self.tick_clock == 0.0;
            }

            if std::mem::take(&mut self.pending_bar) {
                self.pulse_bar.trigger(PULSE_DURATION);
            }
            if std::mem::take(&mut self.pending_beat) {
                self.pulse_beat.trigger(PULSE_DURATION);
            }
            if std::mem::take(&mut self.pending_clock) {
                self.pulse_clock.trigger(PULSE_DURATION);
            }

            // wrapping schedules the trigger for the frame the new beat starts on
            self.tick += time.ticks_per_frame;
            if self.tick >= time.ticks_per_beat {
                self.tick -= time.ticks_per_beat;
                self.pending_beat = true;
                self.beat += 1;
                if self.beat > time.beats_per_bar {
                    self.beat = 1;
                    self.bar += 1;
                    self.pending_bar = true;
                }
            }
            self.tick_clock += time.ticks_per_frame;
            if self.tick_clock >= time.ticks_per_clock {
                self.tick_clock -= time.ticks_per_clock;
                self.pending_clock = true;
            }
        } else if self.synced {
            self.stop();
        }

        let bar = self.pulse_bar.process(dt);
        let beat = self.pulse_beat.process(dt);
        let clock = self.pulse_clock.process(dt);
        let gate = |high: bool| if high { 10.0 } else { 0.0 };

        io.output_mut(PLAYING).set_voltage(gate(time.playing), 0);
        io.output_mut(BAR).set_voltage(gate(bar), 0);
        io.output_mut(BEAT).set_voltage(gate(beat), 0);
        io.output_mut(CLOCK).set_voltage(gate(clock), 0);

        io.light_mut(PLAYING)
            .set_brightness(if time.playing { 1.0 } else { 0.0 });
        io.light_mut(BAR)
            .set_brightness_smooth(if bar { 1.0 } else { 0.0 }, dt * 0.5);
        io.light_mut(BEAT)
            .set_brightness_smooth(if beat { 1.0 } else { 0.0 }, dt);
        io.light_mut(CLOCK)
            .set_brightness_smooth(if clock { 1.0 } else { 0.0 }, dt * 2.0);
    }

    fn process_terminal_output(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}
}

// =============================================================================
// MIDI
// =============================================================================

/// Output indices of [`HostMidi`]
pub mod midi_ports {
    pub const PITCH: usize = 0;
    pub const GATE: usize = 1;
    pub const VELOCITY: usize = 2;
    pub const AFTERTOUCH: usize = 3;
    pub const PITCH_WHEEL: usize = 4;
    pub const MOD_WHEEL: usize = 5;
    pub const START: usize = 6;
    pub const STOP: usize = 7;
    pub const CONTINUE: usize = 8;
}

/// Monophonic MIDI to CV
///
/// Events are applied on the frame they are stamped with. The most recently
/// pressed key that is still held sets the pitch (0 V = C4); releasing it
/// falls back to the previous one without retriggering the gate.
pub struct HostMidi {
    host: Arc<HostContext>,
    block_frame: Option<i64>,
    next_event: usize,
    held_notes: Vec<u8>,
    pitch: f32,
    gate: bool,
    velocity: f32,
    aftertouch: f32,
    pitch_wheel: f32,
    mod_wheel: f32,
    start: PulseGenerator,
    stop: PulseGenerator,
    cont: PulseGenerator,
}

impl HostMidi {
    pub fn new(host: Arc<HostContext>) -> Self {
        Self {
            host,
            block_frame: None,
            next_event: 0,
            held_notes: Vec::with_capacity(128),
            pitch: 0.0,
            gate: false,
            velocity: 0.0,
            aftertouch: 0.0,
            pitch_wheel: 0.0,
            mod_wheel: 0.0,
            start: PulseGenerator::new(),
            stop: PulseGenerator::new(),
            cont: PulseGenerator::new(),
        }
    }

    pub fn held_notes(&self) -> &[u8] {
        &self.held_notes
    }

    fn note_to_voct(note: u8) -> f32 {
        (note as f32 - 60.0) / 12.0
    }

    fn handle_message(&mut self, msg: &[u8]) {
        let Some(&status) = msg.first() else {
            return;
        };

        match (status & 0xF0, msg.len()) {
            (0x90, 3) if msg[2] > 0 => {
                let note = msg[1];
                self.held_notes.retain(|&n| n != note);
                self.held_notes.push(note);
                self.pitch = Self::note_to_voct(note);
                self.velocity = msg[2] as f32 / 127.0 * 10.0;
                self.gate = true;
            }
            (0x80, 3) | (0x90, 3) => {
                let note = msg[1];
                self.held_notes.retain(|&n| n != note);
                match self.held_notes.last() {
                    Some(&last) => self.pitch = Self::note_to_voct(last),
                    None => self.gate = false,
                }
            }
            (0xB0, 3) => match msg[1] {
                1 => self.mod_wheel = msg[2] as f32 / 127.0 * 10.0,
                // all notes off
                123 => {
                    self.held_notes.clear();
                    self.gate = false;
                }
                _ => {}
            },
            (0xD0, 2) => self.aftertouch = msg[1] as f32 / 127.0 * 10.0,
            (0xE0, 3) => {
                let raw = msg[1] as u16 | ((msg[2] as u16) << 7);
                self.pitch_wheel = (raw as f32 - 8192.0) / 8192.0 * 5.0;
            }
            (0xF0, 1) => match status {
                0xFA => self.start.trigger(PULSE_DURATION),
                0xFB => self.cont.trigger(PULSE_DURATION),
                0xFC => self.stop.trigger(PULSE_DURATION),
                _ => {}
            },
            _ => {}
        }
    }

    fn clear(&mut self) {
        self.held_notes.clear();
        self.pitch = 0.0;
        self.gate = false;
        self.velocity = 0.0;
        self.aftertouch = 0.0;
        self.pitch_wheel = 0.0;
        self.mod_wheel = 0.0;
        self.start.reset();
        self.stop.reset();
        self.cont.reset();
    }
}

impl GraphModule for HostMidi {
    fn config(&self) -> ModuleConfig {
        ModuleConfig::new(HOST_PLUGIN, "HostMIDI")
            .output("V/Oct")
            .output("Gate")
            .output("Velocity")
            .output("Aftertouch")
            .output("Pitchbend")
            .output("Mod wheel")
            .output("Start")
            .output("Stop")
            .output("Continue")
    }

    fn process(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}

    fn as_terminal_mut(&mut self) -> Option<&mut dyn TerminalModule> {
        Some(self)
    }

    fn on_reset(&mut self, _io: &mut ModuleIo) {
        self.clear();
    }
}

impl TerminalModule for HostMidi {
    fn process_terminal_input(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo) {
        use midi_ports::*;

        if self.block_frame != Some(args.block_frame) {
            self.block_frame = Some(args.block_frame);
            self.next_event = 0;
        }

        // consumed even while bypassed so nothing replays on unbypass
        let offset = args.block_offset() as u32;
        let host = Arc::clone(&self.host);
        {
            let events = host.midi_events();
            while let Some(event) = events.get(self.next_event) {
                if event.frame > offset {
                    break;
                }
                self.handle_message(event.bytes());
                self.next_event += 1;
            }
        }

        if io.is_bypassed() {
            return;
        }
        let dt = args.sample_time;
        let trigger = |pulse: &mut PulseGenerator| if pulse.process(dt) { 10.0 } else { 0.0 };

        io.output_mut(PITCH).set_voltage(self.pitch, 0);
        io.output_mut(GATE)
            .set_voltage(if self.gate { 10.0 } else { 0.0 }, 0);
        io.output_mut(VELOCITY).set_voltage(self.velocity, 0);
        io.output_mut(AFTERTOUCH).set_voltage(self.aftertouch, 0);
        io.output_mut(PITCH_WHEEL).set_voltage(self.pitch_wheel, 0);
        io.output_mut(MOD_WHEEL).set_voltage(self.mod_wheel, 0);
        io.output_mut(START).set_voltage(trigger(&mut self.start), 0);
        io.output_mut(STOP).set_voltage(trigger(&mut self.stop), 0);
        io.output_mut(CONTINUE).set_voltage(trigger(&mut self.cont), 0);
    }

    fn process_terminal_output(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}
}
