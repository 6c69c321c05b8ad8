//! Modules: the nodes of the patch graph
//!
//! A [`Module`] pairs engine-owned runtime state ([`ModuleIo`]: params, ports,
//! lights, expander links) with a user-supplied [`GraphModule`] processor. The
//! engine owns every module; processors only ever see their own `ModuleIo`, plus
//! whatever their expander neighbours published through [`ProcessArgs`].

use crate::graph::ModuleKey;
use crate::light::Light;
use crate::param::{Param, ParamHandle, ParamId, ParamQuantity};
use crate::port::{Input, Output, PortInfo, PortType, PORT_LIGHT_DIVIDER};
use rand::Rng;
use std::fmt;
use std::sync::Arc;

/// Per-frame context handed to processors
#[derive(Debug, Clone, Copy)]
pub struct ProcessArgs<'a> {
    pub sample_rate: f32,
    pub sample_time: f32,
    /// Absolute frame counter of the engine
    pub frame: i64,
    /// Frame counter at the start of the current block
    pub block_frame: i64,
    left_message: Option<&'a [f32]>,
    right_message: Option<&'a [f32]>,
}

impl ProcessArgs<'static> {
    pub fn new(sample_rate: f32, sample_time: f32, frame: i64, block_frame: i64) -> Self {
        Self {
            sample_rate,
            sample_time,
            frame,
            block_frame,
            left_message: None,
            right_message: None,
        }
    }
}

impl<'a> ProcessArgs<'a> {
    pub(crate) fn with_messages<'b>(
        &self,
        left: Option<&'b [f32]>,
        right: Option<&'b [f32]>,
    ) -> ProcessArgs<'b> {
        ProcessArgs {
            sample_rate: self.sample_rate,
            sample_time: self.sample_time,
            frame: self.frame,
            block_frame: self.block_frame,
            left_message: left,
            right_message: right,
        }
    }

    /// Index of this frame within the current block
    pub fn block_offset(&self) -> usize {
        (self.frame - self.block_frame).max(0) as usize
    }

    /// The message most recently published by the neighbour on `side`
    ///
    /// A neighbour publishes by writing its own producer buffer facing us and
    /// requesting a flip; the engine swaps buffers at the start of the next
    /// frame, so a message written in frame K is readable here in frame K+1.
    pub fn expander_message(&self, side: ExpanderSide) -> Option<&'a [f32]> {
        match side {
            ExpanderSide::Left => self.left_message,
            ExpanderSide::Right => self.right_message,
        }
    }

    /// Whether plug lights are stepped on this frame
    pub fn is_light_frame(&self) -> bool {
        self.frame % PORT_LIGHT_DIVIDER == 0
    }
}

/// Which neighbour of a module an expander link refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpanderSide {
    Left,
    Right,
}

impl ExpanderSide {
    pub fn opposite(self) -> Self {
        match self {
            ExpanderSide::Left => ExpanderSide::Right,
            ExpanderSide::Right => ExpanderSide::Left,
        }
    }
}

/// Weak link to a neighbouring module plus a double-buffered outgoing message
#[derive(Debug, Clone, Default)]
pub struct Expander {
    /// Authoritative neighbour id
    pub(crate) module_id: Option<i64>,
    /// Cached arena key, refreshed by the engine once per block
    pub(crate) module: Option<ModuleKey>,
    producer_message: Vec<f32>,
    consumer_message: Vec<f32>,
    message_flip_requested: bool,
}

impl Expander {
    fn with_message_len(len: usize) -> Self {
        Self {
            producer_message: vec![0.0; len],
            consumer_message: vec![0.0; len],
            ..Self::default()
        }
    }

    pub fn module_id(&self) -> Option<i64> {
        self.module_id
    }

    /// Whether the neighbour id currently resolves to a live module
    pub fn is_linked(&self) -> bool {
        self.module.is_some()
    }

    /// Buffer to fill with the next outgoing message
    pub fn producer_message_mut(&mut self) -> &mut [f32] {
        &mut self.producer_message
    }

    /// The last published message, as seen by the neighbour
    pub fn consumer_message(&self) -> &[f32] {
        &self.consumer_message
    }

    /// Publish the producer buffer at the start of the next frame
    pub fn request_message_flip(&mut self) {
        self.message_flip_requested = true;
    }

    pub fn is_message_flip_requested(&self) -> bool {
        self.message_flip_requested
    }

    pub(crate) fn flip_message(&mut self) {
        if self.message_flip_requested {
            std::mem::swap(&mut self.producer_message, &mut self.consumer_message);
            self.message_flip_requested = false;
        }
    }

    pub(crate) fn unlink(&mut self) {
        self.module_id = None;
        self.module = None;
    }
}

/// Static shape of a module: slugs, params, ports, lights
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    pub plugin: String,
    pub model: String,
    pub params: Vec<ParamQuantity>,
    pub inputs: Vec<PortInfo>,
    pub outputs: Vec<PortInfo>,
    pub lights: usize,
    /// Length of each expander message buffer, 0 when the module does not talk to neighbours
    pub expander_message_len: usize,
}

impl ModuleConfig {
    pub fn new(plugin: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn param(mut self, quantity: ParamQuantity) -> Self {
        self.params.push(quantity);
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(PortInfo::new(name));
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(PortInfo::new(name));
        self
    }

    pub fn lights(mut self, count: usize) -> Self {
        self.lights = count;
        self
    }

    pub fn expander_message_len(mut self, len: usize) -> Self {
        self.expander_message_len = len;
        self
    }

    pub fn input_by_name(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    pub fn output_by_name(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }
}

/// Runtime state of a module that processors read and write
#[derive(Debug, Clone)]
pub struct ModuleIo {
    params: Vec<Param>,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    lights: Vec<Light>,
    pub left_expander: Expander,
    pub right_expander: Expander,
    config: ModuleConfig,
    bypassed: bool,
}

impl ModuleIo {
    pub fn new(config: ModuleConfig) -> Self {
        Self {
            params: config.params.iter().map(|q| Param::new(q.default)).collect(),
            inputs: vec![Input::new(); config.inputs.len()],
            outputs: vec![Output::new(); config.outputs.len()],
            lights: vec![Light::new(); config.lights],
            left_expander: Expander::with_message_len(config.expander_message_len),
            right_expander: Expander::with_message_len(config.expander_message_len),
            config,
            bypassed: false,
        }
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    pub fn param(&self, id: ParamId) -> f32 {
        self.params[id].value()
    }

    pub fn set_param(&mut self, id: ParamId, value: f32) {
        self.params[id].set_value(value);
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn param_quantity(&self, id: ParamId) -> Option<&ParamQuantity> {
        self.config.params.get(id)
    }

    pub fn input(&self, id: usize) -> &Input {
        &self.inputs[id]
    }

    pub fn input_mut(&mut self, id: usize) -> &mut Input {
        &mut self.inputs[id]
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn output(&self, id: usize) -> &Output {
        &self.outputs[id]
    }

    pub fn output_mut(&mut self, id: usize) -> &mut Output {
        &mut self.outputs[id]
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    /// Read inputs while writing outputs
    pub fn ports_mut(&mut self) -> (&[Input], &mut [Output]) {
        (&self.inputs, &mut self.outputs)
    }

    pub(crate) fn outputs_and_inputs_mut(&mut self) -> (&[Output], &mut [Input]) {
        (&self.outputs, &mut self.inputs)
    }

    pub(crate) fn inputs_mut(&mut self) -> &mut [Input] {
        &mut self.inputs
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut [Output] {
        &mut self.outputs
    }

    pub fn light(&self, id: usize) -> &Light {
        &self.lights[id]
    }

    pub fn light_mut(&mut self, id: usize) -> &mut Light {
        &mut self.lights[id]
    }

    pub fn expander(&self, side: ExpanderSide) -> &Expander {
        match side {
            ExpanderSide::Left => &self.left_expander,
            ExpanderSide::Right => &self.right_expander,
        }
    }

    pub fn expander_mut(&mut self, side: ExpanderSide) -> &mut Expander {
        match side {
            ExpanderSide::Left => &mut self.left_expander,
            ExpanderSide::Right => &mut self.right_expander,
        }
    }

    pub(crate) fn has_expander_links(&self) -> bool {
        self.left_expander.module.is_some() || self.right_expander.module.is_some()
    }

    pub(crate) fn flip_requested(&self) -> bool {
        self.left_expander.message_flip_requested || self.right_expander.message_flip_requested
    }

    fn step_lights(&mut self, delta_time: f32) {
        for input in &mut self.inputs {
            input.step_lights(delta_time);
        }
        for output in &mut self.outputs {
            output.step_lights(delta_time);
        }
    }
}

/// Event payload for [`GraphModule::on_sample_rate_change`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleRateChangeEvent {
    pub sample_rate: f32,
    pub sample_time: f32,
}

/// Event payload for [`GraphModule::on_port_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortChangeEvent {
    pub connecting: bool,
    pub port_type: PortType,
    pub port_id: usize,
}

/// Event payload for [`GraphModule::on_expander_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpanderChangeEvent {
    pub side: ExpanderSide,
}

/// Type-erased module interface for graph-based patching
///
/// Only `config` and `process` are required. Every hook receives the module's
/// own [`ModuleIo`]; none of them may block, and `process` runs on the audio
/// thread once per frame.
pub trait GraphModule: Send {
    /// Slugs, params, ports and lights. Called once when the module is built.
    fn config(&self) -> ModuleConfig;

    /// Process one frame: read inputs and params, write outputs and lights
    fn process(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo);

    /// Called instead of `process` while bypassed. Outputs start zeroed.
    fn process_bypass(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}

    /// Host-boundary modules return themselves here
    fn as_terminal_mut(&mut self) -> Option<&mut dyn TerminalModule> {
        None
    }

    fn on_add(&mut self, _io: &mut ModuleIo) {}

    fn on_remove(&mut self, _io: &mut ModuleIo) {}

    /// Params have already been reset to their defaults
    fn on_reset(&mut self, _io: &mut ModuleIo) {}

    /// Params have already been randomized
    fn on_randomize(&mut self, _io: &mut ModuleIo) {}

    fn on_bypass(&mut self, _io: &mut ModuleIo) {}

    fn on_unbypass(&mut self, _io: &mut ModuleIo) {}

    fn on_sample_rate_change(&mut self, _event: &SampleRateChangeEvent, _io: &mut ModuleIo) {}

    fn on_port_change(&mut self, _event: &PortChangeEvent, _io: &mut ModuleIo) {}

    fn on_expander_change(&mut self, _event: &ExpanderChangeEvent, _io: &mut ModuleIo) {}

    /// Flush any state that `data_to_json` should capture
    fn on_save(&mut self, _io: &mut ModuleIo) {}

    /// Param handles this module drives other modules' params through
    ///
    /// The engine registers them, at whatever target each one holds, when
    /// the module is added, and unregisters them when it is removed.
    fn param_handles(&self) -> Vec<Arc<ParamHandle>> {
        Vec::new()
    }

    /// Module-specific state stored under `"data"` in the patch
    fn data_to_json(&self) -> Option<serde_json::Value> {
        None
    }

    fn data_from_json(&mut self, _data: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// A module at the boundary with the host
///
/// Terminal modules are never topologically ordered. Each frame the engine
/// calls `process_terminal_input` on all of them before any ordinary module,
/// and `process_terminal_output` after all ordinary modules. Bypass is each
/// implementation's own concern.
pub trait TerminalModule: Send {
    /// Host → patch: write host data onto this module's outputs
    fn process_terminal_input(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo);

    /// Patch → host: read this module's inputs into host buffers
    fn process_terminal_output(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo);
}

/// A module instance as owned by the engine
pub struct Module {
    id: Option<i64>,
    terminal: bool,
    io: ModuleIo,
    processor: Box<dyn GraphModule>,
}

impl Module {
    pub fn new<M: GraphModule + 'static>(processor: M) -> Self {
        Self::from_boxed(Box::new(processor))
    }

    pub fn from_boxed(mut processor: Box<dyn GraphModule>) -> Self {
        let config = processor.config();
        let terminal = processor.as_terminal_mut().is_some();
        Self {
            id: None,
            terminal,
            io: ModuleIo::new(config),
            processor,
        }
    }

    /// Request a specific id; the engine replaces it if it collides
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: Option<i64>) {
        self.id = id;
    }

    pub fn plugin(&self) -> &str {
        &self.io.config.plugin
    }

    pub fn model(&self) -> &str {
        &self.io.config.model
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn is_bypassed(&self) -> bool {
        self.io.bypassed
    }

    pub fn io(&self) -> &ModuleIo {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut ModuleIo {
        &mut self.io
    }

    pub fn processor(&self) -> &dyn GraphModule {
        self.processor.as_ref()
    }

    pub(crate) fn processor_mut(&mut self) -> &mut dyn GraphModule {
        self.processor.as_mut()
    }

    pub(crate) fn process(&mut self, args: &ProcessArgs<'_>) {
        if self.io.bypassed {
            self.processor.process_bypass(args, &mut self.io);
        } else {
            self.processor.process(args, &mut self.io);
        }
    }

    pub(crate) fn process_terminal_input(&mut self, args: &ProcessArgs<'_>) {
        if let Some(terminal) = self.processor.as_terminal_mut() {
            terminal.process_terminal_input(args, &mut self.io);
        }
    }

    pub(crate) fn process_terminal_output(&mut self, args: &ProcessArgs<'_>) {
        if let Some(terminal) = self.processor.as_terminal_mut() {
            terminal.process_terminal_output(args, &mut self.io);
        }
    }

    pub(crate) fn flip_messages(&mut self) {
        self.io.left_expander.flip_message();
        self.io.right_expander.flip_message();
    }

    pub(crate) fn step_lights(&mut self, delta_time: f32) {
        self.io.step_lights(delta_time);
    }

    pub(crate) fn dispatch_add(&mut self) {
        self.processor.on_add(&mut self.io);
    }

    pub(crate) fn dispatch_remove(&mut self) {
        self.processor.on_remove(&mut self.io);
    }

    pub(crate) fn dispatch_sample_rate_change(&mut self, event: &SampleRateChangeEvent) {
        self.processor.on_sample_rate_change(event, &mut self.io);
    }

    pub(crate) fn dispatch_port_change(&mut self, event: &PortChangeEvent) {
        self.processor.on_port_change(event, &mut self.io);
    }

    pub(crate) fn dispatch_expander_change(&mut self, side: ExpanderSide) {
        self.processor
            .on_expander_change(&ExpanderChangeEvent { side }, &mut self.io);
    }

    pub(crate) fn dispatch_save(&mut self) {
        self.processor.on_save(&mut self.io);
    }

    pub(crate) fn reset(&mut self) {
        let ModuleIo { params, config, .. } = &mut self.io;
        for (param, quantity) in params.iter_mut().zip(&config.params) {
            quantity.reset(param);
        }
        self.processor.on_reset(&mut self.io);
    }

    pub(crate) fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let ModuleIo { params, config, .. } = &mut self.io;
        for (param, quantity) in params.iter_mut().zip(&config.params) {
            quantity.randomize(param, rng);
        }
        self.processor.on_randomize(&mut self.io);
    }

    /// Zero outputs, then flip the bypass flag and notify the processor
    pub(crate) fn set_bypassed(&mut self, bypassed: bool) {
        for output in &mut self.io.outputs {
            output.set_channels(0);
        }
        self.io.bypassed = bypassed;
        if bypassed {
            self.processor.on_bypass(&mut self.io);
        } else {
            self.processor.on_unbypass(&mut self.io);
        }
    }

    pub(crate) fn set_bypassed_flag(&mut self, bypassed: bool) {
        self.io.bypassed = bypassed;
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("plugin", &self.io.config.plugin)
            .field("model", &self.io.config.model)
            .field("terminal", &self.terminal)
            .field("bypassed", &self.io.bypassed)
            .finish()
    }
}
