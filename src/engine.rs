//! The Engine
//!
//! Wraps the [`Graph`] in a single reader/writer lock. The audio thread holds
//! the shared side for the whole of [`Engine::step_block`]; every graph
//! mutation takes the exclusive side and therefore waits at most one block.
//!
//! Within a block, modules are stepped one frame at a time: terminal inputs,
//! values queued on param handles, then ordinary modules in topological
//! order, then terminal outputs. Each
//! module's outputs are copied through their cables right after it runs, so
//! a chain of cables adds no latency inside a frame.

use crate::atomic::AtomicF64;
use crate::cable::{self, Cable};
use crate::error::EngineError;
use crate::graph::{Graph, ModuleKey, ModuleSlot, SmoothTarget};
use crate::meter::Meter;
use crate::module::{ExpanderSide, Module, ProcessArgs};
use crate::param::{ParamHandle, ParamId};
use crate::port::PORT_LIGHT_DIVIDER;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Decay rate of the parameter smoothing slot, in 1/s
pub const SMOOTH_LAMBDA: f32 = 60.0;

/// Default sample rate of a fresh engine
pub const DEFAULT_SAMPLE_RATE: f32 = 44100.0;

pub struct Engine {
    graph: RwLock<Graph>,
    frame: AtomicI64,
    block: AtomicI64,
    block_frame: AtomicI64,
    block_frames: AtomicUsize,
    /// Seconds since `epoch` at the start of the last block
    block_time: AtomicF64,
    epoch: Instant,
    meter: Mutex<Meter>,
}

impl Engine {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            graph: RwLock::new(Graph::new(sample_rate)),
            frame: AtomicI64::new(0),
            block: AtomicI64::new(0),
            block_frame: AtomicI64::new(0),
            block_frames: AtomicUsize::new(0),
            block_time: AtomicF64::new(0.0),
            epoch: Instant::now(),
            meter: Mutex::new(Meter::default()),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Graph> {
        self.graph.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Graph> {
        self.graph.write()
    }

    // Real-time path

    /// Process one host block of `frames` frames
    ///
    /// Must be called from a single audio thread, sequentially.
    pub fn step_block(&self, frames: usize) {
        if frames == 0 {
            return;
        }
        let start = Instant::now();
        let graph = self.graph.read();

        let block_frame = self.frame.load(Ordering::Relaxed);
        self.block_frame.store(block_frame, Ordering::Relaxed);
        self.block_time
            .set(start.duration_since(self.epoch).as_secs_f64());
        self.block_frames.store(frames, Ordering::Relaxed);

        graph.update_expanders();

        let sample_rate = graph.sample_rate();
        let sample_time = graph.sample_time();
        for _ in 0..frames {
            let frame = self.frame.load(Ordering::Relaxed);
            let args = ProcessArgs::new(sample_rate, sample_time, frame, block_frame);
            step_frame(&graph, &args);
            self.frame.store(frame + 1, Ordering::Relaxed);
        }

        self.block.fetch_add(1, Ordering::Relaxed);
        drop(graph);

        let now = Instant::now();
        let elapsed = now.duration_since(start).as_secs_f64();
        let load = elapsed / (frames as f64 * sample_time as f64);
        self.meter
            .lock()
            .add(load, now.duration_since(self.epoch).as_secs_f64());
    }

    // Modules

    /// Add a module, returning its id
    ///
    /// The module's requested id is kept unless it is unset or already taken.
    pub fn add_module(&self, module: Module) -> Result<i64, EngineError> {
        self.graph.write().add_module(module)
    }

    /// Remove a module and hand it back
    ///
    /// Fails while any cable still references the module.
    pub fn remove_module(&self, id: i64) -> Result<Module, EngineError> {
        self.graph.write().remove_module(id)
    }

    /// Remove every cable touching a module, then the module itself
    pub fn remove_module_and_cables(&self, id: i64) -> Result<Module, EngineError> {
        let mut graph = self.graph.write();
        if !graph.has_module(id) {
            return Err(EngineError::ModuleNotFound(id));
        }
        for cable_id in graph.cables_of(id) {
            graph.remove_cable(cable_id)?;
        }
        graph.remove_module(id)
    }

    pub fn has_module(&self, id: i64) -> bool {
        self.graph.read().has_module(id)
    }

    /// Inspect a module under the shared lock
    pub fn with_module<R>(&self, id: i64, f: impl FnOnce(&Module) -> R) -> Option<R> {
        let graph = self.graph.read();
        let slot = graph.slot_by_id(id)?;
        let result = f(&slot.module.lock());
        Some(result)
    }

    /// Mutate a module's runtime state (params, lights, processor) under the shared lock
    pub fn with_module_mut<R>(&self, id: i64, f: impl FnOnce(&mut Module) -> R) -> Option<R> {
        let graph = self.graph.read();
        let slot = graph.slot_by_id(id)?;
        let result = f(&mut slot.module.lock());
        Some(result)
    }

    pub fn module_ids(&self) -> Vec<i64> {
        self.graph.read().module_ids().collect()
    }

    /// Write as many module ids as fit into `ids`, returning how many were written
    pub fn module_ids_into(&self, ids: &mut [i64]) -> usize {
        let graph = self.graph.read();
        fill(ids, graph.module_ids())
    }

    pub fn num_modules(&self) -> usize {
        self.graph.read().num_modules()
    }

    /// Ids of ordinary modules in processing order
    pub fn module_order(&self) -> Vec<i64> {
        let graph = self.graph.read();
        let order = graph
            .order()
            .iter()
            .filter_map(|&key| graph.slot(key).map(|slot| slot.id))
            .collect();
        order
    }

    /// Point one side of a module's expander at a neighbour, or unlink it
    ///
    /// The neighbour does not have to exist yet; the link resolves at the
    /// start of the next block in which it does.
    pub fn set_module_expander(
        &self,
        id: i64,
        side: ExpanderSide,
        neighbour: Option<i64>,
    ) -> Result<(), EngineError> {
        self.graph.write().set_module_expander(id, side, neighbour)
    }

    pub fn bypass_module(&self, id: i64, bypassed: bool) -> Result<(), EngineError> {
        let mut graph = self.graph.write();
        let module = graph.module_mut(id)?;
        if module.is_bypassed() != bypassed {
            module.set_bypassed(bypassed);
            debug!(module_id = id, bypassed, "module bypass changed");
        }
        Ok(())
    }

    pub fn is_module_bypassed(&self, id: i64) -> Option<bool> {
        self.with_module(id, |m| m.is_bypassed())
    }

    pub fn reset_module(&self, id: i64) -> Result<(), EngineError> {
        let mut graph = self.graph.write();
        graph.module_mut(id)?.reset();
        // a reset may clear the targets of handles the module owns
        graph.refresh_param_handle_cache();
        Ok(())
    }

    pub fn randomize_module(&self, id: i64) -> Result<(), EngineError> {
        let mut rng = rand::thread_rng();
        self.graph.write().module_mut(id)?.randomize(&mut rng);
        Ok(())
    }

    // Cables

    pub fn add_cable(&self, cable: Cable) -> Result<i64, EngineError> {
        self.graph.write().add_cable(cable)
    }

    pub fn remove_cable(&self, id: i64) -> Result<Cable, EngineError> {
        self.graph.write().remove_cable(id)
    }

    pub fn has_cable(&self, id: i64) -> bool {
        self.graph.read().has_cable(id)
    }

    pub fn get_cable(&self, id: i64) -> Option<Cable> {
        self.graph.read().cable(id).cloned()
    }

    pub fn cable_ids(&self) -> Vec<i64> {
        self.graph.read().cables().filter_map(|c| c.id).collect()
    }

    pub fn cable_ids_into(&self, ids: &mut [i64]) -> usize {
        let graph = self.graph.read();
        fill(ids, graph.cables().filter_map(|c| c.id))
    }

    pub fn num_cables(&self) -> usize {
        self.graph.read().num_cables()
    }

    // Params

    pub fn param_value(&self, id: i64, param_id: ParamId) -> Option<f32> {
        self.with_module(id, |m| m.io().params().get(param_id).map(|p| p.value()))
            .flatten()
    }

    /// Set a param immediately, cancelling any smoothing aimed at it
    pub fn set_param_value(&self, id: i64, param_id: ParamId, value: f32) -> Result<(), EngineError> {
        let graph = self.graph.read();
        let key = graph.module_key(id).ok_or(EngineError::ModuleNotFound(id))?;
        let slot = graph.slot(key).ok_or(EngineError::ModuleNotFound(id))?;

        let mut smoothing = graph.smoothing.lock();
        if smoothing.is_some_and(|s| s.module == key && s.param_id == param_id) {
            *smoothing = None;
        }
        let mut module = slot.module.lock();
        check_param(&module, id, param_id)?;
        module.io_mut().set_param(param_id, value);
        Ok(())
    }

    /// Glide a param towards `value` over the next frames
    ///
    /// Only one param is smoothed at a time. If another param is in flight it
    /// jumps straight to its target first.
    pub fn set_param_smooth_value(
        &self,
        id: i64,
        param_id: ParamId,
        value: f32,
    ) -> Result<(), EngineError> {
        let graph = self.graph.read();
        let key = graph.module_key(id).ok_or(EngineError::ModuleNotFound(id))?;
        let slot = graph.slot(key).ok_or(EngineError::ModuleNotFound(id))?;
        check_param(&slot.module.lock(), id, param_id)?;

        let mut smoothing = graph.smoothing.lock();
        if let Some(previous) = *smoothing {
            if previous.module != key || previous.param_id != param_id {
                if let Some(other) = graph.slot(previous.module) {
                    other
                        .module
                        .lock()
                        .io_mut()
                        .set_param(previous.param_id, previous.value);
                }
            }
        }
        *smoothing = Some(SmoothTarget {
            module: key,
            param_id,
            value,
        });
        Ok(())
    }

    /// The smoothing target if this param is being smoothed, else its value
    pub fn param_smooth_value(&self, id: i64, param_id: ParamId) -> Option<f32> {
        let graph = self.graph.read();
        let key = graph.module_key(id)?;
        let target = *graph.smoothing.lock();
        match target {
            Some(s) if s.module == key && s.param_id == param_id => Some(s.value),
            _ => {
                let slot = graph.slot(key)?;
                let value = slot.module.lock().io().params().get(param_id).map(|p| p.value());
                value
            }
        }
    }

    // Param handles

    /// Register a blank handle
    pub fn add_param_handle(&self, handle: &Arc<ParamHandle>) -> Result<(), EngineError> {
        self.graph.write().add_param_handle(handle)
    }

    pub fn remove_param_handle(&self, handle: &Arc<ParamHandle>) -> Result<(), EngineError> {
        self.graph.write().remove_param_handle(handle)
    }

    pub fn param_handle(&self, module_id: i64, param_id: ParamId) -> Option<Arc<ParamHandle>> {
        self.graph.read().param_handle(module_id, param_id)
    }

    pub fn update_param_handle(
        &self,
        handle: &Arc<ParamHandle>,
        module_id: Option<i64>,
        param_id: ParamId,
        overwrite: bool,
    ) -> Result<(), EngineError> {
        self.graph
            .write()
            .update_param_handle(handle, module_id, param_id, overwrite)
    }

    // Sample rate and telemetry

    pub fn set_sample_rate(&self, sample_rate: f32) {
        if !(sample_rate > 0.0) || !sample_rate.is_finite() {
            warn!(sample_rate, "ignoring invalid sample rate");
            return;
        }
        let mut graph = self.graph.write();
        if graph.sample_rate() == sample_rate {
            return;
        }
        graph.set_sample_rate(sample_rate);
        info!(sample_rate, "sample rate changed");
    }

    pub fn sample_rate(&self) -> f32 {
        self.graph.read().sample_rate()
    }

    pub fn sample_time(&self) -> f32 {
        self.graph.read().sample_time()
    }

    /// Number of completed blocks
    pub fn block(&self) -> i64 {
        self.block.load(Ordering::Relaxed)
    }

    /// Number of frames processed so far
    pub fn frame(&self) -> i64 {
        self.frame.load(Ordering::Relaxed)
    }

    pub fn set_frame(&self, frame: i64) {
        self.frame.store(frame, Ordering::Relaxed);
    }

    /// Frame counter at the start of the current (or last) block
    pub fn block_frame(&self) -> i64 {
        self.block_frame.load(Ordering::Relaxed)
    }

    /// Seconds since engine creation at the start of the current block
    pub fn block_time(&self) -> f64 {
        self.block_time.get()
    }

    pub fn block_frames(&self) -> usize {
        self.block_frames.load(Ordering::Relaxed)
    }

    /// Audio duration of the current block in seconds
    pub fn block_duration(&self) -> f64 {
        self.block_frames() as f64 * self.sample_time() as f64
    }

    /// Average block load over the last published window
    pub fn meter_average(&self) -> f64 {
        self.meter.lock().average()
    }

    pub fn meter_max(&self) -> f64 {
        self.meter.lock().max()
    }

    // Persistence helpers and teardown

    /// Give every module a chance to flush state before `to_json`
    pub fn prepare_save(&self) {
        let graph = self.graph.read();
        for slot in graph.slots() {
            slot.module.lock().dispatch_save();
        }
    }

    /// Remove every param handle, cable and module
    pub fn clear(&self) {
        self.graph.write().clear();
        debug!("engine cleared");
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let graph = self.graph.read();
        f.debug_struct("Engine")
            .field("sample_rate", &graph.sample_rate())
            .field("modules", &graph.num_modules())
            .field("cables", &graph.num_cables())
            .field("frame", &self.frame())
            .finish()
    }
}

fn fill(ids: &mut [i64], source: impl Iterator<Item = i64>) -> usize {
    let mut n = 0;
    for (dst, id) in ids.iter_mut().zip(source) {
        *dst = id;
        n += 1;
    }
    n
}

fn check_param(module: &Module, id: i64, param_id: ParamId) -> Result<(), EngineError> {
    if param_id < module.io().params().len() {
        Ok(())
    } else {
        Err(EngineError::ParamOutOfRange {
            module_id: id,
            param_id,
        })
    }
}

fn step_frame(graph: &Graph, args: &ProcessArgs<'_>) {
    step_smoothing(graph, args.sample_time);

    for slot in graph.slots() {
        if slot.flip_pending.swap(false, Ordering::AcqRel) {
            slot.module.lock().flip_messages();
        }
    }

    for &key in graph.terminals() {
        if let Some(slot) = graph.slot(key) {
            let mut module = slot.module.lock();
            module.process_terminal_input(args);
            propagate_outputs(graph, key, &mut module);
        }
    }
    apply_param_handles(graph);

    for &key in graph.order() {
        if let Some(slot) = graph.slot(key) {
            process_module(graph, key, slot, args);
        }
    }

    for &key in graph.terminals() {
        if let Some(slot) = graph.slot(key) {
            let mut module = slot.module.lock();
            module.process_terminal_output(args);
            if module.io().flip_requested() {
                slot.flip_pending.store(true, Ordering::Release);
            }
        }
    }

    if args.is_light_frame() {
        let delta_time = args.sample_time * PORT_LIGHT_DIVIDER as f32;
        for slot in graph.slots() {
            slot.module.lock().step_lights(delta_time);
        }
    }
}

/// Write values queued on param handles into their mapped params
fn apply_param_handles(graph: &Graph) {
    for handle in graph.param_handles() {
        let Some(scaled) = handle.take_pending() else {
            continue;
        };
        let target = handle.target();
        let Some(slot) = target.module.and_then(|key| graph.slot(key)) else {
            continue;
        };
        let mut module = slot.module.lock();
        let io = module.io_mut();
        let value = io
            .param_quantity(target.param_id)
            .map(|quantity| quantity.from_scaled(scaled));
        if let Some(value) = value {
            io.set_param(target.param_id, value);
        }
    }
}

fn step_smoothing(graph: &Graph, sample_time: f32) {
    let mut smoothing = graph.smoothing.lock();
    let Some(target) = *smoothing else {
        return;
    };
    let Some(slot) = graph.slot(target.module) else {
        *smoothing = None;
        return;
    };
    let mut module = slot.module.lock();
    let io = module.io_mut();
    let value = io.param(target.param_id);
    let next = value + (target.value - value) * SMOOTH_LAMBDA * sample_time;
    if next == value {
        io.set_param(target.param_id, target.value);
        *smoothing = None;
    } else {
        io.set_param(target.param_id, next);
    }
}

fn process_module(graph: &Graph, key: ModuleKey, slot: &ModuleSlot, args: &ProcessArgs<'_>) {
    let mut module = slot.module.lock();

    if module.io().has_expander_links() {
        let left_key = module.io().left_expander.module;
        let right_key = module.io().right_expander.module;
        let shared = right_key.is_some() && right_key == left_key;

        let left = left_key
            .and_then(|k| graph.slot(k))
            .map(|s| s.module.lock());
        let right = if shared {
            None
        } else {
            right_key.and_then(|k| graph.slot(k)).map(|s| s.module.lock())
        };

        // The neighbour's expander facing us holds what it published
        let left_message = left
            .as_ref()
            .map(|m| m.io().right_expander.consumer_message());
        let right_message = if shared {
            left.as_ref().map(|m| m.io().left_expander.consumer_message())
        } else {
            right
                .as_ref()
                .map(|m| m.io().left_expander.consumer_message())
        };

        let args = args.with_messages(
            left_message.filter(|m| !m.is_empty()),
            right_message.filter(|m| !m.is_empty()),
        );
        module.process(&args);
    } else {
        module.process(args);
    }

    if module.io().flip_requested() {
        slot.flip_pending.store(true, Ordering::Release);
    }
    propagate_outputs(graph, key, &mut module);
}

/// Copy every output of a locked module through its cables
fn propagate_outputs(graph: &Graph, key: ModuleKey, module: &mut Module) {
    let (outputs, inputs) = module.io_mut().outputs_and_inputs_mut();
    for output in outputs {
        for &cable_key in &output.cables {
            let Some(cable) = graph.cable_slot(cable_key) else {
                continue;
            };
            let input_id = cable.cable.input_id;
            if cable.input_module == key {
                if let Some(input) = inputs.get_mut(input_id) {
                    cable::propagate(output, input);
                }
            } else if let Some(target) = graph.slot(cable.input_module) {
                let mut target = target.module.lock();
                if let Some(input) = target.io_mut().inputs_mut().get_mut(input_id) {
                    cable::propagate(output, input);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::AtomicF32;
    use crate::module::{GraphModule, ModuleConfig, ModuleIo, SampleRateChangeEvent, TerminalModule};
    use crate::modules::Gain;
    use crate::param::ParamQuantity;
    use approx::assert_relative_eq;

    /// Terminal that feeds a constant and captures what comes back
    struct Loopback {
        level: f32,
        captured: Arc<AtomicF32>,
    }

    impl GraphModule for Loopback {
        fn config(&self) -> ModuleConfig {
            ModuleConfig::new("Test", "Loopback").input("in").output("out")
        }

        fn process(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}

        fn as_terminal_mut(&mut self) -> Option<&mut dyn TerminalModule> {
            Some(self)
        }
    }

    impl TerminalModule for Loopback {
        fn process_terminal_input(&mut self, _args: &ProcessArgs<'_>, io: &mut ModuleIo) {
            io.output_mut(0).set_voltage(self.level, 0);
        }

        fn process_terminal_output(&mut self, _args: &ProcessArgs<'_>, io: &mut ModuleIo) {
            self.captured.set(io.input(0).voltage(0));
        }
    }

    /// Writes the frame number to both outputs
    struct Counter;

    impl GraphModule for Counter {
        fn config(&self) -> ModuleConfig {
            ModuleConfig::new("Test", "Counter")
                .input("in")
                .output("a")
                .output("b")
        }

        fn process(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo) {
            let v = args.frame as f32;
            io.output_mut(0).set_voltage(v, 0);
            io.output_mut(1).set_voltage(v, 0);
        }
    }

    /// Copies input 0 to output 0
    struct Wire;

    impl GraphModule for Wire {
        fn config(&self) -> ModuleConfig {
            ModuleConfig::new("Test", "Wire").input("in").output("out")
        }

        fn process(&mut self, _args: &ProcessArgs<'_>, io: &mut ModuleIo) {
            let v = io.input(0).voltage(0);
            io.output_mut(0).set_voltage(v, 0);
        }
    }

    /// Publishes `frame + 1` to its right neighbour every frame
    struct Producer;

    impl GraphModule for Producer {
        fn config(&self) -> ModuleConfig {
            ModuleConfig::new("Test", "Producer").expander_message_len(1)
        }

        fn process(&mut self, args: &ProcessArgs<'_>, io: &mut ModuleIo) {
            io.right_expander.producer_message_mut()[0] = (args.frame + 1) as f32;
            io.right_expander.request_message_flip();
        }
    }

    struct Consumer {
        seen: Arc<Mutex<Vec<Option<f32>>>>,
    }

    impl GraphModule for Consumer {
        fn config(&self) -> ModuleConfig {
            ModuleConfig::new("Test", "Consumer")
        }

        fn process(&mut self, args: &ProcessArgs<'_>, _io: &mut ModuleIo) {
            let message = args.expander_message(ExpanderSide::Left).map(|m| m[0]);
            self.seen.lock().push(message);
        }
    }

    #[derive(Default)]
    struct RateRecorder {
        rates: Arc<Mutex<Vec<f32>>>,
    }

    impl GraphModule for RateRecorder {
        fn config(&self) -> ModuleConfig {
            ModuleConfig::new("Test", "RateRecorder")
                .param(ParamQuantity::new("level", 0.0, 10.0, 1.0))
        }

        fn process(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}

        fn on_sample_rate_change(&mut self, event: &SampleRateChangeEvent, _io: &mut ModuleIo) {
            self.rates.lock().push(event.sample_rate);
        }
    }

    fn loopback(level: f32) -> (Module, Arc<AtomicF32>) {
        let captured = Arc::new(AtomicF32::new(0.0));
        let module = Module::new(Loopback {
            level,
            captured: Arc::clone(&captured),
        });
        (module, captured)
    }

    #[test]
    fn test_terminal_gain_terminal_chain() {
        let engine = Engine::new(48000.0);
        let (host, captured) = loopback(5.0);
        let host = engine.add_module(host).unwrap();
        let gain = engine.add_module(Module::new(Gain::new())).unwrap();
        engine.set_param_value(gain, 0, 2.0).unwrap();
        engine.add_cable(Cable::new(host, 0, gain, 0)).unwrap();
        engine.add_cable(Cable::new(gain, 0, host, 0)).unwrap();

        engine.step_block(1);

        let seen = engine.with_module(gain, |m| m.io().input(0).voltage(0)).unwrap();
        assert_relative_eq!(seen, 5.0);
        assert_relative_eq!(captured.get(), 10.0);
        assert_eq!(engine.frame(), 1);
        assert_eq!(engine.block(), 1);
    }

    #[test]
    fn test_feedback_loop_with_side_chain() {
        let engine = Engine::new(48000.0);
        let a = engine.add_module(Module::new(Counter)).unwrap();
        let b = engine.add_module(Module::new(Wire)).unwrap();
        let c = engine.add_module(Module::new(Wire)).unwrap();
        engine.add_cable(Cable::new(a, 0, b, 0)).unwrap();
        engine.add_cable(Cable::new(b, 0, a, 0)).unwrap();
        engine.add_cable(Cable::new(a, 1, c, 0)).unwrap();

        engine.step_block(4);

        assert_eq!(engine.module_order().len(), 3);
        assert_eq!(engine.module_order()[0], a);
        let c_in = engine.with_module(c, |m| m.io().input(0).voltage(0)).unwrap();
        assert_eq!(c_in, 3.0);
        let a_in = engine.with_module(a, |m| m.io().input(0).voltage(0)).unwrap();
        assert_eq!(a_in, 3.0);
    }

    #[test]
    fn test_expander_message_has_one_frame_latency() {
        for consumer_first in [false, true] {
            let engine = Engine::new(48000.0);
            let seen = Arc::new(Mutex::new(Vec::new()));
            let consumer = Module::new(Consumer {
                seen: Arc::clone(&seen),
            });
            let (p, c) = if consumer_first {
                let c = engine.add_module(consumer).unwrap();
                (engine.add_module(Module::new(Producer)).unwrap(), c)
            } else {
                let p = engine.add_module(Module::new(Producer)).unwrap();
                (p, engine.add_module(consumer).unwrap())
            };
            engine.set_module_expander(p, ExpanderSide::Right, Some(c)).unwrap();
            engine.set_module_expander(c, ExpanderSide::Left, Some(p)).unwrap();

            engine.step_block(4);

            // frame k sees what was written in frame k - 1, which is k
            assert_eq!(
                *seen.lock(),
                vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0)]
            );
        }
    }

    #[test]
    fn test_expander_unresolved_after_neighbour_removed() {
        let engine = Engine::new(48000.0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let p = engine.add_module(Module::new(Producer)).unwrap();
        let c = engine
            .add_module(Module::new(Consumer {
                seen: Arc::clone(&seen),
            }))
            .unwrap();
        engine.set_module_expander(c, ExpanderSide::Left, Some(p)).unwrap();
        engine.step_block(1);
        engine.remove_module(p).unwrap();
        engine.step_block(1);
        assert_eq!(seen.lock().last(), Some(&None));
        assert_eq!(
            engine.with_module(c, |m| m.io().left_expander.module_id()),
            Some(None)
        );
    }

    #[test]
    fn test_smoothing_converges_and_clears() {
        let engine = Engine::new(48000.0);
        let gain = engine.add_module(Module::new(Gain::new())).unwrap();
        engine.set_param_value(gain, 0, 1.0).unwrap();
        engine.set_param_smooth_value(gain, 0, 2.0).unwrap();
        assert_eq!(engine.param_smooth_value(gain, 0), Some(2.0));

        engine.step_block(1);
        let after_one = engine.param_value(gain, 0).unwrap();
        assert_relative_eq!(after_one, 1.0 + 60.0 / 48000.0, epsilon = 1e-6);

        for _ in 0..100 {
            engine.step_block(480);
        }
        assert_eq!(engine.param_value(gain, 0), Some(2.0));
        assert!(engine.read().smoothing.lock().is_none());
    }

    #[test]
    fn test_smoothing_retarget_jumps_previous() {
        let engine = Engine::new(48000.0);
        let a = engine.add_module(Module::new(Gain::new())).unwrap();
        let b = engine.add_module(Module::new(Gain::new())).unwrap();
        engine.set_param_smooth_value(a, 0, 1.5).unwrap();
        engine.set_param_smooth_value(b, 0, 0.5).unwrap();
        assert_eq!(engine.param_value(a, 0), Some(1.5));

        engine.set_param_value(b, 0, 0.25).unwrap();
        assert!(engine.read().smoothing.lock().is_none());
        assert_eq!(engine.param_smooth_value(b, 0), Some(0.25));
    }

    #[test]
    fn test_param_errors() {
        let engine = Engine::new(48000.0);
        let gain = engine.add_module(Module::new(Gain::new())).unwrap();
        assert_eq!(
            engine.set_param_value(gain, 9, 1.0),
            Err(EngineError::ParamOutOfRange { module_id: gain, param_id: 9 })
        );
        assert_eq!(
            engine.set_param_smooth_value(12, 0, 1.0),
            Err(EngineError::ModuleNotFound(12))
        );
        assert_eq!(engine.param_value(gain, 9), None);
    }

    #[test]
    fn test_bypass_zeroes_and_skips_process() {
        let engine = Engine::new(48000.0);
        let (host, captured) = loopback(5.0);
        let host = engine.add_module(host).unwrap();
        let gain = engine.add_module(Module::new(Gain::new())).unwrap();
        engine.add_cable(Cable::new(host, 0, gain, 0)).unwrap();
        engine.add_cable(Cable::new(gain, 0, host, 0)).unwrap();
        engine.step_block(1);
        assert_relative_eq!(captured.get(), 5.0);

        engine.bypass_module(gain, true).unwrap();
        assert_eq!(engine.is_module_bypassed(gain), Some(true));
        engine.step_block(1);
        assert_eq!(captured.get(), 0.0);

        engine.bypass_module(gain, false).unwrap();
        engine.step_block(1);
        assert_relative_eq!(captured.get(), 5.0);
    }

    #[test]
    fn test_sample_rate_events() {
        let engine = Engine::new(48000.0);
        let recorder = RateRecorder::default();
        let rates = Arc::clone(&recorder.rates);
        engine.add_module(Module::new(recorder)).unwrap();
        engine.set_sample_rate(48000.0);
        engine.set_sample_rate(96000.0);
        engine.set_sample_rate(-1.0);
        assert_eq!(*rates.lock(), vec![48000.0, 96000.0]);
        assert_relative_eq!(engine.sample_time(), 1.0 / 96000.0);
    }

    #[test]
    fn test_telemetry() {
        let engine = Engine::new(48000.0);
        engine.add_module(Module::new(Counter)).unwrap();
        engine.step_block(64);
        engine.step_block(32);
        assert_eq!(engine.block(), 2);
        assert_eq!(engine.frame(), 96);
        assert_eq!(engine.block_frame(), 64);
        assert_eq!(engine.block_frames(), 32);
        assert_relative_eq!(engine.block_duration(), 32.0 / 48000.0, epsilon = 1e-9);
        assert!(engine.block_time() >= 0.0);
        assert!(engine.meter_average() >= 0.0);

        engine.set_frame(1000);
        engine.step_block(0);
        assert_eq!(engine.frame(), 1000);
    }

    #[test]
    fn test_remove_module_and_cables() {
        let engine = Engine::new(48000.0);
        let a = engine.add_module(Module::new(Counter)).unwrap();
        let b = engine.add_module(Module::new(Wire)).unwrap();
        let c = engine.add_cable(Cable::new(a, 0, b, 0)).unwrap();
        assert!(engine.remove_module(a).is_err());
        assert!(engine.has_cable(c));

        let module = engine.remove_module_and_cables(a).unwrap();
        assert_eq!(module.model(), "Counter");
        assert_eq!(engine.num_cables(), 0);
        assert_eq!(engine.module_ids(), vec![b]);
        assert!(!engine
            .with_module(b, |m| m.io().input(0).is_connected())
            .unwrap());
    }

    #[test]
    fn test_ids_into_buffers() {
        let engine = Engine::new(48000.0);
        let ids: Vec<i64> = (0..3)
            .map(|_| engine.add_module(Module::new(Wire)).unwrap())
            .collect();
        engine.add_cable(Cable::new(ids[0], 0, ids[1], 0).with_id(77)).unwrap();

        let mut buf = [0i64; 2];
        assert_eq!(engine.module_ids_into(&mut buf), 2);
        assert_eq!(&buf, &ids[..2]);
        let mut buf = [0i64; 4];
        assert_eq!(engine.cable_ids_into(&mut buf), 1);
        assert_eq!(buf[0], 77);
        assert_eq!(engine.get_cable(77).unwrap().input_module_id, ids[1]);
    }

    #[test]
    fn test_plug_lights_follow_voltage() {
        let engine = Engine::new(48000.0);
        let (host, _) = loopback(10.0);
        let host = engine.add_module(host).unwrap();
        let wire = engine.add_module(Module::new(Wire)).unwrap();
        engine.add_cable(Cable::new(host, 0, wire, 0)).unwrap();
        engine.step_block(1);
        let green = engine
            .with_module(wire, |m| m.io().input(0).plug_lights[1].brightness())
            .unwrap();
        assert_relative_eq!(green, 1.0);
    }

    #[test]
    fn test_mutation_while_audio_thread_runs() {
        let engine = Arc::new(Engine::new(48000.0));
        let a = engine.add_module(Module::new(Counter)).unwrap();
        let b = engine.add_module(Module::new(Wire)).unwrap();

        let audio = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    engine.step_block(64);
                }
            })
        };

        for _ in 0..50 {
            let cable = engine.add_cable(Cable::new(a, 0, b, 0)).unwrap();
            engine.set_param_value(a, 0, 0.0).unwrap_err();
            engine.remove_cable(cable).unwrap();
        }
        audio.join().unwrap();

        assert_eq!(engine.frame(), 200 * 64);
        assert_eq!(engine.num_cables(), 0);
    }

    #[test]
    fn test_clear_and_reuse() {
        let engine = Engine::default();
        let a = engine.add_module(Module::new(Counter)).unwrap();
        let b = engine.add_module(Module::new(Wire)).unwrap();
        engine.add_cable(Cable::new(a, 0, b, 0)).unwrap();
        engine.clear();
        assert_eq!(engine.num_modules(), 0);
        assert_eq!(engine.num_cables(), 0);
        engine.step_block(16);
        assert_eq!(engine.frame(), 16);
    }

    /// Marks its only param as saved when the patch is about to be written
    struct SaveMarker;

    impl GraphModule for SaveMarker {
        fn config(&self) -> ModuleConfig {
            ModuleConfig::new("Test", "SaveMarker").param(ParamQuantity::new("saved", 0.0, 1.0, 0.0))
        }

        fn process(&mut self, _args: &ProcessArgs<'_>, _io: &mut ModuleIo) {}

        fn on_save(&mut self, io: &mut ModuleIo) {
            io.set_param(0, 1.0);
        }
    }

    #[test]
    fn test_prepare_save_reaches_every_module() {
        let engine = Engine::default();
        let ids: Vec<i64> = (0..3)
            .map(|_| engine.add_module(Module::new(SaveMarker)).unwrap())
            .collect();
        engine.prepare_save();
        for id in ids {
            assert_eq!(engine.param_value(id, 0), Some(1.0));
        }
    }
}
