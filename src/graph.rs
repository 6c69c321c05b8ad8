//! Patch Graph
//!
//! The graph owns every module and cable and keeps the derived state the
//! audio thread relies on: id lookup caches, the per-output cable lists,
//! port connectivity and the processing order of ordinary modules.
//!
//! Everything here runs under the engine's lock. Mutating methods take
//! `&mut self` (exclusive lock) and reach modules through `Mutex::get_mut`,
//! so they never contend with the audio thread.

use crate::cable::Cable;
use crate::error::EngineError;
use crate::module::{ExpanderSide, Module, PortChangeEvent, SampleRateChangeEvent};
use crate::param::{HandleTarget, ParamHandle, ParamId};
use crate::port::PortType;
use parking_lot::Mutex;
use rand::Rng;
use slotmap::{new_key_type, SlotMap};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, warn};

new_key_type! {
    /// Arena key of a module slot; stale keys fail lookups instead of dangling
    pub struct ModuleKey;
    /// Arena key of a cable slot
    pub struct CableKey;
}

/// Engine-assigned ids stay below 2^53 so they survive a JSON double
pub const MAX_ID: i64 = 1 << 53;

pub(crate) struct ModuleSlot {
    pub(crate) id: i64,
    pub(crate) terminal: bool,
    /// Set after `process` when an expander asked for a message flip
    pub(crate) flip_pending: AtomicBool,
    pub(crate) module: Mutex<Module>,
}

pub(crate) struct CableSlot {
    pub(crate) cable: Cable,
    pub(crate) output_module: ModuleKey,
    pub(crate) input_module: ModuleKey,
}

/// The single in-flight parameter smoothing target
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SmoothTarget {
    pub(crate) module: ModuleKey,
    pub(crate) param_id: ParamId,
    pub(crate) value: f32,
}

pub(crate) struct Graph {
    modules: SlotMap<ModuleKey, ModuleSlot>,
    /// Ordinary modules in registration order
    ordinary: Vec<ModuleKey>,
    /// Terminal modules in registration order
    terminals: Vec<ModuleKey>,
    /// Ordinary modules in processing order
    order: Vec<ModuleKey>,
    cables: SlotMap<CableKey, CableSlot>,
    cable_list: Vec<CableKey>,
    modules_cache: HashMap<i64, ModuleKey>,
    cables_cache: HashMap<i64, CableKey>,
    param_handles: Vec<Arc<ParamHandle>>,
    param_handles_cache: HashMap<(i64, ParamId), Arc<ParamHandle>>,
    pub(crate) smoothing: Mutex<Option<SmoothTarget>>,
    sample_rate: f32,
    sample_time: f32,
}

impl Graph {
    pub(crate) fn new(sample_rate: f32) -> Self {
        Self {
            modules: SlotMap::with_key(),
            ordinary: Vec::new(),
            terminals: Vec::new(),
            order: Vec::new(),
            cables: SlotMap::with_key(),
            cable_list: Vec::new(),
            modules_cache: HashMap::new(),
            cables_cache: HashMap::new(),
            param_handles: Vec::new(),
            param_handles_cache: HashMap::new(),
            smoothing: Mutex::new(None),
            sample_rate,
            sample_time: 1.0 / sample_rate,
        }
    }

    pub(crate) fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub(crate) fn sample_time(&self) -> f32 {
        self.sample_time
    }

    // Lookups

    pub(crate) fn module_key(&self, id: i64) -> Option<ModuleKey> {
        self.modules_cache.get(&id).copied()
    }

    pub(crate) fn slot(&self, key: ModuleKey) -> Option<&ModuleSlot> {
        self.modules.get(key)
    }

    pub(crate) fn slot_by_id(&self, id: i64) -> Option<&ModuleSlot> {
        self.module_key(id).and_then(|key| self.modules.get(key))
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = &ModuleSlot> {
        self.modules.values()
    }

    /// Exclusive access to a module without locking its mutex
    pub(crate) fn module_mut(&mut self, id: i64) -> Result<&mut Module, EngineError> {
        let key = self
            .module_key(id)
            .ok_or(EngineError::ModuleNotFound(id))?;
        self.modules
            .get_mut(key)
            .map(|slot| slot.module.get_mut())
            .ok_or(EngineError::ModuleNotFound(id))
    }

    pub(crate) fn cable_slot(&self, key: CableKey) -> Option<&CableSlot> {
        self.cables.get(key)
    }

    pub(crate) fn ordinary(&self) -> &[ModuleKey] {
        &self.ordinary
    }

    pub(crate) fn terminals(&self) -> &[ModuleKey] {
        &self.terminals
    }

    pub(crate) fn order(&self) -> &[ModuleKey] {
        &self.order
    }

    /// Ordinary modules in registration order, then terminal modules
    pub(crate) fn module_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.ordinary
            .iter()
            .chain(&self.terminals)
            .filter_map(|&key| self.modules.get(key).map(|slot| slot.id))
    }

    pub(crate) fn num_modules(&self) -> usize {
        self.modules.len()
    }

    pub(crate) fn has_module(&self, id: i64) -> bool {
        self.modules_cache.contains_key(&id)
    }

    pub(crate) fn cable(&self, id: i64) -> Option<&Cable> {
        self.cables_cache
            .get(&id)
            .and_then(|&key| self.cables.get(key))
            .map(|slot| &slot.cable)
    }

    /// Cables in insertion order
    pub(crate) fn cables(&self) -> impl Iterator<Item = &Cable> {
        self.cable_list
            .iter()
            .filter_map(|&key| self.cables.get(key).map(|slot| &slot.cable))
    }

    pub(crate) fn num_cables(&self) -> usize {
        self.cables.len()
    }

    pub(crate) fn has_cable(&self, id: i64) -> bool {
        self.cables_cache.contains_key(&id)
    }

    // Modules

    pub(crate) fn add_module(&mut self, mut module: Module) -> Result<i64, EngineError> {
        let id = match module.id() {
            Some(id) if (0..MAX_ID).contains(&id) && !self.modules_cache.contains_key(&id) => id,
            _ => self.fresh_id(|graph, id| graph.modules_cache.contains_key(&id)),
        };
        module.set_id(Some(id));

        let terminal = module.is_terminal();
        let key = self.modules.insert(ModuleSlot {
            id,
            terminal,
            flip_pending: AtomicBool::new(false),
            module: Mutex::new(module),
        });
        if terminal {
            self.terminals.push(key);
        } else {
            self.ordinary.push(key);
        }
        self.modules_cache.insert(id, key);

        let event = SampleRateChangeEvent {
            sample_rate: self.sample_rate,
            sample_time: self.sample_time,
        };
        let module = self.modules[key].module.get_mut();
        module.dispatch_add();
        module.dispatch_sample_rate_change(&event);
        debug!(
            module_id = id,
            plugin = module.plugin(),
            model = module.model(),
            terminal,
            "module added"
        );

        for handle in &self.param_handles {
            if handle.module_id() == Some(id) {
                self.resolve_param_handle(handle, Some(key));
            }
        }
        let owned = self.modules[key].module.get_mut().processor().param_handles();
        self.adopt_param_handles(id, &owned);

        self.refresh_order();
        Ok(id)
    }

    /// Remove a module that no cable references anymore
    pub(crate) fn remove_module(&mut self, id: i64) -> Result<Module, EngineError> {
        let key = self
            .module_key(id)
            .ok_or(EngineError::ModuleNotFound(id))?;
        let count = self
            .cables
            .values()
            .filter(|c| c.output_module == key || c.input_module == key)
            .count();
        if count > 0 {
            warn!(module_id = id, cables = count, "refusing to remove module with cables attached");
            return Err(EngineError::ModuleHasCables {
                module_id: id,
                count,
            });
        }

        self.modules[key].module.get_mut().dispatch_remove();

        let owned = self.modules[key].module.get_mut().processor().param_handles();
        if !owned.is_empty() {
            self.param_handles
                .retain(|h| !owned.iter().any(|o| Arc::ptr_eq(o, h)));
            for handle in &owned {
                handle.set_module(None);
            }
            self.refresh_param_handle_cache();
        }

        for handle in &self.param_handles {
            if handle.target().module == Some(key) {
                handle.set_module(None);
            }
        }

        let smoothing = self.smoothing.get_mut();
        if smoothing.is_some_and(|s| s.module == key) {
            *smoothing = None;
        }

        for (other_key, slot) in self.modules.iter_mut() {
            if other_key == key {
                continue;
            }
            let io = slot.module.get_mut().io_mut();
            for expander in [&mut io.left_expander, &mut io.right_expander] {
                if expander.module == Some(key) || expander.module_id == Some(id) {
                    expander.unlink();
                }
            }
        }

        self.modules_cache.remove(&id);
        self.ordinary.retain(|&k| k != key);
        self.terminals.retain(|&k| k != key);
        let slot = self
            .modules
            .remove(key)
            .ok_or(EngineError::ModuleNotFound(id))?;
        let mut module = slot.module.into_inner();
        module.io_mut().left_expander.unlink();
        module.io_mut().right_expander.unlink();

        self.refresh_order();
        debug!(module_id = id, "module removed");
        Ok(module)
    }

    /// Cable ids touching a module, in insertion order
    pub(crate) fn cables_of(&self, id: i64) -> Vec<i64> {
        let Some(key) = self.module_key(id) else {
            return Vec::new();
        };
        self.cable_list
            .iter()
            .filter_map(|&ck| self.cables.get(ck))
            .filter(|c| c.output_module == key || c.input_module == key)
            .filter_map(|c| c.cable.id)
            .collect()
    }

    pub(crate) fn set_module_expander(
        &mut self,
        id: i64,
        side: ExpanderSide,
        neighbour: Option<i64>,
    ) -> Result<(), EngineError> {
        if neighbour == Some(id) {
            return Err(EngineError::SelfExpander(id));
        }
        let module = self.module_mut(id)?;
        let expander = module.io_mut().expander_mut(side);
        expander.module_id = neighbour;
        expander.module = None;
        Ok(())
    }

    // Cables

    pub(crate) fn add_cable(&mut self, mut cable: Cable) -> Result<i64, EngineError> {
        let Some(output_module) = self.module_key(cable.output_module_id) else {
            warn!(module_id = cable.output_module_id, "cable output module not found");
            return Err(EngineError::ModuleNotFound(cable.output_module_id));
        };
        let Some(input_module) = self.module_key(cable.input_module_id) else {
            warn!(module_id = cable.input_module_id, "cable input module not found");
            return Err(EngineError::ModuleNotFound(cable.input_module_id));
        };

        let outputs = self.modules[output_module].module.get_mut().io().outputs().len();
        if cable.output_id >= outputs {
            warn!(
                module_id = cable.output_module_id,
                output_id = cable.output_id,
                outputs,
                "cable output out of range"
            );
            return Err(EngineError::PortOutOfRange {
                module_id: cable.output_module_id,
                port_type: PortType::Output,
                port_id: cable.output_id,
            });
        }
        let inputs = self.modules[input_module].module.get_mut().io().inputs().len();
        if cable.input_id >= inputs {
            warn!(
                module_id = cable.input_module_id,
                input_id = cable.input_id,
                inputs,
                "cable input out of range"
            );
            return Err(EngineError::PortOutOfRange {
                module_id: cable.input_module_id,
                port_type: PortType::Input,
                port_id: cable.input_id,
            });
        }
        if self
            .cables
            .values()
            .any(|c| c.input_module == input_module && c.cable.input_id == cable.input_id)
        {
            warn!(
                module_id = cable.input_module_id,
                input_id = cable.input_id,
                "input already connected"
            );
            return Err(EngineError::InputOccupied {
                module_id: cable.input_module_id,
                input_id: cable.input_id,
            });
        }

        let output_was_connected = self.output_has_cables(output_module, cable.output_id);

        let id = match cable.id {
            Some(id) if (0..MAX_ID).contains(&id) && !self.cables_cache.contains_key(&id) => id,
            _ => self.fresh_id(|graph, id| graph.cables_cache.contains_key(&id)),
        };
        cable.id = Some(id);

        let (output_id, input_id) = (cable.output_id, cable.input_id);
        let key = self.cables.insert(CableSlot {
            cable,
            output_module,
            input_module,
        });
        self.cable_list.push(key);
        self.cables_cache.insert(id, key);
        self.modules[output_module]
            .module
            .get_mut()
            .io_mut()
            .output_mut(output_id)
            .cables
            .push(key);

        self.update_connected();
        self.dispatch_port_change(input_module, true, PortType::Input, input_id);
        if !output_was_connected {
            self.dispatch_port_change(output_module, true, PortType::Output, output_id);
        }

        self.refresh_order();
        debug!(cable_id = id, "cable added");
        Ok(id)
    }

    pub(crate) fn remove_cable(&mut self, id: i64) -> Result<Cable, EngineError> {
        let key = self
            .cables_cache
            .remove(&id)
            .ok_or(EngineError::CableNotFound(id))?;
        let slot = self
            .cables
            .remove(key)
            .ok_or(EngineError::CableNotFound(id))?;
        self.cable_list.retain(|&k| k != key);

        let (output_id, input_id) = (slot.cable.output_id, slot.cable.input_id);
        if let Some(output) = self.modules.get_mut(slot.output_module) {
            output
                .module
                .get_mut()
                .io_mut()
                .output_mut(output_id)
                .cables
                .retain(|&k| k != key);
        }

        self.update_connected();
        self.dispatch_port_change(slot.input_module, false, PortType::Input, input_id);
        if !self.output_has_cables(slot.output_module, output_id) {
            self.dispatch_port_change(slot.output_module, false, PortType::Output, output_id);
        }

        self.refresh_order();
        debug!(cable_id = id, "cable removed");
        Ok(slot.cable)
    }

    fn output_has_cables(&self, module: ModuleKey, output_id: usize) -> bool {
        self.cables
            .values()
            .any(|c| c.output_module == module && c.cable.output_id == output_id)
    }

    fn dispatch_port_change(
        &mut self,
        key: ModuleKey,
        connecting: bool,
        port_type: PortType,
        port_id: usize,
    ) {
        if let Some(slot) = self.modules.get_mut(key) {
            slot.module.get_mut().dispatch_port_change(&PortChangeEvent {
                connecting,
                port_type,
                port_id,
            });
        }
    }

    /// Connect every port a cable touches and fully disconnect every other port
    fn update_connected(&mut self) {
        let mut connected: HashSet<(ModuleKey, PortType, usize)> =
            HashSet::with_capacity(self.cables.len() * 2);
        for slot in self.cables.values() {
            connected.insert((slot.output_module, PortType::Output, slot.cable.output_id));
            connected.insert((slot.input_module, PortType::Input, slot.cable.input_id));
        }

        for (key, slot) in self.modules.iter_mut() {
            let io = slot.module.get_mut().io_mut();
            for (i, input) in io.inputs_mut().iter_mut().enumerate() {
                if connected.contains(&(key, PortType::Input, i)) {
                    input.set_connected();
                } else {
                    input.set_disconnected();
                }
            }
            for (i, output) in io.outputs_mut().iter_mut().enumerate() {
                if connected.contains(&(key, PortType::Output, i)) {
                    output.set_connected();
                } else {
                    output.set_disconnected();
                }
            }
        }
    }

    // Ordering

    /// Recompute the processing order, keeping the old one if the walk comes up short
    fn refresh_order(&mut self) {
        let order = self.compute_order();
        if order.len() == self.ordinary.len() {
            self.order = order;
        } else {
            warn!(
                ordered = order.len(),
                modules = self.ordinary.len(),
                "module ordering incomplete, keeping previous order"
            );
        }
    }

    /// Depth-first post-order over cables, reversed
    ///
    /// Roots are visited in registration order and each module is entered at
    /// most once, so a feedback cycle is cut wherever the walk first re-enters
    /// it. Terminal modules are never entered.
    fn compute_order(&self) -> Vec<ModuleKey> {
        let mut touched: HashSet<ModuleKey> = HashSet::with_capacity(self.ordinary.len());
        let mut post_order = Vec::with_capacity(self.ordinary.len());
        let mut stack: Vec<(ModuleKey, Vec<ModuleKey>, usize)> = Vec::new();

        for &root in &self.ordinary {
            if !touched.insert(root) {
                continue;
            }
            stack.push((root, self.downstream(root), 0));
            loop {
                let Some(frame) = stack.last_mut() else {
                    break;
                };
                if frame.2 < frame.1.len() {
                    let next = frame.1[frame.2];
                    frame.2 += 1;
                    if touched.insert(next) {
                        let children = self.downstream(next);
                        stack.push((next, children, 0));
                    }
                } else if let Some((key, _, _)) = stack.pop() {
                    post_order.push(key);
                }
            }
        }

        post_order.reverse();
        post_order
    }

    /// Ordinary modules fed by this module's outputs, in output then cable order
    fn downstream(&self, key: ModuleKey) -> Vec<ModuleKey> {
        let Some(slot) = self.modules.get(key) else {
            return Vec::new();
        };
        let module = slot.module.lock();
        module
            .io()
            .outputs()
            .iter()
            .flat_map(|output| output.cables.iter())
            .filter_map(|&ck| self.cables.get(ck))
            .map(|c| c.input_module)
            .filter(|&k| self.modules.get(k).is_some_and(|s| !s.terminal))
            .collect()
    }

    // Expanders

    /// Re-resolve expander neighbour keys from their ids
    pub(crate) fn update_expanders(&self) {
        for &key in &self.ordinary {
            let Some(slot) = self.modules.get(key) else {
                continue;
            };
            let mut module = slot.module.lock();
            for side in [ExpanderSide::Left, ExpanderSide::Right] {
                let expander = module.io_mut().expander_mut(side);
                let old = expander.module;
                let new = match expander.module_id {
                    None => None,
                    Some(id) => match old {
                        Some(k) if self.modules.get(k).is_some_and(|s| s.id == id) => Some(k),
                        _ => self.module_key(id).filter(|&k| k != key),
                    },
                };
                if new != old {
                    expander.module = new;
                    module.dispatch_expander_change(side);
                }
            }
        }
    }

    // Sample rate

    pub(crate) fn set_sample_rate(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.sample_time = 1.0 / sample_rate;
        let event = SampleRateChangeEvent {
            sample_rate,
            sample_time: self.sample_time,
        };
        for slot in self.modules.values_mut() {
            slot.module.get_mut().dispatch_sample_rate_change(&event);
        }
    }

    // Param handles

    pub(crate) fn add_param_handle(&mut self, handle: &Arc<ParamHandle>) -> Result<(), EngineError> {
        if handle.module_id().is_some() {
            return Err(EngineError::ParamHandleNotBlank);
        }
        if self.param_handles.iter().any(|h| Arc::ptr_eq(h, handle)) {
            return Err(EngineError::ParamHandleAlreadyAdded);
        }
        self.param_handles.push(Arc::clone(handle));
        Ok(())
    }

    pub(crate) fn remove_param_handle(&mut self, handle: &Arc<ParamHandle>) -> Result<(), EngineError> {
        let index = self
            .param_handles
            .iter()
            .position(|h| Arc::ptr_eq(h, handle))
            .ok_or(EngineError::ParamHandleNotFound)?;
        handle.set_module(None);
        self.param_handles.remove(index);
        self.refresh_param_handle_cache();
        Ok(())
    }

    pub(crate) fn param_handle(&self, module_id: i64, param_id: ParamId) -> Option<Arc<ParamHandle>> {
        self.param_handles_cache.get(&(module_id, param_id)).cloned()
    }

    /// Point a registered handle at `(module_id, param_id)`
    ///
    /// When another handle already maps that parameter, `overwrite` decides
    /// which of the two is blanked.
    pub(crate) fn update_param_handle(
        &mut self,
        handle: &Arc<ParamHandle>,
        module_id: Option<i64>,
        param_id: ParamId,
        overwrite: bool,
    ) -> Result<(), EngineError> {
        if !self.param_handles.iter().any(|h| Arc::ptr_eq(h, handle)) {
            return Err(EngineError::ParamHandleNotFound);
        }

        handle.set_target(HandleTarget {
            module_id,
            param_id,
            module: None,
        });

        if let Some(id) = module_id {
            if let Some(existing) = self.param_handle(id, param_id) {
                if !Arc::ptr_eq(&existing, handle) {
                    if overwrite {
                        existing.blank();
                    } else {
                        handle.blank();
                    }
                }
            }
            if let Some(id) = handle.module_id() {
                self.resolve_param_handle(handle, self.module_key(id));
            }
        }

        self.refresh_param_handle_cache();
        Ok(())
    }

    pub(crate) fn num_param_handles(&self) -> usize {
        self.param_handles.len()
    }

    pub(crate) fn param_handles(&self) -> &[Arc<ParamHandle>] {
        &self.param_handles
    }

    /// Set a handle's back-reference and record its param's scaled value
    fn resolve_param_handle(&self, handle: &ParamHandle, module: Option<ModuleKey>) {
        handle.set_module(module);
        let Some(slot) = module.and_then(|key| self.modules.get(key)) else {
            return;
        };
        let module = slot.module.lock();
        let param_id = handle.param_id();
        if let Some(quantity) = module.io().param_quantity(param_id) {
            handle.observe(quantity.to_scaled(module.io().param(param_id)));
        }
    }

    /// Register the handles a newly added module owns, at their preset targets
    ///
    /// A target another handle already maps stays with that handle.
    fn adopt_param_handles(&mut self, owner: i64, handles: &[Arc<ParamHandle>]) {
        for handle in handles {
            let target = handle.target();
            handle.blank();
            if let Err(e) = self.add_param_handle(handle) {
                warn!(module_id = owner, error = %e, "skipping param handle");
                continue;
            }
            if target.module_id.is_some() {
                if let Err(e) =
                    self.update_param_handle(handle, target.module_id, target.param_id, false)
                {
                    warn!(module_id = owner, error = %e, "dropping param mapping");
                }
            }
        }
    }

    pub(crate) fn refresh_param_handle_cache(&mut self) {
        self.param_handles_cache.clear();
        for handle in &self.param_handles {
            let target = handle.target();
            if let Some(module_id) = target.module_id {
                self.param_handles_cache
                    .insert((module_id, target.param_id), Arc::clone(handle));
            }
        }
    }

    // Teardown

    /// Remove every handle, cable and module, in that order
    pub(crate) fn clear(&mut self) {
        for handle in std::mem::take(&mut self.param_handles) {
            handle.set_module(None);
        }
        self.param_handles_cache.clear();

        let cable_ids: Vec<i64> = self.cables().filter_map(|c| c.id).collect();
        for id in cable_ids {
            if let Err(e) = self.remove_cable(id) {
                warn!(cable_id = id, error = %e, "failed to remove cable during clear");
            }
        }

        let module_ids: Vec<i64> = self.module_ids().collect();
        for id in module_ids {
            if let Err(e) = self.remove_module(id) {
                warn!(module_id = id, error = %e, "failed to remove module during clear");
            }
        }
        *self.smoothing.get_mut() = None;
    }

    fn fresh_id(&self, taken: impl Fn(&Self, i64) -> bool) -> i64 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(0..MAX_ID);
            if !taken(self, id) {
                return id;
            }
        }
    }
}
