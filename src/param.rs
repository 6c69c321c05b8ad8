//! Parameters, parameter metadata and external parameter handles

use crate::atomic::AtomicF32;
use crate::graph::ModuleKey;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Unique identifier for a parameter within a module
pub type ParamId = usize;

/// The raw value of a knob, switch or slider
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Param {
    value: f32,
}

impl Param {
    pub fn new(value: f32) -> Self {
        Self { value }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn set_value(&mut self, value: f32) {
        self.value = value;
    }
}

/// Range, default and behaviour flags of a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamQuantity {
    pub name: String,
    pub unit: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
    /// Restored to `default` by a module reset
    pub reset_enabled: bool,
    /// Drawn uniformly from the range by a module randomize
    pub randomize_enabled: bool,
    /// UI edits should go through the engine's smoothing slot
    pub smooth_enabled: bool,
    /// Values are rounded to integers
    pub snap_enabled: bool,
}

impl ParamQuantity {
    pub fn new(name: impl Into<String>, min: f32, max: f32, default: f32) -> Self {
        Self {
            name: name.into(),
            unit: String::new(),
            min,
            max,
            default,
            reset_enabled: true,
            randomize_enabled: true,
            smooth_enabled: false,
            snap_enabled: false,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn smooth(mut self) -> Self {
        self.smooth_enabled = true;
        self
    }

    pub fn snap(mut self) -> Self {
        self.snap_enabled = true;
        self
    }

    pub fn without_randomize(mut self) -> Self {
        self.randomize_enabled = false;
        self
    }

    /// Clamp (and snap) a value into this quantity's range
    pub fn constrain(&self, value: f32) -> f32 {
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };
        let value = value.clamp(lo, hi);
        if self.snap_enabled {
            libm::roundf(value)
        } else {
            value
        }
    }

    /// Position of `value` within the range, 0 at `min` and 1 at `max`
    pub fn to_scaled(&self, value: f32) -> f32 {
        if self.max == self.min {
            0.0
        } else {
            (value - self.min) / (self.max - self.min)
        }
    }

    /// Inverse of [`ParamQuantity::to_scaled`], constrained to the range
    pub fn from_scaled(&self, scaled: f32) -> f32 {
        self.constrain(self.min + scaled * (self.max - self.min))
    }

    pub fn reset(&self, param: &mut Param) {
        if self.reset_enabled {
            param.set_value(self.default);
        }
    }

    pub fn randomize<R: Rng + ?Sized>(&self, param: &mut Param, rng: &mut R) {
        if !self.randomize_enabled {
            return;
        }
        let t: f32 = rng.gen();
        param.set_value(self.constrain(self.min + t * (self.max - self.min)));
    }
}

impl Default for ParamQuantity {
    fn default() -> Self {
        Self::new("", 0.0, 1.0, 0.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct HandleTarget {
    pub(crate) module_id: Option<i64>,
    pub(crate) param_id: ParamId,
    pub(crate) module: Option<ModuleKey>,
}

/// A non-owning reference to one parameter of one module
///
/// Handles are created and owned by whoever maps parameters (a MIDI map
/// module, an automation lane) and registered with the engine, which keeps
/// the `(module_id, param_id)` lookup cache and clears the module
/// back-reference when the module goes away. The engine never drops a
/// handle it did not create.
///
/// The owner drives the mapped parameter with
/// [`ParamHandle::set_scaled_value`]; the engine writes the value into the
/// param once the current or next frame's host inputs have been read.
#[derive(Debug, Default)]
pub struct ParamHandle {
    target: Mutex<HandleTarget>,
    /// Scaled value of the mapped param, as last seen or written
    value: AtomicF32,
    pending: AtomicBool,
}

impl ParamHandle {
    /// A blank handle, ready for [`crate::Engine::add_param_handle`]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn module_id(&self) -> Option<i64> {
        self.target.lock().module_id
    }

    pub fn param_id(&self) -> ParamId {
        self.target.lock().param_id
    }

    /// Whether the mapped module is currently present in the engine
    pub fn is_resolved(&self) -> bool {
        self.target.lock().module.is_some()
    }

    /// Queue a new value for the mapped param, 0..1 across its range
    pub fn set_scaled_value(&self, value: f32) {
        self.value.set(value);
        self.pending.store(true, Ordering::Release);
    }

    /// The mapped param's scaled value when the handle was resolved, or the
    /// last value written through it
    pub fn scaled_value(&self) -> f32 {
        self.value.get()
    }

    pub(crate) fn take_pending(&self) -> Option<f32> {
        self.pending
            .swap(false, Ordering::AcqRel)
            .then(|| self.value.get())
    }

    pub(crate) fn observe(&self, value: f32) {
        self.value.set(value);
    }

    pub(crate) fn target(&self) -> HandleTarget {
        *self.target.lock()
    }

    pub(crate) fn set_target(&self, target: HandleTarget) {
        *self.target.lock() = target;
    }

    pub(crate) fn set_module(&self, module: Option<ModuleKey>) {
        self.target.lock().module = module;
    }

    pub(crate) fn blank(&self) {
        self.set_target(HandleTarget::default());
        self.pending.store(false, Ordering::Release);
    }

    /// Point an unregistered handle at a parameter; the engine resolves it
    /// when the handle is registered
    pub(crate) fn preset(&self, module_id: Option<i64>, param_id: ParamId) {
        self.set_target(HandleTarget {
            module_id,
            param_id,
            module: None,
        });
    }
}
