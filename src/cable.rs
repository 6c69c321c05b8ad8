//! Cables between an output and an input

use crate::port::{Input, Output};
use serde::{Deserialize, Serialize};

/// A directed connection from one output to one input
///
/// The endpoints are module ids, not arena keys, so a cable can be built
/// before either module exists and persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cable {
    /// Assigned by the engine when unset or colliding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub output_module_id: i64,
    pub output_id: usize,
    pub input_module_id: i64,
    pub input_id: usize,
    /// Cosmetic, carried through save and load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Cable {
    pub fn new(output_module_id: i64, output_id: usize, input_module_id: i64, input_id: usize) -> Self {
        Self {
            id: None,
            output_module_id,
            output_id,
            input_module_id,
            input_id,
            color: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// Copy one output's voltages onto one input
///
/// The input takes the output's channel count, non-finite voltages arrive as
/// 0V and channels the input no longer carries are zeroed.
#[inline]
pub fn propagate(output: &Output, input: &mut Input) {
    input.copy_from(output);
}
