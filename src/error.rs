//! Error types

use crate::port::PortType;
use std::path::PathBuf;
use thiserror::Error;

/// Rejected graph operations
///
/// Every variant is returned before any state is touched, so a failed call
/// leaves the engine exactly as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("module {0} not found")]
    ModuleNotFound(i64),

    #[error("cable {0} not found")]
    CableNotFound(i64),

    #[error("module {module_id} still has {count} cable(s) attached")]
    ModuleHasCables { module_id: i64, count: usize },

    #[error("{port_type:?} {port_id} does not exist on module {module_id}")]
    PortOutOfRange {
        module_id: i64,
        port_type: PortType,
        port_id: usize,
    },

    #[error("input {input_id} of module {module_id} is already connected")]
    InputOccupied { module_id: i64, input_id: usize },

    #[error("param {param_id} does not exist on module {module_id}")]
    ParamOutOfRange { module_id: i64, param_id: usize },

    #[error("param handle must be blank when registered")]
    ParamHandleNotBlank,

    #[error("param handle is already registered")]
    ParamHandleAlreadyAdded,

    #[error("param handle is not registered")]
    ParamHandleNotFound,

    #[error("module {0} cannot be its own expander")]
    SelfExpander(i64),

    #[error("invalid patch: {0}")]
    InvalidPatch(String),
}

/// Failures while loading a [`crate::HostConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
