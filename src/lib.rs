//! # Patchbay: Real-Time Modular Patch Engine
//!
//! `patchbay` runs a patch of interconnected modules inside a host audio
//! callback. Modules exchange polyphonic voltages over cables, one frame at a
//! time, in an order derived from the cable graph. A non-real-time thread
//! (an editor, a patch loader) may add and remove modules and cables while
//! the audio thread is stepping blocks.
//!
//! ## Architecture
//!
//! - **Modules** - [`Module`] pairs engine-owned state ([`ModuleIo`]: params,
//!   ports, lights, expander links) with a [`GraphModule`] processor
//! - **Graph** - modules, cables, ids and the processing order, behind one
//!   reader/writer lock
//! - **Engine** - [`Engine::step_block`] runs a block of frames; everything
//!   else mutates or inspects the graph
//! - **Host boundary** - [`HostContext`] carries host audio, MIDI, transport
//!   and automation into the patch through [`TerminalModule`]s
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use patchbay::prelude::*;
//!
//! let host = HostContext::new(&HostConfig::default());
//! let engine = Engine::new(48000.0);
//!
//! let audio = engine.add_module(Module::new(HostAudio::stereo(host.clone()))).unwrap();
//! let gain = engine.add_module(Module::new(Gain::new())).unwrap();
//! engine.add_cable(Cable::new(audio, 0, gain, 0)).unwrap();
//! engine.add_cable(Cable::new(gain, 0, audio, 0)).unwrap();
//! engine.set_param_smooth_value(gain, Gain::GAIN, 0.5).unwrap();
//!
//! // one host callback
//! let input = [0.0f32; 256];
//! let mut left = [0.0f32; 256];
//! let mut right = [0.0f32; 256];
//! host.run(&engine, &[&input, &input], &mut [&mut left, &mut right], &[]);
//! ```

pub mod atomic;
pub mod cable;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod graph;
pub mod host;
pub mod light;
pub mod meter;
pub mod module;
pub mod modules;
pub mod param;
pub mod port;
pub mod serialize;
pub mod terminal;

/// Prelude module for convenient imports
pub mod prelude {
    // Engine and graph
    pub use crate::cable::Cable;
    pub use crate::engine::{Engine, DEFAULT_SAMPLE_RATE};
    pub use crate::error::{ConfigError, EngineError};

    // Modules
    pub use crate::module::{
        Expander, ExpanderChangeEvent, ExpanderSide, GraphModule, Module, ModuleConfig, ModuleIo,
        PortChangeEvent, ProcessArgs, SampleRateChangeEvent, TerminalModule,
    };
    pub use crate::param::{Param, ParamHandle, ParamId, ParamQuantity};
    pub use crate::port::{Input, Output, Port, PortInfo, PortType, PORT_MAX_CHANNELS};
    pub use crate::light::Light;

    // Built-in modules
    pub use crate::modules::{Gain, Mixer, Offset};

    // Host boundary
    pub use crate::config::HostConfig;
    pub use crate::host::{Bbt, HostContext, HostTransport, MidiEvent, TimePosition};
    pub use crate::terminal::{HostAudio, HostMidi, HostParameters, HostParametersMap, HostTime};

    // Serialization
    pub use crate::serialize::{LoadReport, ModuleDef, ModuleMetadata, ModuleRegistry, PatchDef};

    pub use crate::atomic::{AtomicF32, AtomicF64};
}

// Re-export key types at crate root for convenience
pub use prelude::*;
