//! In-process hosting of VST 2.x plugins
//!
//! This crate loads native plugin modules, answers the callbacks plugins make
//! into their host, runs audio and MIDI through them, reads and writes
//! `.fxp`/`.fxb` state, discovers plugins on disk, and embeds plugin editors
//! in host windows.
//!
//! ## Layers
//!
//! - [`module`]: one loaded binary per canonical path, shared by every
//!   instance created from it
//! - [`host`]: the callback protocol, with per-instance answers routed
//!   through a registry
//! - [`instance`]: lifecycle, processing, parameters and programs
//! - [`state`]: the fxp/fxb codec
//! - [`discovery`] and [`catalog`]: finding and remembering plugins
//! - [`editor`]: plugin-drawn windows
//!
//! ## Usage
//!
//! ```ignore
//! use vstbridge_host::{MidiEventVec, ModuleLoader, PluginInstance};
//!
//! let loader = ModuleLoader::global();
//! let plugin = PluginInstance::load(loader, "/usr/lib/vst/delay.so".as_ref(), 0)?;
//! plugin.prepare(48000.0, 512);
//!
//! let mut left = vec![0.0f32; 512];
//! let mut right = vec![0.0f32; 512];
//! let mut midi = MidiEventVec::new();
//! plugin.process_block(&mut [&mut left[..], &mut right[..]], &mut midi);
//!
//! let bank = plugin.save_state();
//! ```
//!
//! Plugin code that panics is caught at every call boundary; the call answers
//! a neutral value and the host keeps running. Foreign exceptions and memory
//! faults inside a plugin are not recoverable in-process.

pub mod abi;

pub mod error;
pub use error::{DispatchFailure, HostError, LoadError, LoadStage, Result, StateFormatError};

pub mod config;
pub use config::{host_config, set_host_config, HostConfig};

pub mod effect;
pub use effect::{Effect, EffectKey, EffectLayout, Invocation, NativeEffect};

pub mod host;
pub use host::HostCallback;

pub mod midi;
pub use midi::{MidiEvent, MidiEventVec};

pub mod transport;
pub use transport::{FixedPlayHead, PlayHead, TransportInfo};

pub mod module;
pub use module::{LibraryBackend, ModuleCode, ModuleHandle, ModuleLoader, NativeBackend};

pub mod instance;
pub use instance::{InstanceEvent, LifecycleState, ParameterInfo, PluginInstance};

pub mod state;
pub use state::{PresetTarget, ProgramRecord, StateChunk};

pub mod descriptor;
pub use descriptor::{PluginCategory, PluginDescriptor};

pub mod discovery;
pub use discovery::{classify, default_search_paths, enumerate, search_directories};

pub mod catalog;
pub use catalog::PluginCatalog;

pub mod editor;
pub use editor::{idle_ticker, PluginEditor};

#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;
