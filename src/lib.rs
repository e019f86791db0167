//! # vstbridge - VST 2.x plugin hosting
//!
//! Loads native VST 2.x plugins into the host process and drives them.
//!
//! ## Architecture
//!
//! vstbridge is an umbrella crate over:
//! - **vstbridge-host** - module loading, host callbacks, audio and MIDI
//!   processing, fxp/fxb state, discovery, editor embedding
//!
//! ## Quick Start
//!
//! ```ignore
//! use vstbridge::prelude::*;
//!
//! let mut catalog = PluginCatalog::new();
//! catalog.scan_directories(ModuleLoader::global(), &default_search_paths(), true);
//!
//! let desc = &catalog.plugins()[0];
//! let plugin = PluginInstance::load(ModuleLoader::global(), &desc.path, desc.unique_id)?;
//! plugin.prepare(44100.0, 256);
//! plugin.restore_state(&std::fs::read("preset.fxb")?)?;
//! ```
//!
//! Pass the unique id as shell id only for shell sub-plugins; `0` selects the
//! module's default plugin.

/// Re-export of vstbridge-host for direct access
pub use vstbridge_host as host;

pub use vstbridge_host::{
    // Loading
    ModuleHandle,
    ModuleLoader,
    // Instances
    InstanceEvent,
    LifecycleState,
    ParameterInfo,
    PluginInstance,
    // Processing
    MidiEvent,
    MidiEventVec,
    PlayHead,
    TransportInfo,
    // State
    StateChunk,
    // Discovery
    PluginCatalog,
    PluginCategory,
    PluginDescriptor,
    // Editor
    PluginEditor,
    // Configuration
    HostConfig,
};

mod error;
pub use error::{Error, Result};

/// Everything needed to find, load, and run plugins.
pub mod prelude {
    pub use crate::{Error, Result};
    pub use vstbridge_host::discovery::{default_search_paths, enumerate, search_directories};
    pub use vstbridge_host::{
        host_config, set_host_config, FixedPlayHead, HostConfig, InstanceEvent, LifecycleState,
        MidiEvent, MidiEventVec, ModuleLoader, PlayHead, PluginCatalog, PluginCategory,
        PluginDescriptor, PluginEditor, PluginInstance, StateChunk, TransportInfo,
    };
}
