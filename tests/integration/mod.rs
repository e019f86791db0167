//! Integration test modules for vstbridge
//!
//! - modules: reference-counted module loading
//! - processing: audio and MIDI through live instances
//! - state: bank and program files
//! - discovery: shell enumeration and catalog scans
//! - editor: plugin windows next to a running instance

pub mod discovery;
pub mod editor;
pub mod modules;
pub mod processing;
pub mod state;
