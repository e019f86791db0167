//! Plugin descriptions produced by discovery and stored in the catalog.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::abi::category;

/// Category reported by `GetPlugCategory`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginCategory {
    #[default]
    Unknown,
    Effect,
    Synth,
    Analysis,
    Mastering,
    Spatial,
    RoomFx,
    SurroundFx,
    Restoration,
    Offline,
    Shell,
    Generator,
}

impl PluginCategory {
    pub fn from_raw(raw: isize) -> Self {
        match raw {
            category::EFFECT => Self::Effect,
            category::SYNTH => Self::Synth,
            category::ANALYSIS => Self::Analysis,
            category::MASTERING => Self::Mastering,
            category::SPACIALIZER => Self::Spatial,
            category::ROOM_FX => Self::RoomFx,
            category::SURROUND_FX => Self::SurroundFx,
            category::RESTORATION => Self::Restoration,
            category::OFFLINE_PROCESS => Self::Offline,
            category::SHELL => Self::Shell,
            category::GENERATOR => Self::Generator,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for PluginCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "",
            Self::Effect => "Effect",
            Self::Synth => "Synth",
            Self::Analysis => "Analysis",
            Self::Mastering => "Mastering",
            Self::Spatial => "Spatial",
            Self::RoomFx => "Reverb",
            Self::SurroundFx => "Surround",
            Self::Restoration => "Restoration",
            Self::Offline => "Offline",
            Self::Shell => "Shell",
            Self::Generator => "Generator",
        };
        f.write_str(name)
    }
}

/// Everything the host knows about one plugin without keeping it loaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,

    /// File (or bundle directory) the plugin lives in.
    pub path: PathBuf,

    /// Stable identifier; shell sub-plugins share a path and differ here.
    pub unique_id: i32,

    pub format: String,
    pub category: PluginCategory,
    pub manufacturer: String,
    pub version: String,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub is_instrument: bool,
    pub accepts_midi: bool,
    pub produces_midi: bool,
    pub has_editor: bool,
    pub latency_samples: usize,

    #[serde(default)]
    pub last_modified: Option<SystemTime>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, unique_id: i32) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            unique_id,
            format: "VST".to_string(),
            category: PluginCategory::Unknown,
            manufacturer: String::new(),
            version: String::new(),
            num_inputs: 0,
            num_outputs: 0,
            is_instrument: false,
            accepts_midi: false,
            produces_midi: false,
            has_editor: false,
            latency_samples: 0,
            last_modified: None,
        }
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn category(mut self, category: PluginCategory) -> Self {
        self.category = category;
        self
    }

    pub fn audio_io(mut self, inputs: usize, outputs: usize) -> Self {
        self.num_inputs = inputs;
        self.num_outputs = outputs;
        self
    }

    pub fn instrument(mut self, is_instrument: bool) -> Self {
        self.is_instrument = is_instrument;
        self
    }

    pub fn midi(mut self, accepts: bool, produces: bool) -> Self {
        self.accepts_midi = accepts;
        self.produces_midi = produces;
        self
    }

    pub fn editor(mut self, has_editor: bool) -> Self {
        self.has_editor = has_editor;
        self
    }

    pub fn latency(mut self, samples: usize) -> Self {
        self.latency_samples = samples;
        self
    }

    /// Two descriptors name the same plugin when file and id match.
    pub fn is_duplicate_of(&self, other: &PluginDescriptor) -> bool {
        self.path == other.path && self.unique_id == other.unique_id
    }

    /// Identifier usable in session files.
    pub fn identifier(&self) -> String {
        format!(
            "{}-{}-{:08x}",
            self.format,
            self.name,
            self.unique_id as u32
        )
    }
}

/// Identifier used when a plugin reports none: a 32-bit FNV-1a hash of the
/// path, never zero.
pub fn path_hash_id(path: &Path) -> i32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in path.to_string_lossy().bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let id = (hash & 0x7fff_ffff) as i32;
    if id == 0 {
        1
    } else {
        id
    }
}

/// `"V1.2.3"` from a version number packed one component per byte.
pub fn format_version(packed: i32) -> String {
    let mut v = packed as u32;
    if v == 0 || v == u32::MAX {
        return String::new();
    }
    let mut parts = Vec::with_capacity(4);
    while v != 0 {
        parts.push((v & 0xff).to_string());
        v >>= 8;
    }
    parts.reverse();
    format!("V{}", parts.join("."))
}
