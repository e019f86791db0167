//! Error types for plugin hosting

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Opening,
    Instantiation,
    Initialization,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStage::Opening => write!(f, "opening library"),
            LoadStage::Instantiation => write!(f, "creating instance"),
            LoadStage::Initialization => write!(f, "initializing effect"),
        }
    }
}

/// Failure to bring a module or an effect into existence.
///
/// A plugin that fails with one of these simply does not appear in the
/// catalog.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Plugin binary not found: {0}")]
    MissingBinary(PathBuf),

    #[error("Plugin load failed at {stage} stage: {path}\n  Reason: {reason}")]
    Failed {
        path: PathBuf,
        stage: LoadStage,
        reason: String,
    },

    #[error("No VST entry point exported by {path}")]
    EntryPointNotFound { path: PathBuf },

    #[error("Effect from {path} has bad magic {magic:#010x}")]
    BadMagic { path: PathBuf, magic: i32 },

    #[error("Entry point of {path} returned no effect")]
    Instantiation { path: PathBuf },

    #[error("Plugin panicked during {stage}: {path}")]
    Panicked { path: PathBuf, stage: LoadStage },
}

/// A state record that could not be decoded. Nothing is applied when this is
/// returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateFormatError {
    #[error("State data is empty")]
    Empty,

    #[error("State data too short: {len} bytes, need at least {needed}")]
    TooShort { len: usize, needed: usize },

    #[error("Unknown chunk magic {0:#010x}")]
    UnknownMagic(u32),

    #[error("Unknown record type {0:#010x}")]
    UnknownRecord(u32),

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(i32),

    #[error("Declared size {declared} exceeds buffer of {available} bytes")]
    DeclaredSizeExceedsBuffer { declared: usize, available: usize },

    #[error("Record truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Chunk of {size} bytes exceeds limit of {limit}")]
    ChunkTooLarge { size: usize, limit: usize },

    #[error("Invalid count {0}")]
    InvalidCount(i32),

    #[error("Opaque chunk given to a plugin without chunk support")]
    NotChunkBased,

    #[error("Plugin rejected opaque chunk of {size} bytes")]
    ChunkRejected { size: usize },
}

/// A call into plugin code that panicked. Logged at the call boundary and
/// answered with a neutral value; never propagated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchFailure {
    #[error("Plugin failed in dispatch of opcode {0}")]
    Dispatch(i32),

    #[error("Plugin failed reading parameter {0}")]
    GetParameter(i32),

    #[error("Plugin failed writing parameter {0}")]
    SetParameter(i32),

    #[error("Plugin failed while processing")]
    Process,
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Failed to restore plugin state: {0}")]
    State(#[from] StateFormatError),

    #[error("Plugin editor error: {0}")]
    Editor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog serialization error: {0}")]
    Catalog(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;
