//! Loading and sharing of plugin binaries.
//!
//! A [`ModuleHandle`] is shared by every instance created from the same file.
//! The loader only keeps weak references, so the library is unloaded as soon
//! as the last instance (or caller) drops its handle.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};

use libloading::Library;
use parking_lot::Mutex;

use crate::abi::{self, PluginMainProc};
use crate::effect::{Effect, NativeEffect};
use crate::error::{LoadError, LoadStage};
use crate::host::{audio_master, HostCallback};

/// Opens binaries. Swapped out in tests for an in-process backend.
pub trait LibraryBackend: Send + Sync {
    fn open(&self, binary: &Path) -> Result<Box<dyn ModuleCode>, LoadError>;
}

/// Code of one opened binary.
pub trait ModuleCode: Send + Sync {
    /// Calls the module's entry point. The caller has already set up the
    /// creation session and the reentrancy guard.
    fn create_effect(&self, host: HostCallback) -> Result<Box<dyn Effect>, LoadError>;
}

/// Entry points tried in order.
#[cfg(target_os = "macos")]
const ENTRY_POINTS: &[&[u8]] = &[b"VSTPluginMain\0", b"main_macho\0", b"main\0"];
#[cfg(not(target_os = "macos"))]
const ENTRY_POINTS: &[&[u8]] = &[b"VSTPluginMain\0", b"main\0"];

/// Dynamic-library backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

struct NativeModule {
    path: PathBuf,
    main: PluginMainProc,
    // Dropped last: `main` points into it.
    _library: Library,
}

impl LibraryBackend for NativeBackend {
    fn open(&self, binary: &Path) -> Result<Box<dyn ModuleCode>, LoadError> {
        let library = unsafe { Library::new(binary) }.map_err(|e| LoadError::Failed {
            path: binary.to_path_buf(),
            stage: LoadStage::Opening,
            reason: e.to_string(),
        })?;

        let main = ENTRY_POINTS
            .iter()
            .find_map(|name| unsafe { library.get::<PluginMainProc>(name) }.ok().map(|s| *s))
            .ok_or_else(|| LoadError::EntryPointNotFound {
                path: binary.to_path_buf(),
            })?;

        Ok(Box::new(NativeModule {
            path: binary.to_path_buf(),
            main,
            _library: library,
        }))
    }
}

impl ModuleCode for NativeModule {
    fn create_effect(&self, _host: HostCallback) -> Result<Box<dyn Effect>, LoadError> {
        let raw = unsafe { (self.main)(audio_master) };
        let effect = unsafe { NativeEffect::from_raw(raw) }.ok_or_else(|| {
            LoadError::Instantiation {
                path: self.path.clone(),
            }
        })?;
        if effect.magic() != abi::EFFECT_MAGIC {
            return Err(LoadError::BadMagic {
                path: self.path.clone(),
                magic: effect.magic(),
            });
        }
        Ok(Box::new(effect))
    }
}

/// A loaded binary shared by all its instances.
pub struct ModuleHandle {
    path: PathBuf,
    binary: PathBuf,
    name: String,
    directory: CString,
    code: Box<dyn ModuleCode>,
}

impl ModuleHandle {
    /// Canonical path the module was loaded from (a bundle directory for
    /// bundled formats).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file actually opened.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// File stem, used until the plugin reports its own name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent directory, as answered to `GetDirectory`.
    pub fn directory(&self) -> &CString {
        &self.directory
    }

    pub(crate) fn code(&self) -> &dyn ModuleCode {
        self.code.as_ref()
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("path", &self.path)
            .field("binary", &self.binary)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        tracing::debug!(path = %self.path.display(), "unloading module");
    }
}

/// Resolves a `.vst` bundle directory to the binary inside it.
pub fn resolve_binary(path: &Path) -> Result<PathBuf, LoadError> {
    if path.is_dir() {
        if path.extension().and_then(|e| e.to_str()) == Some("vst") {
            let stem = path.file_stem().unwrap_or_default();
            let inner = path.join("Contents").join("MacOS").join(stem);
            if inner.is_file() {
                return Ok(inner);
            }
        }
        return Err(LoadError::MissingBinary(path.to_path_buf()));
    }
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(LoadError::MissingBinary(path.to_path_buf()))
    }
}

/// Reference-counted cache of loaded modules.
pub struct ModuleLoader {
    backend: Arc<dyn LibraryBackend>,
    resident: Mutex<HashMap<PathBuf, Weak<ModuleHandle>>>,
}

static GLOBAL: LazyLock<ModuleLoader> = LazyLock::new(ModuleLoader::new);

impl ModuleLoader {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(NativeBackend))
    }

    pub fn with_backend(backend: Arc<dyn LibraryBackend>) -> Self {
        Self {
            backend,
            resident: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide loader using the native backend.
    pub fn global() -> &'static ModuleLoader {
        &GLOBAL
    }

    /// Returns the resident module for `path`, loading it if needed.
    ///
    /// Must not be called from the audio thread.
    pub fn find_or_create_module(&self, path: &Path) -> Result<Arc<ModuleHandle>, LoadError> {
        let canonical = std::fs::canonicalize(path)
            .map_err(|_| LoadError::MissingBinary(path.to_path_buf()))?;

        let mut resident = self.resident.lock();
        if let Some(handle) = resident.get(&canonical).and_then(Weak::upgrade) {
            tracing::debug!(path = %canonical.display(), "reusing resident module");
            return Ok(handle);
        }

        let binary = resolve_binary(&canonical)?;
        let code = self.backend.open(&binary).inspect_err(|e| {
            tracing::warn!(path = %canonical.display(), "module load failed: {e}");
        })?;

        let name = canonical
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = canonical
            .parent()
            .and_then(|p| CString::new(p.to_string_lossy().as_bytes()).ok())
            .unwrap_or_default();

        let handle = Arc::new(ModuleHandle {
            path: canonical.clone(),
            binary,
            name,
            directory,
            code,
        });
        resident.retain(|_, weak| weak.strong_count() > 0);
        resident.insert(canonical.clone(), Arc::downgrade(&handle));
        tracing::info!(path = %canonical.display(), "loaded module");
        Ok(handle)
    }

    pub fn is_resident(&self, path: &Path) -> bool {
        let Ok(canonical) = std::fs::canonicalize(path) else {
            return false;
        };
        self.resident
            .lock()
            .get(&canonical)
            .is_some_and(|w| w.strong_count() > 0)
    }

    pub fn resident_count(&self) -> usize {
        self.resident
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}
