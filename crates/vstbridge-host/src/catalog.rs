//! Persisted list of known plugins.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::descriptor::PluginDescriptor;
use crate::discovery;
use crate::error::Result;
use crate::module::ModuleLoader;

/// Descriptors found so far, plus the files that yielded nothing.
///
/// Files whose modification time has not changed since the last scan are not
/// loaded again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginCatalog {
    plugins: Vec<PluginDescriptor>,
    failed: BTreeSet<PathBuf>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Files that were scanned and contained no usable plugin.
    pub fn failed_files(&self) -> impl Iterator<Item = &Path> {
        self.failed.iter().map(PathBuf::as_path)
    }

    /// Adds `desc`, replacing an entry for the same file and id. Returns
    /// true when nothing was replaced.
    pub fn add(&mut self, desc: PluginDescriptor) -> bool {
        self.failed.remove(&desc.path);
        match self.plugins.iter_mut().find(|d| d.is_duplicate_of(&desc)) {
            Some(existing) => {
                *existing = desc;
                false
            }
            None => {
                self.plugins.push(desc);
                true
            }
        }
    }

    pub fn remove_file(&mut self, path: &Path) {
        let path = canonical(path);
        self.plugins.retain(|d| d.path != path);
        self.failed.remove(&path);
    }

    pub fn find(&self, path: &Path, unique_id: i32) -> Option<&PluginDescriptor> {
        self.plugins
            .iter()
            .find(|d| d.path == path && d.unique_id == unique_id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// True when every entry for `path` was recorded at its current
    /// modification time.
    pub fn is_up_to_date(&self, path: &Path) -> bool {
        let Some(modified) = modified_time(path) else {
            return false;
        };
        let path = canonical(path);
        let mut entries = self.plugins.iter().filter(|d| d.path == path).peekable();
        entries.peek().is_some() && entries.all(|d| d.last_modified == Some(modified))
    }

    /// Enumerates `path` unless it is already up to date. Returns the number
    /// of descriptors added or refreshed.
    pub fn scan_file(&mut self, loader: &ModuleLoader, path: &Path) -> usize {
        if self.is_up_to_date(path) {
            tracing::debug!(path = %path.display(), "unchanged since last scan");
            return 0;
        }

        let found = discovery::enumerate(loader, path);
        let path = canonical(path);
        self.plugins.retain(|d| d.path != path);
        if found.is_empty() {
            self.failed.insert(path);
            return 0;
        }

        let count = found.len();
        for desc in found {
            self.add(desc);
        }
        count
    }

    /// Scans every candidate under `dirs`. Entries for files that no longer
    /// exist are dropped.
    pub fn scan_directories(&mut self, loader: &ModuleLoader, dirs: &[PathBuf], recursive: bool) -> usize {
        self.plugins.retain(|d| d.path.exists());
        self.failed.retain(|p| p.exists());

        let files = discovery::search_directories(dirs, recursive);
        tracing::info!(candidates = files.len(), "scanning plugin directories");

        let mut count = 0;
        for file in &files {
            count += self.scan_file(loader, file);
        }
        count
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?)?;
        tracing::debug!(path = %path.display(), plugins = self.plugins.len(), "catalog saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let catalog = Self::from_bytes(&fs::read(path)?)?;
        tracing::debug!(path = %path.display(), plugins = catalog.plugins.len(), "catalog loaded");
        Ok(catalog)
    }
}

/// Descriptors carry canonical paths.
fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
