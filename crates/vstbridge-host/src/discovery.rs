//! Finding plugin files and describing the plugins inside them.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::abi::{EffectOpcode, TEXT_BUFFER_LEN};
use crate::descriptor::{PluginCategory, PluginDescriptor};
use crate::effect::Invocation;
use crate::instance::PluginInstance;
use crate::module::{ModuleHandle, ModuleLoader};

/// Upper bound on sub-plugins read from one shell module.
pub const MAX_SHELL_PLUGINS: usize = 1024;

/// Cheap check, by file type and extension only, that `path` may hold a
/// plugin. Nothing is loaded.
pub fn classify(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let Some(ext) = ext else {
        return false;
    };

    if cfg!(target_os = "macos") {
        ext == "vst" && path.is_dir()
    } else if cfg!(windows) {
        ext == "dll" && path.is_file()
    } else {
        ext == "so" && path.is_file()
    }
}

/// Candidate plugin files under `dirs`, sorted and de-duplicated.
///
/// Directories that classify as plugins are returned as-is and never
/// descended into.
pub fn search_directories(dirs: &[PathBuf], recursive: bool) -> Vec<PathBuf> {
    search_with(dirs, recursive, classify)
}

pub(crate) fn search_with(
    dirs: &[PathBuf],
    recursive: bool,
    is_plugin: impl Fn(&Path) -> bool,
) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for dir in dirs {
        walk(dir, recursive, &is_plugin, &mut found);
    }
    found.sort();
    found.dedup();
    found
}

fn walk(dir: &Path, recursive: bool, is_plugin: &dyn Fn(&Path) -> bool, found: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), "skipping unreadable directory: {e}");
            return;
        }
    };

    let mut paths: Vec<(PathBuf, bool)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let symlink = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
            (entry.path(), symlink)
        })
        .collect();
    paths.sort();

    for (path, symlink) in paths {
        if is_plugin(&path) {
            found.push(path);
        } else if recursive && !symlink && path.is_dir() {
            walk(&path, recursive, is_plugin, found);
        }
    }
}

/// Platform plugin directories. Entries of `VST_PATH` come first.
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = std::env::var_os("VST_PATH")
        .map(|value| std::env::split_paths(&value).collect())
        .unwrap_or_default();

    #[cfg(target_os = "macos")]
    {
        let home = std::env::var("HOME").unwrap_or_default();
        paths.push(PathBuf::from("/Library/Audio/Plug-Ins/VST"));
        paths.push(PathBuf::from(format!("{home}/Library/Audio/Plug-Ins/VST")));
    }

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from("C:\\Program Files\\VstPlugins"));
        paths.push(PathBuf::from("C:\\Program Files\\Common Files\\VST2"));
        paths.push(PathBuf::from("C:\\Program Files (x86)\\VstPlugins"));
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let home = std::env::var("HOME").unwrap_or_default();
        paths.push(PathBuf::from("/usr/lib/vst"));
        paths.push(PathBuf::from("/usr/local/lib/vst"));
        paths.push(PathBuf::from(format!("{home}/.vst")));
    }

    paths
}

/// Loads the module at `path` and describes every plugin it contains.
///
/// Returns an empty list when the file is not a usable module. Shell modules
/// yield one descriptor per distinct sub-plugin.
pub fn enumerate(loader: &ModuleLoader, path: &Path) -> Vec<PluginDescriptor> {
    let module = match loader.find_or_create_module(path) {
        Ok(module) => module,
        Err(e) => {
            tracing::warn!(path = %path.display(), "not a usable plugin: {e}");
            return Vec::new();
        }
    };

    let instance = match PluginInstance::open(module.clone(), 0) {
        Ok(instance) => instance,
        Err(e) => {
            tracing::warn!(path = %path.display(), "plugin failed to open: {e}");
            return Vec::new();
        }
    };

    let descriptors = if instance.category() == PluginCategory::Shell {
        let shell = read_shell(&instance);
        drop(instance);
        describe_shell(&module, &shell)
    } else {
        vec![instance.describe()]
    };

    tracing::info!(
        path = %path.display(),
        plugins = descriptors.len(),
        "enumerated module"
    );
    descriptors
}

/// Reads `(id, name)` pairs until the module returns 0, repeats an id, or
/// the cap is reached.
fn read_shell(instance: &PluginInstance) -> Vec<(i32, String)> {
    let mut seen = HashSet::new();
    let mut plugins = Vec::new();

    while plugins.len() < MAX_SHELL_PLUGINS {
        let mut name = [0u8; TEXT_BUFFER_LEN];
        let call = Invocation::new(EffectOpcode::ShellGetNextPlugin).ptr(name.as_mut_ptr());
        // SAFETY: the buffer is large enough for any product string.
        let id = unsafe { instance.dispatch(call) } as i32;
        if id == 0 {
            break;
        }
        if !seen.insert(id) {
            tracing::debug!(path = %instance.path().display(), id, "shell repeated an id, stopping");
            break;
        }
        plugins.push((id, crate::abi::text_from_buffer(&name)));
    }

    if plugins.len() == MAX_SHELL_PLUGINS {
        tracing::warn!(path = %instance.path().display(), "shell enumeration hit the sub-plugin cap");
    }
    plugins
}

fn describe_shell(module: &std::sync::Arc<ModuleHandle>, shell: &[(i32, String)]) -> Vec<PluginDescriptor> {
    let mut descriptors: Vec<PluginDescriptor> = Vec::with_capacity(shell.len());
    for (id, name) in shell {
        let sub = match PluginInstance::open(module.clone(), *id) {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!(path = %module.path().display(), id, "shell sub-plugin failed: {e}");
                continue;
            }
        };
        let mut desc = sub.describe();
        desc.unique_id = *id;
        if desc.name.is_empty() || desc.name == module.name() {
            desc.name = name.clone();
        }
        if !descriptors.iter().any(|d| d.is_duplicate_of(&desc)) {
            descriptors.push(desc);
        }
    }
    descriptors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, MockSpec};
    use std::sync::Arc;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"").unwrap();
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    #[test]
    fn test_classify_shared_objects() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = dir.path().join("reverb.so");
        let upper = dir.path().join("LOUD.SO");
        let other = dir.path().join("notes.txt");
        let folder = dir.path().join("folder.so");
        touch(&plugin);
        touch(&upper);
        touch(&other);
        fs::create_dir(&folder).unwrap();

        assert!(classify(&plugin));
        assert!(classify(&upper));
        assert!(!classify(&other));
        assert!(!classify(&folder));
        assert!(!classify(&dir.path().join("missing.so")));
    }

    #[test]
    fn test_search_respects_recursion_flag() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.plug"));
        touch(&dir.path().join("nested/b.plug"));
        touch(&dir.path().join("nested/deeper/c.plug"));
        touch(&dir.path().join("nested/readme.md"));
        let is_plugin = |p: &Path| p.extension().is_some_and(|e| e == "plug") && p.is_file();

        let flat = search_with(&[dir.path().to_path_buf()], false, is_plugin);
        assert_eq!(flat, vec![dir.path().join("a.plug")]);

        let deep = search_with(&[dir.path().to_path_buf()], true, is_plugin);
        assert_eq!(deep.len(), 3);
        assert!(deep.contains(&dir.path().join("nested/deeper/c.plug")));
    }

    #[test]
    fn test_search_does_not_enter_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Chorus.bundle");
        touch(&bundle.join("Contents/MacOS/Chorus"));
        touch(&bundle.join("Contents/Resources/inner.bundle/x"));
        let is_plugin = |p: &Path| p.extension().is_some_and(|e| e == "bundle") && p.is_dir();

        let found = search_with(&[dir.path().to_path_buf()], true, is_plugin);
        assert_eq!(found, vec![bundle]);
    }

    #[test]
    fn test_search_tolerates_missing_directories() {
        let found = search_directories(&[PathBuf::from("/definitely/not/here")], true);
        assert!(found.is_empty());
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    #[test]
    fn test_default_search_paths_include_home() {
        let paths = default_search_paths();
        assert!(paths.contains(&PathBuf::from("/usr/lib/vst")));
        assert!(paths.contains(&PathBuf::from("/usr/local/lib/vst")));
        let home = std::env::var("HOME").unwrap_or_default();
        assert_eq!(paths.last(), Some(&PathBuf::from(format!("{home}/.vst"))));
    }

    fn loader_with(file: &str, spec: MockSpec) -> (tempfile::TempDir, PathBuf, ModuleLoader) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(file);
        touch(&path);
        let loader = ModuleLoader::with_backend(Arc::new(MockBackend::new().with_plugin(file, spec)));
        (dir, path, loader)
    }

    #[test]
    fn test_enumerate_single_plugin() {
        let spec = MockSpec::synth("Organ", 0x4f52_4731, 4);
        let (_dir, path, loader) = loader_with("organ.so", spec);

        let found = enumerate(&loader, &path);
        assert_eq!(found.len(), 1);
        let desc = &found[0];
        assert_eq!(desc.name, "Organ");
        assert_eq!(desc.unique_id, 0x4f52_4731);
        assert_eq!(desc.manufacturer, "Mockworks");
        assert!(desc.is_instrument);
        assert!(desc.accepts_midi);
        assert_eq!(desc.category, PluginCategory::Synth);
        assert_eq!(loader.resident_count(), 0);
    }

    #[test]
    fn test_enumerate_shell() {
        let spec = MockSpec::shell("Bundle", &[(11, "Comp"), (22, "Gate"), (33, "EQ")]);
        let probe = spec.probe.clone();
        let (_dir, path, loader) = loader_with("bundle.so", spec);

        let found = enumerate(&loader, &path);
        let ids: Vec<i32> = found.iter().map(|d| d.unique_id).collect();
        assert_eq!(ids, vec![11, 22, 33]);
        assert_eq!(found[1].name, "Gate");
        assert!(found.iter().all(|d| d.category == PluginCategory::Effect));
        assert_eq!(probe.with(|s| s.creation_ids.clone()), vec![0, 11, 22, 33]);
        assert_eq!(probe.live_effects(), 0);
    }

    #[test]
    fn test_enumerate_shell_stops_on_repeats() {
        let mut spec = MockSpec::shell("Loop", &[(5, "One"), (6, "Two")]);
        spec.shell_repeats = true;
        let (_dir, path, loader) = loader_with("loop.so", spec);

        let found = enumerate(&loader, &path);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_enumerate_unknown_file_is_empty() {
        let (_dir, _path, loader) = loader_with("known.so", MockSpec::effect("Known", 1, 0));
        let dir = tempfile::tempdir().unwrap();
        let stranger = dir.path().join("stranger.so");
        touch(&stranger);

        assert!(enumerate(&loader, &stranger).is_empty());
        assert!(enumerate(&loader, &dir.path().join("absent.so")).is_empty());
    }

    #[test]
    fn test_enumerate_open_failure_is_empty() {
        let mut spec = MockSpec::effect("Broken", 1, 0);
        spec.panic_on_open = true;
        let (_dir, path, loader) = loader_with("broken.so", spec);
        assert!(enumerate(&loader, &path).is_empty());
    }
}
