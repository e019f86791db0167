//! Test helpers and fixtures for vstbridge integration tests
//!
//! Plugins here are mock effects served by an in-process library backend;
//! every "binary" is an empty file in a scratch directory.

pub mod tolerances;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use vstbridge::prelude::*;
use vstbridge_host::testing::{MockBackend, MockSpec};

/// Default test sample rate
pub const TEST_SAMPLE_RATE: f64 = 48000.0;

/// Standard buffer size for deterministic testing
pub const TEST_BUFFER_SIZE: usize = 256;

/// A scratch plugin directory and a loader that only knows its mocks.
pub struct Fixture {
    pub dir: TempDir,
    pub backend: Arc<MockBackend>,
    pub loader: ModuleLoader,
}

impl Fixture {
    /// One mock per `(relative path, spec)`, each backed by an empty file.
    /// Mocks are matched by file name alone.
    pub fn new(plugins: Vec<(&str, MockSpec)>) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create plugin directory");
        let mut backend = MockBackend::new();
        for (file, spec) in plugins {
            let path = dir.path().join(file);
            touch(&path);
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            backend = backend.with_plugin(&name, spec);
        }
        let backend = Arc::new(backend);
        let loader = ModuleLoader::with_backend(backend.clone());
        Self {
            dir,
            backend,
            loader,
        }
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.path().join(file)
    }

    /// Loads and initialises the plugin in `file`.
    pub fn load(&self, file: &str) -> PluginInstance {
        PluginInstance::load(&self.loader, &self.path(file), 0).expect("Failed to load mock plugin")
    }

    /// Loads, initialises and prepares the plugin in `file`.
    pub fn prepared(&self, file: &str) -> PluginInstance {
        let plugin = self.load(file);
        plugin.prepare(TEST_SAMPLE_RATE, TEST_BUFFER_SIZE);
        plugin
    }
}

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create directory");
    }
    std::fs::write(path, b"").expect("Failed to create file");
}

/// Reproducible parameter vector with values in [0, 1].
pub fn parameter_vector(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = seed;
    (0..len)
        .map(|_| {
            rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1);
            (rng >> 40) as f32 / (1u64 << 24) as f32
        })
        .collect()
}

/// Generate a test signal: sine wave at given frequency for specified samples.
pub fn generate_sine(frequency: f64, sample_rate: f64, num_samples: usize) -> Vec<f32> {
    (0..num_samples)
        .map(|i| {
            let t = i as f64 / sample_rate;
            (2.0 * std::f64::consts::PI * frequency * t).sin() as f32
        })
        .collect()
}

/// Check if two signals are approximately equal within tolerance.
pub fn signals_approx_equal(a: &[f32], b: &[f32], tolerance: f32) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() <= tolerance)
}

/// Current values of every parameter.
pub fn snapshot(plugin: &PluginInstance) -> Vec<f32> {
    (0..plugin.num_parameters())
        .map(|i| plugin.get_parameter(i))
        .collect()
}
