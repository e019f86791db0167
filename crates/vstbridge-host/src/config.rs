//! Process-wide host configuration.

use std::sync::{Arc, LazyLock};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// What the host reports about itself and the defaults it falls back to.
///
/// Read lock-free from the callback path, so it is swapped as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub product_name: String,
    pub vendor_name: String,
    pub vendor_version: i32,
    /// Answered to `GetSampleRate` when no instance has been prepared.
    pub default_sample_rate: f64,
    /// Answered to `GetBlockSize` when no instance has been prepared.
    pub default_block_size: usize,
    /// Largest opaque chunk accepted from or handed to a plugin.
    pub max_chunk_size: usize,
    pub default_editor_width: i32,
    pub default_editor_height: i32,
    pub editor_idle_interval_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            product_name: "vstbridge".to_string(),
            vendor_name: "vstbridge".to_string(),
            vendor_version: 0x0101,
            default_sample_rate: 44100.0,
            default_block_size: 512,
            max_chunk_size: 64 * 1024 * 1024,
            default_editor_width: 250,
            default_editor_height: 150,
            editor_idle_interval_ms: 20,
            event_channel_capacity: default_event_capacity(),
        }
    }
}

static CONFIG: LazyLock<ArcSwap<HostConfig>> =
    LazyLock::new(|| ArcSwap::from_pointee(HostConfig::default()));

pub fn host_config() -> Arc<HostConfig> {
    CONFIG.load_full()
}

/// Replaces the process-wide configuration. Instances already running keep
/// the buffers they allocated.
pub fn set_host_config(config: HostConfig) {
    tracing::debug!(product = %config.product_name, "host config updated");
    CONFIG.store(Arc::new(config));
}
