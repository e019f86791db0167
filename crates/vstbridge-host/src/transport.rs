//! Transport position supplied by the surrounding application, and its
//! translation into the record plugins read through `GetTime`.

use std::sync::LazyLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::abi::{time_flags, VstTimeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransportInfo {
    pub playing: bool,
    pub recording: bool,
    pub cycle_active: bool,
    pub tempo: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
    pub position_samples: i64,
    pub position_quarters: f64,
    pub bar_position_quarters: f64,
    pub cycle_start_quarters: f64,
    pub cycle_end_quarters: f64,
}

impl Default for TransportInfo {
    fn default() -> Self {
        Self {
            playing: false,
            recording: false,
            cycle_active: false,
            tempo: 120.0,
            time_sig_numerator: 4,
            time_sig_denominator: 4,
            position_samples: 0,
            position_quarters: 0.0,
            bar_position_quarters: 0.0,
            cycle_start_quarters: 0.0,
            cycle_end_quarters: 0.0,
        }
    }
}

/// Current-position query implemented by the application.
///
/// Called from the audio thread once per block; must not block.
pub trait PlayHead: Send + Sync {
    fn current_position(&self) -> Option<TransportInfo>;
}

/// A play head that always reports the same position.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPlayHead(pub TransportInfo);

impl PlayHead for FixedPlayHead {
    fn current_position(&self) -> Option<TransportInfo> {
        Some(self.0)
    }
}

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Refreshes `info` for the coming block. Without a transport the record
/// reports a stopped 120 bpm 4/4 timeline.
pub(crate) fn update_time_info(
    info: &mut VstTimeInfo,
    transport: Option<&TransportInfo>,
    sample_rate: f64,
) {
    let was_playing = info.flags & time_flags::TRANSPORT_PLAYING != 0;
    let default = TransportInfo::default();
    let t = transport.unwrap_or(&default);

    let mut flags = time_flags::NANOS_VALID | time_flags::TEMPO_VALID | time_flags::TIME_SIG_VALID;
    if transport.is_some() {
        flags |= time_flags::PPQ_POS_VALID | time_flags::BARS_VALID;
    }
    if t.playing {
        flags |= time_flags::TRANSPORT_PLAYING;
    }
    if t.recording {
        flags |= time_flags::TRANSPORT_RECORDING;
    }
    if t.cycle_active {
        flags |= time_flags::TRANSPORT_CYCLE_ACTIVE | time_flags::CYCLE_POS_VALID;
    }
    if t.playing != was_playing {
        flags |= time_flags::TRANSPORT_CHANGED;
    }

    *info = VstTimeInfo {
        sample_pos: t.position_samples as f64,
        sample_rate,
        nano_seconds: EPOCH.elapsed().as_nanos() as f64,
        ppq_pos: t.position_quarters,
        tempo: t.tempo,
        bar_start_pos: t.bar_position_quarters,
        cycle_start_pos: t.cycle_start_quarters,
        cycle_end_pos: t.cycle_end_quarters,
        time_sig_numerator: t.time_sig_numerator,
        time_sig_denominator: t.time_sig_denominator,
        flags,
        ..Default::default()
    };
}

/// Initial record before any block has run.
pub(crate) fn initial_time_info(sample_rate: f64) -> VstTimeInfo {
    let mut info = VstTimeInfo::default();
    update_time_info(&mut info, None, sample_rate);
    info.flags &= !time_flags::TRANSPORT_CHANGED;
    info
}
