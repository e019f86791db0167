//! `#[repr(C)]` mirrors of the VST 2.x binary interface.
//!
//! Only layout lives here. Everything that calls through these pointers is in
//! [`crate::effect`] and [`crate::host`].

use std::ffi::c_void;
use std::os::raw::c_char;

/// Four-character code as stored by the ABI (first character in the high byte).
pub const fn fourcc(tag: &[u8; 4]) -> i32 {
    i32::from_be_bytes(*tag)
}

pub const EFFECT_MAGIC: i32 = fourcc(b"VstP");

/// Version this host reports for `HostOpcode::Version`.
pub const HOST_ABI_VERSION: isize = 2400;

pub type HostCallbackProc =
    extern "C" fn(*mut AEffect, i32, i32, isize, *mut c_void, f32) -> isize;
pub type DispatcherProc = extern "C" fn(*mut AEffect, i32, i32, isize, *mut c_void, f32) -> isize;
pub type ProcessProc = extern "C" fn(*mut AEffect, *mut *mut f32, *mut *mut f32, i32);
pub type ProcessDoubleProc = extern "C" fn(*mut AEffect, *mut *mut f64, *mut *mut f64, i32);
pub type SetParameterProc = extern "C" fn(*mut AEffect, i32, f32);
pub type GetParameterProc = extern "C" fn(*mut AEffect, i32) -> f32;

/// Signature of `VSTPluginMain` / `main`.
pub type PluginMainProc = unsafe extern "C" fn(HostCallbackProc) -> *mut AEffect;

/// The effect record a module hands back from its entry point.
#[repr(C)]
pub struct AEffect {
    pub magic: i32,
    pub dispatcher: Option<DispatcherProc>,
    pub process: Option<ProcessProc>,
    pub set_parameter: Option<SetParameterProc>,
    pub get_parameter: Option<GetParameterProc>,
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    pub resvd1: isize,
    pub resvd2: isize,
    pub initial_delay: i32,
    pub real_qualities: i32,
    pub off_qualities: i32,
    pub io_ratio: f32,
    pub object: *mut c_void,
    pub user: *mut c_void,
    pub unique_id: i32,
    pub version: i32,
    pub process_replacing: Option<ProcessProc>,
    pub process_double_replacing: Option<ProcessDoubleProc>,
    pub future: [u8; 56],
}

pub mod flags {
    pub const HAS_EDITOR: i32 = 1;
    pub const CAN_REPLACING: i32 = 1 << 4;
    pub const PROGRAM_CHUNKS: i32 = 1 << 5;
    pub const IS_SYNTH: i32 = 1 << 8;
    pub const NO_SOUND_IN_STOP: i32 = 1 << 9;
    pub const CAN_DOUBLE_REPLACING: i32 = 1 << 12;
}

macro_rules! opcodes {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum $name {
            $($variant = $value,)*
        }

        impl $name {
            pub fn from_raw(raw: i32) -> Option<Self> {
                match raw {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub const fn raw(self) -> i32 {
                self as i32
            }
        }
    };
}

opcodes! {
    /// Host → plugin dispatcher opcodes.
    EffectOpcode {
        Open = 0,
        Close = 1,
        SetProgram = 2,
        GetProgram = 3,
        SetProgramName = 4,
        GetProgramName = 5,
        GetParamLabel = 6,
        GetParamDisplay = 7,
        GetParamName = 8,
        SetSampleRate = 10,
        SetBlockSize = 11,
        MainsChanged = 12,
        EditGetRect = 13,
        EditOpen = 14,
        EditClose = 15,
        EditIdle = 19,
        Identify = 22,
        GetChunk = 23,
        SetChunk = 24,
        ProcessEvents = 25,
        CanBeAutomated = 26,
        GetProgramNameIndexed = 29,
        ConnectInput = 31,
        ConnectOutput = 32,
        GetInputProperties = 33,
        GetOutputProperties = 34,
        GetPlugCategory = 35,
        SetBypass = 44,
        GetEffectName = 45,
        GetVendorString = 47,
        GetProductString = 48,
        GetVendorVersion = 49,
        CanDo = 51,
        GetTailSize = 52,
        Idle = 53,
        GetVstVersion = 58,
        ShellGetNextPlugin = 70,
        StartProcess = 71,
        StopProcess = 72,
    }
}

opcodes! {
    /// Plugin → host callback opcodes.
    HostOpcode {
        Automate = 0,
        Version = 1,
        CurrentId = 2,
        Idle = 3,
        PinConnected = 4,
        WantMidi = 6,
        GetTime = 7,
        ProcessEvents = 8,
        SetTime = 9,
        TempoAt = 10,
        GetNumAutomatableParameters = 11,
        GetParameterQuantization = 12,
        IoChanged = 13,
        NeedIdle = 14,
        SizeWindow = 15,
        GetSampleRate = 16,
        GetBlockSize = 17,
        GetInputLatency = 18,
        GetOutputLatency = 19,
        WillReplaceOrAccumulate = 22,
        GetCurrentProcessLevel = 23,
        GetAutomationState = 24,
        GetVendorString = 32,
        GetProductString = 33,
        GetVendorVersion = 34,
        VendorSpecific = 35,
        CanDo = 37,
        GetLanguage = 38,
        GetDirectory = 41,
        UpdateDisplay = 42,
        BeginEdit = 43,
        EndEdit = 44,
        OpenFileSelector = 45,
        CloseFileSelector = 46,
    }
}

pub mod process_level {
    pub const UNKNOWN: isize = 0;
    pub const USER: isize = 1;
    pub const REALTIME: isize = 2;
}

/// Plugin categories returned by `EffectOpcode::GetPlugCategory`.
pub mod category {
    pub const UNKNOWN: isize = 0;
    pub const EFFECT: isize = 1;
    pub const SYNTH: isize = 2;
    pub const ANALYSIS: isize = 3;
    pub const MASTERING: isize = 4;
    pub const SPACIALIZER: isize = 5;
    pub const ROOM_FX: isize = 6;
    pub const SURROUND_FX: isize = 7;
    pub const RESTORATION: isize = 8;
    pub const OFFLINE_PROCESS: isize = 9;
    pub const SHELL: isize = 10;
    pub const GENERATOR: isize = 11;
}

pub const MIDI_EVENT_TYPE: i32 = 1;
pub const SYSEX_EVENT_TYPE: i32 = 6;

/// Generic event header; `byte_size` counts the bytes after `byte_size`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VstEvent {
    pub event_type: i32,
    pub byte_size: i32,
    pub delta_frames: i32,
    pub flags: i32,
    pub data: [u8; 16],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VstMidiEvent {
    pub event_type: i32,
    pub byte_size: i32,
    pub delta_frames: i32,
    pub flags: i32,
    pub note_length: i32,
    pub note_offset: i32,
    pub midi_data: [u8; 4],
    pub detune: i8,
    pub note_off_velocity: u8,
    pub reserved1: u8,
    pub reserved2: u8,
}

impl VstMidiEvent {
    pub fn new(delta_frames: i32, data: [u8; 3]) -> Self {
        Self {
            event_type: MIDI_EVENT_TYPE,
            byte_size: (std::mem::size_of::<Self>() - 8) as i32,
            delta_frames,
            midi_data: [data[0], data[1], data[2], 0],
            ..Default::default()
        }
    }
}

/// Variable-length event list. Only the header and the first two slots are
/// declared; hosts allocate more behind it.
#[repr(C)]
pub struct VstEvents {
    pub num_events: i32,
    pub reserved: isize,
    pub events: [*mut VstEvent; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VstTimeInfo {
    pub sample_pos: f64,
    pub sample_rate: f64,
    pub nano_seconds: f64,
    pub ppq_pos: f64,
    pub tempo: f64,
    pub bar_start_pos: f64,
    pub cycle_start_pos: f64,
    pub cycle_end_pos: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
    pub smpte_offset: i32,
    pub smpte_frame_rate: i32,
    pub samples_to_next_clock: i32,
    pub flags: i32,
}

pub mod time_flags {
    pub const TRANSPORT_CHANGED: i32 = 1;
    pub const TRANSPORT_PLAYING: i32 = 1 << 1;
    pub const TRANSPORT_CYCLE_ACTIVE: i32 = 1 << 2;
    pub const TRANSPORT_RECORDING: i32 = 1 << 3;
    pub const NANOS_VALID: i32 = 1 << 8;
    pub const PPQ_POS_VALID: i32 = 1 << 9;
    pub const TEMPO_VALID: i32 = 1 << 10;
    pub const BARS_VALID: i32 = 1 << 11;
    pub const CYCLE_POS_VALID: i32 = 1 << 12;
    pub const TIME_SIG_VALID: i32 = 1 << 13;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ERect {
    pub top: i16,
    pub left: i16,
    pub bottom: i16,
    pub right: i16,
}

impl ERect {
    pub fn width(&self) -> i32 {
        i32::from(self.right) - i32::from(self.left)
    }

    pub fn height(&self) -> i32 {
        i32::from(self.bottom) - i32::from(self.top)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct VstPinProperties {
    pub label: [c_char; 64],
    pub flags: i32,
    pub arrangement_type: i32,
    pub short_label: [c_char; 8],
    pub future: [u8; 48],
}

impl Default for VstPinProperties {
    fn default() -> Self {
        Self {
            label: [0; 64],
            flags: 0,
            arrangement_type: 0,
            short_label: [0; 8],
            future: [0; 48],
        }
    }
}

pub mod pin_flags {
    pub const IS_ACTIVE: i32 = 1;
    pub const IS_STEREO: i32 = 1 << 1;
    pub const USE_SPEAKER: i32 = 1 << 2;
}

/// Size of the scratch buffer handed to string-returning opcodes. The ABI
/// limits are far smaller, but plugins routinely overrun them.
pub const TEXT_BUFFER_LEN: usize = 256;

pub const MAX_PROGRAM_NAME_LEN: usize = 24;

/// Reads a NUL-terminated string out of a fixed buffer.
pub fn text_from_buffer(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim().to_string()
}

/// Same as [`text_from_buffer`] for `c_char` arrays.
pub fn text_from_chars(buf: &[c_char]) -> String {
    let bytes: Vec<u8> = buf.iter().map(|&c| c as u8).collect();
    text_from_buffer(&bytes)
}

/// Copies `text` into a caller-supplied C buffer of `capacity` bytes,
/// truncating and always terminating.
///
/// # Safety
/// `dst` must be valid for `capacity` bytes of writes.
pub unsafe fn write_text(dst: *mut c_char, capacity: usize, text: &str) {
    if dst.is_null() || capacity == 0 {
        return;
    }
    let bytes = text.as_bytes();
    let len = bytes.len().min(capacity - 1);
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.cast::<u8>(), len);
    *dst.add(len) = 0;
}
