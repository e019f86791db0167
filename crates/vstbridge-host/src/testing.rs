//! Scriptable in-process effects for exercising the host without native
//! binaries.
//!
//! A [`MockBackend`] stands in for the dynamic loader: it maps file names to
//! [`MockSpec`]s and hands out [`MockEffect`]s that talk to the host through
//! the same callback path a native module uses. Everything an effect sees is
//! recorded in a shared [`MockProbe`].

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::abi::{self, category, flags, EffectOpcode, ERect, HostOpcode, VstEvents};
use crate::effect::{Effect, EffectKey, EffectLayout, Invocation};
use crate::error::LoadError;
use crate::host::{native_call_depth, HostCallback};
use crate::midi::{read_events, MidiEvent, MidiEventVec};
use crate::module::{LibraryBackend, ModuleCode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockProgram {
    pub name: String,
    pub params: Vec<f32>,
}

/// How a mock plugin processes audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockProcessing {
    /// In place, scaling every channel by the gain.
    Replacing,
    /// Into separate outputs (`process`), output `n` reading input `n % inputs`.
    Accumulating,
}

#[derive(Debug, Clone)]
pub struct MockSpec {
    pub name: String,
    pub vendor: String,
    pub unique_id: i32,
    pub version: i32,
    pub vendor_version: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub param_names: Vec<String>,
    /// Empty means a single unnamed program is used internally and none is
    /// reported.
    pub programs: Vec<MockProgram>,
    pub indexed_program_names: bool,
    pub chunks: bool,
    pub synth: bool,
    pub midi_in: bool,
    /// Echo received MIDI back to the host during processing.
    pub midi_out: bool,
    pub gain: f32,
    pub processing: MockProcessing,
    pub panic_on_process: bool,
    /// Panic only after the block's output has been written.
    pub panic_after_write: bool,
    /// Ask the host for idle time from inside processing.
    pub idle_in_process: bool,
    pub panic_on_open: bool,
    pub editor: Option<(i16, i16)>,
    pub category: isize,
    /// Sub-plugins reported through `ShellGetNextPlugin`.
    pub shell: Vec<(i32, String)>,
    /// Keep returning the last shell id instead of terminating.
    pub shell_repeats: bool,
    pub probe: MockProbe,
}

impl MockSpec {
    /// A stereo effect with `params` parameters, all starting at 0.
    pub fn effect(name: &str, unique_id: i32, params: usize) -> Self {
        Self {
            name: name.to_string(),
            vendor: "Mockworks".to_string(),
            unique_id,
            version: 0x0001_0000,
            vendor_version: 0x0001_0200,
            num_inputs: 2,
            num_outputs: 2,
            param_names: (0..params).map(|i| format!("Param {}", i + 1)).collect(),
            programs: Vec::new(),
            indexed_program_names: true,
            chunks: false,
            synth: false,
            midi_in: false,
            midi_out: false,
            gain: 1.0,
            processing: MockProcessing::Replacing,
            panic_on_process: false,
            panic_after_write: false,
            idle_in_process: false,
            panic_on_open: false,
            editor: None,
            category: category::EFFECT,
            shell: Vec::new(),
            shell_repeats: false,
            probe: MockProbe::default(),
        }
    }

    /// A MIDI instrument with no audio inputs.
    pub fn synth(name: &str, unique_id: i32, params: usize) -> Self {
        Self {
            num_inputs: 0,
            synth: true,
            midi_in: true,
            category: category::SYNTH,
            ..Self::effect(name, unique_id, params)
        }
    }

    /// A shell module exposing `plugins` as sub-plugins.
    pub fn shell(name: &str, plugins: &[(i32, &str)]) -> Self {
        Self {
            category: category::SHELL,
            shell: plugins.iter().map(|(id, n)| (*id, n.to_string())).collect(),
            ..Self::effect(name, 0, 0)
        }
    }

    pub fn with_programs(mut self, names: &[&str]) -> Self {
        let count = self.param_names.len();
        self.programs = names
            .iter()
            .map(|n| MockProgram {
                name: n.to_string(),
                params: vec![0.0; count],
            })
            .collect();
        self
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_chunks(mut self) -> Self {
        self.chunks = true;
        self
    }

    pub fn with_editor(mut self, width: i16, height: i16) -> Self {
        self.editor = Some((width, height));
        self
    }

    pub fn with_io(mut self, inputs: i32, outputs: i32) -> Self {
        self.num_inputs = inputs;
        self.num_outputs = outputs;
        self
    }

    pub fn with_processing(mut self, processing: MockProcessing) -> Self {
        self.processing = processing;
        self
    }

    pub fn with_midi(mut self, midi_in: bool, midi_out: bool) -> Self {
        self.midi_in = midi_in;
        self.midi_out = midi_out;
        self
    }

    pub fn panicking_in_process(mut self) -> Self {
        self.panic_on_process = true;
        self
    }

    pub fn panicking_after_write(mut self) -> Self {
        self.panic_after_write = true;
        self
    }

    pub fn with_idle_in_process(mut self) -> Self {
        self.idle_in_process = true;
        self
    }

    fn flags(&self) -> i32 {
        let mut bits = 0;
        if self.processing == MockProcessing::Replacing {
            bits |= flags::CAN_REPLACING;
        }
        if self.chunks {
            bits |= flags::PROGRAM_CHUNKS;
        }
        if self.synth {
            bits |= flags::IS_SYNTH;
        }
        if self.editor.is_some() {
            bits |= flags::HAS_EDITOR;
        }
        bits
    }
}

/// What the mock effects of one spec observed.
#[derive(Debug, Default)]
pub struct ProbeState {
    pub opcodes: Vec<EffectOpcode>,
    pub sample_rate: f32,
    pub block_size: isize,
    pub mains_on: bool,
    pub processed_blocks: usize,
    pub midi_received: Vec<MidiEvent>,
    pub editor_parent: Option<usize>,
    pub editor_idles: usize,
    pub plugin_idles: usize,
    /// Highest native call depth seen from inside the effect.
    pub deepest_call: usize,
    pub latency: i32,
    /// `CurrentId` answered to the entry point.
    pub creation_ids: Vec<i32>,
    pub live_effects: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockProbe(Arc<Mutex<ProbeState>>);

impl MockProbe {
    pub fn with<R>(&self, f: impl FnOnce(&mut ProbeState) -> R) -> R {
        f(&mut self.0.lock())
    }

    pub fn count(&self, opcode: EffectOpcode) -> usize {
        self.with(|s| s.opcodes.iter().filter(|o| **o == opcode).count())
    }

    pub fn set_latency(&self, samples: i32) {
        self.with(|s| s.latency = samples);
    }

    pub fn live_effects(&self) -> usize {
        self.with(|s| s.live_effects)
    }
}

#[derive(Serialize, Deserialize)]
struct ChunkImage {
    current: usize,
    programs: Vec<MockProgram>,
}

/// An in-process effect driven by a [`MockSpec`].
pub struct MockEffect {
    key: EffectKey,
    host: HostCallback,
    spec: MockSpec,
    unique_id: i32,
    name: String,
    category: isize,
    programs: Vec<MockProgram>,
    current: usize,
    chunk: Vec<u8>,
    rect: ERect,
    shell_cursor: usize,
    pending_midi: MidiEventVec,
}

impl MockEffect {
    pub fn new(spec: MockSpec, host: HostCallback) -> Self {
        let key = EffectKey::allocate();
        let shell_id = host.current_id();
        spec.probe.with(|s| {
            s.creation_ids.push(shell_id);
            s.live_effects += 1;
        });

        let (unique_id, name, category) = match spec.shell.iter().find(|(id, _)| *id == shell_id) {
            Some((id, name)) if shell_id != 0 => (*id, name.clone(), category::EFFECT),
            _ => (spec.unique_id, spec.name.clone(), spec.category),
        };

        let programs = if spec.programs.is_empty() {
            vec![MockProgram {
                name: String::new(),
                params: vec![0.0; spec.param_names.len()],
            }]
        } else {
            spec.programs.clone()
        };

        Self {
            key,
            host,
            unique_id,
            name,
            category,
            programs,
            current: 0,
            chunk: Vec::new(),
            rect: ERect::default(),
            shell_cursor: 0,
            pending_midi: MidiEventVec::new(),
            spec,
        }
    }

    fn params(&self) -> &[f32] {
        &self.programs[self.current].params
    }

    unsafe fn write(ptr: *mut c_void, capacity: usize, text: &str) -> isize {
        abi::write_text(ptr.cast::<c_char>(), capacity, text);
        1
    }

    unsafe fn get_chunk(&mut self, preset: bool, ptr: *mut c_void) -> isize {
        let image = if preset {
            ChunkImage {
                current: 0,
                programs: vec![self.programs[self.current].clone()],
            }
        } else {
            ChunkImage {
                current: self.current,
                programs: self.programs.clone(),
            }
        };
        self.chunk = bincode::serialize(&image).unwrap_or_default();
        *ptr.cast::<*mut c_void>() = self.chunk.as_mut_ptr().cast();
        self.chunk.len() as isize
    }

    unsafe fn set_chunk(&mut self, preset: bool, ptr: *mut c_void, len: isize) -> isize {
        let data = std::slice::from_raw_parts(ptr.cast::<u8>(), len.max(0) as usize);
        let Ok(image) = bincode::deserialize::<ChunkImage>(data) else {
            return 0;
        };
        if image.programs.is_empty() {
            return 0;
        }
        if preset {
            if let Some(program) = image.programs.into_iter().next() {
                self.programs[self.current] = program;
            }
        } else {
            self.current = image.current.min(image.programs.len() - 1);
            self.programs = image.programs;
        }
        1
    }
}

impl Drop for MockEffect {
    fn drop(&mut self) {
        self.spec.probe.with(|s| s.live_effects -= 1);
    }
}

impl Effect for MockEffect {
    fn key(&self) -> EffectKey {
        self.key
    }

    fn layout(&self) -> EffectLayout {
        EffectLayout {
            num_programs: self.spec.programs.len() as i32,
            num_params: self.spec.param_names.len() as i32,
            num_inputs: self.spec.num_inputs,
            num_outputs: self.spec.num_outputs,
            flags: self.spec.flags(),
            initial_delay: self.spec.probe.with(|s| s.latency),
            unique_id: self.unique_id,
            version: self.spec.version,
        }
    }

    unsafe fn dispatch(&mut self, call: Invocation) -> isize {
        let Some(opcode) = call.effect_opcode() else {
            return 0;
        };
        self.spec.probe.with(|s| {
            s.opcodes.push(opcode);
            s.deepest_call = s.deepest_call.max(native_call_depth());
        });

        match opcode {
            EffectOpcode::Open if self.spec.panic_on_open => panic!("open failed"),
            EffectOpcode::SetProgram => {
                let count = self.programs.len();
                self.current = (call.value.max(0) as usize).min(count - 1);
                0
            }
            EffectOpcode::GetProgram => self.current as isize,
            EffectOpcode::SetProgramName => {
                let name = CStr::from_ptr(call.ptr.cast::<c_char>()).to_string_lossy();
                self.programs[self.current].name = name.into_owned();
                0
            }
            EffectOpcode::GetProgramName => {
                let name = self.programs[self.current].name.clone();
                Self::write(call.ptr, abi::MAX_PROGRAM_NAME_LEN + 1, &name)
            }
            EffectOpcode::GetProgramNameIndexed => {
                match self.programs.get(call.index.max(0) as usize) {
                    Some(p) if self.spec.indexed_program_names => {
                        let name = p.name.clone();
                        Self::write(call.ptr, abi::MAX_PROGRAM_NAME_LEN + 1, &name)
                    }
                    _ => 0,
                }
            }
            EffectOpcode::GetParamName => match self.spec.param_names.get(call.index as usize) {
                Some(name) => Self::write(call.ptr, 8, name),
                None => 0,
            },
            EffectOpcode::GetParamLabel => Self::write(call.ptr, 8, "%"),
            EffectOpcode::GetParamDisplay => {
                let value = self.params().get(call.index as usize).copied().unwrap_or(0.0);
                Self::write(call.ptr, 8, &format!("{:.0}", value * 100.0))
            }
            EffectOpcode::CanBeAutomated => 1,
            EffectOpcode::SetSampleRate => {
                self.spec.probe.with(|s| s.sample_rate = call.opt);
                0
            }
            EffectOpcode::SetBlockSize => {
                self.spec.probe.with(|s| s.block_size = call.value);
                0
            }
            EffectOpcode::MainsChanged => {
                self.spec.probe.with(|s| s.mains_on = call.value != 0);
                0
            }
            EffectOpcode::GetChunk if self.spec.chunks => self.get_chunk(call.index != 0, call.ptr),
            EffectOpcode::SetChunk if self.spec.chunks => {
                self.set_chunk(call.index != 0, call.ptr, call.value)
            }
            EffectOpcode::ProcessEvents => {
                let mut received = MidiEventVec::new();
                read_events(call.ptr as *const VstEvents, &mut received);
                if self.spec.midi_out {
                    self.pending_midi.extend(received.iter().copied());
                }
                self.spec.probe.with(|s| s.midi_received.extend(received));
                1
            }
            EffectOpcode::EditGetRect => match self.spec.editor {
                Some((width, height)) => {
                    self.rect = ERect {
                        top: 0,
                        left: 0,
                        bottom: height,
                        right: width,
                    };
                    *call.ptr.cast::<*mut ERect>() = &mut self.rect;
                    1
                }
                None => 0,
            },
            EffectOpcode::EditOpen => {
                self.spec
                    .probe
                    .with(|s| s.editor_parent = Some(call.ptr as usize));
                1
            }
            EffectOpcode::EditClose => {
                self.spec.probe.with(|s| s.editor_parent = None);
                0
            }
            EffectOpcode::EditIdle => {
                self.spec.probe.with(|s| s.editor_idles += 1);
                0
            }
            EffectOpcode::Idle => {
                self.spec.probe.with(|s| s.plugin_idles += 1);
                0
            }
            EffectOpcode::GetPlugCategory => self.category,
            EffectOpcode::GetEffectName => Self::write(call.ptr, 32, &self.name),
            EffectOpcode::GetVendorString => Self::write(call.ptr, 64, &self.spec.vendor),
            EffectOpcode::GetProductString => Self::write(call.ptr, 64, &self.spec.name),
            EffectOpcode::GetVendorVersion => self.spec.vendor_version as isize,
            EffectOpcode::CanDo => {
                let what = CStr::from_ptr(call.ptr.cast::<c_char>()).to_bytes();
                match what {
                    b"receiveVstMidiEvent" | b"receiveVstEvents" if self.spec.midi_in => 1,
                    b"sendVstMidiEvent" | b"sendVstEvents" if self.spec.midi_out => 1,
                    _ => -1,
                }
            }
            EffectOpcode::GetVstVersion => 2400,
            EffectOpcode::ShellGetNextPlugin => {
                let entry = match self.spec.shell.get(self.shell_cursor) {
                    Some(entry) => Some(entry.clone()),
                    None if self.spec.shell_repeats => self.spec.shell.last().cloned(),
                    None => None,
                };
                self.shell_cursor += 1;
                match entry {
                    Some((id, name)) => {
                        Self::write(call.ptr, abi::TEXT_BUFFER_LEN / 4, &name);
                        id as isize
                    }
                    None => 0,
                }
            }
            _ => 0,
        }
    }

    fn process_replacing(&mut self, channels: &mut [&mut [f32]], frames: usize) {
        self.start_block();
        for channel in channels.iter_mut() {
            for sample in channel[..frames].iter_mut() {
                *sample *= self.spec.gain;
            }
        }
        self.finish_block();
    }

    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
        self.start_block();
        for (n, output) in outputs.iter_mut().enumerate() {
            let Some(input) = (!inputs.is_empty()).then(|| inputs[n % inputs.len()]) else {
                continue;
            };
            for (out, sample) in output[..frames].iter_mut().zip(input) {
                *out += sample * self.spec.gain;
            }
        }
        self.finish_block();
    }

    fn get_parameter(&mut self, index: i32) -> f32 {
        self.params().get(index as usize).copied().unwrap_or(0.0)
    }

    fn set_parameter(&mut self, index: i32, value: f32) {
        if let Some(param) = self.programs[self.current].params.get_mut(index as usize) {
            *param = value;
            self.host.automate(self.key, index, value);
        }
    }
}

impl MockEffect {
    fn start_block(&mut self) {
        self.spec
            .probe
            .with(|s| s.deepest_call = s.deepest_call.max(native_call_depth()));
        if self.spec.panic_on_process {
            panic!("mock processing fault");
        }
        if self.spec.idle_in_process {
            self.host.idle(self.key);
        }
    }

    fn finish_block(&mut self) {
        if self.spec.panic_after_write {
            panic!("mock fault after writing output");
        }
        self.spec.probe.with(|s| s.processed_blocks += 1);
        if !self.pending_midi.is_empty() {
            let events = std::mem::take(&mut self.pending_midi);
            self.host.send_midi(self.key, &events);
        }
    }

    /// Raises an arbitrary host callback as this effect.
    pub fn callback(&self, opcode: HostOpcode, index: i32, value: isize) -> isize {
        let call = Invocation::host(opcode).index(index).value(value);
        unsafe { self.host.dispatch(Some(self.key), call) }
    }
}

struct MockModule {
    spec: MockSpec,
    live_modules: Arc<AtomicUsize>,
}

impl ModuleCode for MockModule {
    fn create_effect(&self, host: HostCallback) -> Result<Box<dyn Effect>, LoadError> {
        Ok(Box::new(MockEffect::new(self.spec.clone(), host)))
    }
}

impl Drop for MockModule {
    fn drop(&mut self) {
        self.live_modules.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Library backend resolving file names to mock specs.
#[derive(Default)]
pub struct MockBackend {
    specs: Mutex<HashMap<String, MockSpec>>,
    opened: AtomicUsize,
    live_modules: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `spec` for any binary named `file_name`.
    pub fn with_plugin(self, file_name: &str, spec: MockSpec) -> Self {
        self.specs.lock().insert(file_name.to_string(), spec);
        self
    }

    /// Number of times a binary was opened.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// Modules opened and not yet dropped.
    pub fn live_modules(&self) -> usize {
        self.live_modules.load(Ordering::Acquire)
    }
}

impl LibraryBackend for MockBackend {
    fn open(&self, binary: &Path) -> Result<Box<dyn ModuleCode>, LoadError> {
        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let spec = self
            .specs
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| LoadError::EntryPointNotFound {
                path: binary.to_path_buf(),
            })?;
        self.opened.fetch_add(1, Ordering::AcqRel);
        self.live_modules.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockModule {
            spec,
            live_modules: Arc::clone(&self.live_modules),
        }))
    }
}
