//! A live plugin instance and its real-time processing path.
//!
//! All calls into the effect go through one per-instance lock. MIDI the
//! plugin sends back, and the time record it reads, have locks of their own
//! so the callback path never waits on a dispatch in progress.

use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::slice;

use arc_swap::ArcSwapOption;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::abi::{
    self, pin_flags, EffectOpcode, HostOpcode, VstEvents, VstPinProperties, VstTimeInfo,
    MAX_PROGRAM_NAME_LEN, TEXT_BUFFER_LEN,
};
use crate::config::host_config;
use crate::descriptor::{format_version, path_hash_id, PluginCategory, PluginDescriptor};
use crate::effect::{guarded, try_guarded, Effect, EffectKey, EffectLayout, Invocation};
use crate::error::{DispatchFailure, LoadError, LoadStage};
use crate::host::{self, native_call_depth, with_creation_session, AudioCallbackScope, HostCallback};
use crate::midi::{read_events, MidiEventVec, NativeEventList};
use crate::module::{ModuleHandle, ModuleLoader};
use crate::transport::{initial_time_info, update_time_info, PlayHead};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Effect created, not yet opened.
    Loaded,
    Initialized,
    Processing,
    Suspended,
    /// Effect closed; every call is a no-op.
    Closed,
}

impl LifecycleState {
    pub fn is_initialised(self) -> bool {
        matches!(self, Self::Initialized | Self::Processing | Self::Suspended)
    }
}

/// Notifications raised by the plugin through the host callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InstanceEvent {
    ParameterChanged { index: i32, value: f32 },
    BeginEdit(i32),
    EndEdit(i32),
    UpdateDisplay,
    SizeWindow { width: i32, height: i32 },
    IoChanged,
    LatencyChanged(i32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub index: usize,
    pub name: String,
    pub label: String,
    pub text: String,
    pub value: f32,
    pub automatable: bool,
}

/// Mutable state reachable only through the instance lock.
struct InstanceCore {
    effect: Box<dyn Effect>,
    state: LifecycleState,
    layout: EffectLayout,
    program_names: Vec<String>,
    /// Separate outputs for plugins without in-place processing.
    temp_outputs: Vec<Vec<f32>>,
    /// Stand-ins for channels the host buffer does not provide.
    scratch: Vec<Vec<f32>>,
    /// Host samples restored when in-place processing fails.
    backup: Vec<Vec<f32>>,
    events: NativeEventList,
}

impl InstanceCore {
    fn call(&mut self, call: Invocation) -> isize {
        let effect = &mut self.effect;
        guarded(DispatchFailure::Dispatch(call.opcode), 0, || unsafe {
            effect.dispatch(call)
        })
    }

    fn op(&mut self, opcode: EffectOpcode, index: i32, value: isize) -> isize {
        self.call(Invocation::new(opcode).index(index).value(value))
    }

    fn text(&mut self, opcode: EffectOpcode, index: i32) -> String {
        let mut buf = [0u8; TEXT_BUFFER_LEN];
        self.call(Invocation::new(opcode).index(index).ptr(buf.as_mut_ptr()));
        abi::text_from_buffer(&buf)
    }

    fn can_do(&mut self, what: &str) -> bool {
        let Ok(text) = CString::new(what) else {
            return false;
        };
        self.call(Invocation::new(EffectOpcode::CanDo).ptr(text.as_ptr() as *mut u8)) > 0
    }

    fn get_parameter(&mut self, index: i32) -> f32 {
        let effect = &mut self.effect;
        guarded(DispatchFailure::GetParameter(index), 0.0, || {
            effect.get_parameter(index)
        })
    }

    fn set_parameter(&mut self, index: i32, value: f32) {
        let effect = &mut self.effect;
        guarded(DispatchFailure::SetParameter(index), (), || {
            if effect.get_parameter(index) != value {
                effect.set_parameter(index, value);
            }
        })
    }

    fn current_program(&mut self) -> i32 {
        self.op(EffectOpcode::GetProgram, 0, 0) as i32
    }

    fn program_name_indexed(&mut self, index: i32) -> Option<String> {
        let mut buf = [0u8; TEXT_BUFFER_LEN];
        let call = Invocation::new(EffectOpcode::GetProgramNameIndexed)
            .index(index)
            .value(-1)
            .ptr(buf.as_mut_ptr());
        (self.call(call) != 0).then(|| abi::text_from_buffer(&buf))
    }

    fn refresh_program_names(&mut self) {
        let count = self.layout.num_programs.max(0);
        if count == 0 {
            self.program_names.clear();
            return;
        }
        let original = self.current_program();
        let mut switched = false;
        let mut names = Vec::with_capacity(count as usize);
        for index in 0..count {
            let name = match self.program_name_indexed(index) {
                Some(name) => name,
                None => {
                    self.op(EffectOpcode::SetProgram, 0, index as isize);
                    switched = true;
                    self.text(EffectOpcode::GetProgramName, 0)
                }
            };
            names.push(name);
        }
        if switched {
            self.op(EffectOpcode::SetProgram, 0, original as isize);
        }
        self.program_names = names;
    }

    fn allocate_buffers(&mut self, block_size: usize) {
        let frames = block_size.max(1);
        let outputs = self.layout.num_outputs.max(1) as usize;
        self.temp_outputs = vec![vec![0.0; frames]; outputs];
        self.scratch = vec![vec![0.0; frames]; self.layout.max_channels()];
        self.backup = vec![vec![0.0; frames]; self.layout.max_channels()];
    }

    fn ensure_capacity(&mut self, frames: usize) {
        let channels = self.layout.max_channels();
        let outputs = self.layout.num_outputs.max(1) as usize;
        let short = |bufs: &[Vec<f32>], n: usize| bufs.len() < n || bufs.iter().any(|b| b.len() < frames);
        if short(&self.scratch, channels)
            || short(&self.backup, channels)
            || short(&self.temp_outputs, outputs)
        {
            tracing::debug!(frames, "block larger than prepared, growing buffers");
            self.allocate_buffers(frames);
        }
    }

    /// Runs the effect over `frames` samples of `audio`. Returns the panic
    /// message if the effect failed, with `audio` as it was before the call.
    fn run_process(&mut self, audio: &mut [&mut [f32]], frames: usize) -> Result<(), String> {
        self.ensure_capacity(frames);
        let layout = self.layout;
        let channels = layout.max_channels();
        let InstanceCore {
            effect,
            scratch,
            backup,
            temp_outputs,
            ..
        } = self;

        if layout.can_replacing() {
            let used = audio.len().min(channels);
            for (saved, ch) in backup.iter_mut().zip(audio.iter()).take(used) {
                saved[..frames].copy_from_slice(&ch[..frames]);
            }
            let result = {
                let mut io: SmallVec<[&mut [f32]; 16]> = SmallVec::new();
                for ch in audio.iter_mut().take(channels) {
                    io.push(&mut ch[..frames]);
                }
                let missing = channels - io.len();
                for ch in scratch.iter_mut().take(missing) {
                    ch[..frames].fill(0.0);
                    io.push(&mut ch[..frames]);
                }
                try_guarded(|| effect.process_replacing(&mut io, frames))
            };
            if result.is_err() {
                for (ch, saved) in audio.iter_mut().zip(backup.iter()).take(used) {
                    ch[..frames].copy_from_slice(&saved[..frames]);
                }
            }
            return result;
        }

        let num_inputs = layout.num_inputs.max(0) as usize;
        let num_outputs = layout.num_outputs.max(0) as usize;
        let mut outs: SmallVec<[&mut [f32]; 16]> = temp_outputs
            .iter_mut()
            .take(num_outputs)
            .map(|ch| {
                ch[..frames].fill(0.0);
                &mut ch[..frames]
            })
            .collect();
        let result = {
            let mut ins: SmallVec<[&[f32]; 16]> = audio
                .iter()
                .take(num_inputs)
                .map(|ch| &ch[..frames])
                .collect();
            let missing = num_inputs - ins.len();
            for ch in scratch.iter_mut().take(missing) {
                ch[..frames].fill(0.0);
            }
            ins.extend(scratch.iter().take(missing).map(|ch| &ch[..frames]));
            try_guarded(|| effect.process(&ins, &mut outs, frames))
        };
        if result.is_ok() {
            for (dst, src) in audio.iter_mut().zip(outs.iter()) {
                dst[..frames].copy_from_slice(src);
            }
        }
        result
    }
}

/// Copies input channels into any extra output channels, leaving everything
/// else untouched.
fn pass_through(audio: &mut [&mut [f32]], layout: &EffectLayout, frames: usize) {
    let inputs = (layout.num_inputs.max(0) as usize).min(audio.len());
    if inputs == 0 {
        return;
    }
    let outputs = (layout.num_outputs.max(0) as usize).min(audio.len());
    for ch in inputs..outputs {
        let (src, dst) = audio.split_at_mut(ch);
        dst[0][..frames].copy_from_slice(&src[ch % inputs][..frames]);
    }
}

/// State shared between an instance, its editor and the host callback.
pub(crate) struct InstanceShared {
    key: EffectKey,
    path: PathBuf,
    shell_id: i32,
    module_name: String,
    directory: CString,
    core: Mutex<InstanceCore>,
    plugin_midi: Mutex<MidiEventVec>,
    time_info: Mutex<VstTimeInfo>,
    play_head: ArcSwapOption<Box<dyn PlayHead>>,
    events_tx: Sender<InstanceEvent>,
    events_rx: Receiver<InstanceEvent>,
    pending_resize: Mutex<Option<(i32, i32)>>,
    sample_rate_bits: AtomicU64,
    block_size: AtomicUsize,
    num_params: AtomicI32,
    num_programs: AtomicI32,
    num_inputs: AtomicI32,
    num_outputs: AtomicI32,
    latency: AtomicI32,
    wants_midi: AtomicBool,
    needs_idle: AtomicBool,
    names_dirty: AtomicBool,
    layout_dirty: AtomicBool,
    pub(crate) editor_attached: AtomicBool,
    pub(crate) editor_open: AtomicBool,
    in_editor_idle: AtomicBool,
    processing_faults: AtomicU64,
}

impl InstanceShared {
    fn sample_rate(&self) -> f64 {
        f64::from_bits(self.sample_rate_bits.load(Ordering::Acquire))
    }

    /// Publishes the layout's counts. Returns true when the latency moved.
    fn sync_layout(&self, layout: &EffectLayout) -> bool {
        self.num_params.store(layout.num_params.max(0), Ordering::Release);
        self.num_programs.store(layout.num_programs.max(0), Ordering::Release);
        self.num_inputs.store(layout.num_inputs.max(0), Ordering::Release);
        self.num_outputs.store(layout.num_outputs.max(0), Ordering::Release);
        let latency = layout.initial_delay.max(0);
        self.latency.swap(latency, Ordering::AcqRel) != latency
    }

    fn emit(&self, event: InstanceEvent) {
        if let Err(TrySendError::Full(event)) = self.events_tx.try_send(event) {
            tracing::trace!(?event, "instance event queue full, dropping");
        }
    }

    /// Runs `f` on the core unless the effect is closed.
    pub(crate) fn with_core<R>(&self, default: R, f: impl FnOnce(&mut InstanceCoreRef<'_>) -> R) -> R {
        let mut core = self.core.lock();
        if core.state == LifecycleState::Closed {
            return default;
        }
        f(&mut InstanceCoreRef(&mut core))
    }

    /// Like [`with_core`](Self::with_core) but gives up instead of waiting
    /// when the instance is busy.
    pub(crate) fn try_with_core<R>(&self, f: impl FnOnce(&mut InstanceCoreRef<'_>) -> R) -> Option<R> {
        let mut core = self.core.try_lock()?;
        if core.state == LifecycleState::Closed {
            return None;
        }
        Some(f(&mut InstanceCoreRef(&mut core)))
    }

    /// Editor and plugin idle, skipped when re-entered or when the instance
    /// is busy.
    pub(crate) fn run_idle(&self) {
        if self.in_editor_idle.swap(true, Ordering::AcqRel) {
            return;
        }
        let editor_open = self.editor_open.load(Ordering::Acquire);
        let needs_idle = self.needs_idle.load(Ordering::Acquire);
        self.try_with_core(|core| {
            if editor_open {
                core.dispatch(Invocation::new(EffectOpcode::EditIdle));
            }
            if needs_idle && core.dispatch(Invocation::new(EffectOpcode::Idle)) == 0 {
                self.needs_idle.store(false, Ordering::Release);
            }
        });
        self.in_editor_idle.store(false, Ordering::Release);
    }

    pub(crate) fn take_resize_request(&self) -> Option<(i32, i32)> {
        self.pending_resize.lock().take()
    }

    /// Answers callbacks that need this instance. `None` defers to the
    /// instance-independent answers.
    pub(crate) unsafe fn handle_callback(&self, opcode: HostOpcode, call: &Invocation) -> Option<isize> {
        match opcode {
            HostOpcode::Automate => {
                self.emit(InstanceEvent::ParameterChanged {
                    index: call.index,
                    value: call.opt,
                });
                Some(0)
            }
            HostOpcode::GetTime => Some(self.time_info.data_ptr() as isize),
            HostOpcode::ProcessEvents => {
                let mut incoming = self.plugin_midi.lock();
                read_events(call.ptr as *const VstEvents, &mut incoming);
                Some(1)
            }
            HostOpcode::WantMidi => {
                self.wants_midi.store(true, Ordering::Release);
                Some(1)
            }
            HostOpcode::NeedIdle => {
                self.needs_idle.store(true, Ordering::Release);
                Some(1)
            }
            HostOpcode::Idle => {
                if native_call_depth() == 0 {
                    self.run_idle();
                } else {
                    tracing::trace!("idle request from inside plugin code suppressed");
                }
                Some(0)
            }
            HostOpcode::IoChanged => {
                self.layout_dirty.store(true, Ordering::Release);
                self.emit(InstanceEvent::IoChanged);
                Some(1)
            }
            HostOpcode::SizeWindow => {
                let (width, height) = (call.index, call.value as i32);
                *self.pending_resize.lock() = Some((width, height));
                self.emit(InstanceEvent::SizeWindow { width, height });
                Some(1)
            }
            HostOpcode::GetSampleRate => {
                let rate = self.sample_rate();
                (rate > 0.0).then_some(rate as isize)
            }
            HostOpcode::GetBlockSize => {
                let size = self.block_size.load(Ordering::Acquire);
                (size > 0).then_some(size as isize)
            }
            HostOpcode::UpdateDisplay => {
                self.names_dirty.store(true, Ordering::Release);
                self.emit(InstanceEvent::UpdateDisplay);
                Some(1)
            }
            HostOpcode::BeginEdit => {
                self.emit(InstanceEvent::BeginEdit(call.index));
                Some(0)
            }
            HostOpcode::EndEdit => {
                self.emit(InstanceEvent::EndEdit(call.index));
                Some(0)
            }
            HostOpcode::GetDirectory => {
                (!self.directory.as_bytes().is_empty()).then(|| self.directory.as_ptr() as isize)
            }
            HostOpcode::PinConnected => {
                let pins = if call.value == 0 {
                    self.num_inputs.load(Ordering::Acquire)
                } else {
                    self.num_outputs.load(Ordering::Acquire)
                };
                Some(isize::from(call.index >= pins))
            }
            _ => None,
        }
    }
}

/// Borrowed access to the locked core, handed out to the editor bridge.
pub(crate) struct InstanceCoreRef<'a>(&'a mut InstanceCore);

impl InstanceCoreRef<'_> {
    pub(crate) fn dispatch(&mut self, call: Invocation) -> isize {
        self.0.call(call)
    }

    pub(crate) fn current_program(&mut self) -> i32 {
        self.0.current_program()
    }
}

/// One live effect created from a [`ModuleHandle`].
///
/// Methods take `&self`; the instance can be shared between the audio thread
/// and a control thread.
pub struct PluginInstance {
    shared: Arc<InstanceShared>,
    // Dropped after `shared` so the effect is closed before its code unloads.
    module: Arc<ModuleHandle>,
}

impl PluginInstance {
    /// Calls the module's entry point and registers the new effect. The
    /// result is in the `Loaded` state.
    pub fn create(module: Arc<ModuleHandle>, shell_id: i32) -> Result<Self, LoadError> {
        let path = module.path().to_path_buf();
        let created = try_guarded(|| {
            with_creation_session(shell_id, || module.code().create_effect(HostCallback))
        });
        let effect = match created {
            Ok(result) => result?,
            Err(message) => {
                tracing::warn!(path = %path.display(), "entry point panicked: {message}");
                return Err(LoadError::Panicked {
                    path,
                    stage: LoadStage::Instantiation,
                });
            }
        };

        let layout = effect.layout();
        let key = effect.key();
        let config = host_config();
        let (events_tx, events_rx) = crossbeam_channel::bounded(config.event_channel_capacity);

        let shared = Arc::new(InstanceShared {
            key,
            path,
            shell_id,
            module_name: module.name().to_string(),
            directory: module.directory().clone(),
            core: Mutex::new(InstanceCore {
                effect,
                state: LifecycleState::Loaded,
                layout,
                program_names: Vec::new(),
                temp_outputs: Vec::new(),
                scratch: Vec::new(),
                backup: Vec::new(),
                events: NativeEventList::new(),
            }),
            plugin_midi: Mutex::new(MidiEventVec::new()),
            time_info: Mutex::new(initial_time_info(config.default_sample_rate)),
            play_head: ArcSwapOption::empty(),
            events_tx,
            events_rx,
            pending_resize: Mutex::new(None),
            sample_rate_bits: AtomicU64::new(0f64.to_bits()),
            block_size: AtomicUsize::new(0),
            num_params: AtomicI32::new(0),
            num_programs: AtomicI32::new(0),
            num_inputs: AtomicI32::new(0),
            num_outputs: AtomicI32::new(0),
            latency: AtomicI32::new(0),
            wants_midi: AtomicBool::new(false),
            needs_idle: AtomicBool::new(false),
            names_dirty: AtomicBool::new(false),
            layout_dirty: AtomicBool::new(false),
            editor_attached: AtomicBool::new(false),
            editor_open: AtomicBool::new(false),
            in_editor_idle: AtomicBool::new(false),
            processing_faults: AtomicU64::new(0),
        });
        shared.sync_layout(&layout);
        host::register(key, &shared);
        tracing::debug!(
            path = %shared.path.display(),
            shell_id,
            params = layout.num_params,
            "created effect"
        );

        Ok(Self { shared, module })
    }

    /// Creates and initialises an effect from `module`.
    pub fn open(module: Arc<ModuleHandle>, shell_id: i32) -> Result<Self, LoadError> {
        let path = module.path().to_path_buf();
        let instance = Self::create(module, shell_id)?;
        instance.initialise();
        if instance.state() == LifecycleState::Loaded {
            return Err(LoadError::Failed {
                path,
                stage: LoadStage::Initialization,
                reason: "effect could not be opened".into(),
            });
        }
        Ok(instance)
    }

    /// Creates and initialises an instance of the plugin at `path`.
    pub fn load(loader: &ModuleLoader, path: &Path, shell_id: i32) -> Result<Self, LoadError> {
        Self::open(loader.find_or_create_module(path)?, shell_id)
    }

    pub(crate) fn shared(&self) -> &Arc<InstanceShared> {
        &self.shared
    }

    pub fn module(&self) -> &Arc<ModuleHandle> {
        &self.module
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn key(&self) -> EffectKey {
        self.shared.key
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.core.lock().state
    }

    // -- lifecycle ----------------------------------------------------------

    /// Opens the effect. Does nothing once initialised.
    pub fn initialise(&self) {
        let shared = &*self.shared;
        let mut core = shared.core.lock();
        if core.state != LifecycleState::Loaded {
            return;
        }

        let opened = with_creation_session(shared.shell_id, || {
            core.op(EffectOpcode::Identify, 0, 0);

            let rate = shared.sample_rate();
            if rate > 0.0 {
                core.call(Invocation::new(EffectOpcode::SetSampleRate).opt(rate as f32));
            }
            let block = shared.block_size.load(Ordering::Acquire);
            if block > 0 {
                core.op(EffectOpcode::SetBlockSize, 0, block.max(32) as isize);
            }

            let effect = &mut core.effect;
            let opened = try_guarded(|| unsafe { effect.dispatch(Invocation::new(EffectOpcode::Open)) });
            if let Err(message) = &opened {
                tracing::warn!(path = %shared.path.display(), "effect open panicked: {message}");
                return false;
            }

            core.layout = core.effect.layout();
            shared.sync_layout(&core.layout);

            core.op(EffectOpcode::SetProgram, 0, 0);
            for pin in 0..core.layout.num_inputs.max(0) {
                core.op(EffectOpcode::ConnectInput, pin, 1);
            }
            for pin in 0..core.layout.num_outputs.max(0) {
                core.op(EffectOpcode::ConnectOutput, pin, 1);
            }
            core.refresh_program_names();

            let wants_midi = core.layout.is_synth() || core.can_do("receiveVstMidiEvent");
            shared.wants_midi.fetch_or(wants_midi, Ordering::AcqRel);
            true
        });

        if opened {
            core.state = LifecycleState::Initialized;
            tracing::debug!(path = %shared.path.display(), "effect initialised");
        }
    }

    /// Readies the effect for streaming at the given rate and maximum block
    /// size.
    pub fn prepare(&self, sample_rate: f64, block_size: usize) {
        let shared = &*self.shared;
        shared
            .sample_rate_bits
            .store(sample_rate.to_bits(), Ordering::Release);
        shared.block_size.store(block_size, Ordering::Release);
        *shared.time_info.lock() = initial_time_info(sample_rate);

        self.initialise();

        let mut core = shared.core.lock();
        if !core.state.is_initialised() {
            return;
        }

        core.layout = core.effect.layout();
        if shared.sync_layout(&core.layout) {
            shared.emit(InstanceEvent::LatencyChanged(core.layout.initial_delay.max(0)));
        }
        shared.layout_dirty.store(false, Ordering::Release);
        if core.can_do("receiveVstMidiEvent") {
            shared.wants_midi.store(true, Ordering::Release);
        }
        shared.plugin_midi.lock().clear();

        core.call(Invocation::new(EffectOpcode::SetSampleRate).opt(sample_rate as f32));
        core.op(EffectOpcode::SetBlockSize, 0, block_size.max(16) as isize);
        core.allocate_buffers(block_size);

        if core.state != LifecycleState::Processing {
            core.op(EffectOpcode::MainsChanged, 0, 1);

            // Editor-less plugins often refresh internal state only on a
            // parameter write.
            if !core.layout.has_editor() && core.layout.num_params > 0 {
                let old = core.get_parameter(0);
                core.set_parameter(0, if old < 0.5 { 1.0 } else { 0.0 });
                core.set_parameter(0, old);
            }

            core.op(EffectOpcode::StartProcess, 0, 0);
            core.state = LifecycleState::Processing;
        }
        tracing::debug!(sample_rate, block_size, "effect prepared");
    }

    /// Stops streaming and frees working buffers.
    pub fn release(&self) {
        let mut core = self.shared.core.lock();
        if core.state == LifecycleState::Processing {
            core.op(EffectOpcode::StopProcess, 0, 0);
            core.op(EffectOpcode::MainsChanged, 0, 0);
            core.state = LifecycleState::Suspended;
            tracing::debug!(path = %self.shared.path.display(), "effect suspended");
        }
        core.temp_outputs = Vec::new();
        core.scratch = Vec::new();
        core.backup = Vec::new();
        drop(core);
        self.shared.plugin_midi.lock().clear();
    }

    // -- processing ---------------------------------------------------------

    /// Processes one block in place.
    ///
    /// `audio` holds one slice per channel; `midi` carries the block's input
    /// events in and the plugin's output events out.
    pub fn process_block(&self, audio: &mut [&mut [f32]], midi: &mut MidiEventVec) {
        let shared = &*self.shared;
        let frames = audio.iter().map(|ch| ch.len()).min().unwrap_or(0);
        let _scope = AudioCallbackScope::enter();

        {
            let mut guard = shared.core.lock();
            let core = &mut *guard;

            if !core.state.is_initialised() {
                pass_through(audio, &core.layout, frames);
            } else {
                let transport = shared
                    .play_head
                    .load_full()
                    .and_then(|head| head.current_position());
                update_time_info(
                    &mut shared.time_info.lock(),
                    transport.as_ref(),
                    shared.sample_rate(),
                );

                if shared.wants_midi.load(Ordering::Acquire)
                    && core.events.fill_block(midi, frames) > 0
                {
                    let list = core.events.as_mut_ptr();
                    core.call(Invocation::new(EffectOpcode::ProcessEvents).ptr(list));
                }

                if let Err(message) = core.run_process(audio, frames) {
                    let faults = shared.processing_faults.fetch_add(1, Ordering::AcqRel);
                    if faults == 0 {
                        tracing::warn!(
                            path = %shared.path.display(),
                            "{}: {message}",
                            DispatchFailure::Process
                        );
                    }
                    pass_through(audio, &core.layout, frames);
                }
            }
        }

        midi.clear();
        let mut incoming = shared.plugin_midi.lock();
        midi.extend(incoming.drain(..));
    }

    /// Number of blocks in which the plugin failed while processing.
    pub fn processing_faults(&self) -> u64 {
        self.shared.processing_faults.load(Ordering::Acquire)
    }

    pub fn set_play_head(&self, play_head: Option<Box<dyn PlayHead>>) {
        self.shared.play_head.store(play_head.map(Arc::new));
    }

    // -- parameters ---------------------------------------------------------

    pub fn num_parameters(&self) -> usize {
        self.shared.num_params.load(Ordering::Acquire) as usize
    }

    /// Normalised value, or 0 for an index out of range.
    pub fn get_parameter(&self, index: usize) -> f32 {
        if index >= self.num_parameters() {
            return 0.0;
        }
        self.shared
            .with_core(0.0, |core| core.0.get_parameter(index as i32))
    }

    /// Ignored for an index out of range.
    pub fn set_parameter(&self, index: usize, value: f32) {
        if index >= self.num_parameters() {
            return;
        }
        self.shared
            .with_core((), |core| core.0.set_parameter(index as i32, value));
    }

    fn parameter_string(&self, opcode: EffectOpcode, index: usize) -> String {
        if index >= self.num_parameters() {
            return String::new();
        }
        self.shared
            .with_core(String::new(), |core| core.0.text(opcode, index as i32))
    }

    pub fn parameter_name(&self, index: usize) -> String {
        self.parameter_string(EffectOpcode::GetParamName, index)
    }

    pub fn parameter_label(&self, index: usize) -> String {
        self.parameter_string(EffectOpcode::GetParamLabel, index)
    }

    /// The plugin's own rendering of the current value.
    pub fn parameter_text(&self, index: usize) -> String {
        self.parameter_string(EffectOpcode::GetParamDisplay, index)
    }

    pub fn is_parameter_automatable(&self, index: usize) -> bool {
        if index >= self.num_parameters() {
            return false;
        }
        self.shared.with_core(false, |core| {
            core.0.op(EffectOpcode::CanBeAutomated, index as i32, 0) != 0
        })
    }

    pub fn parameters(&self) -> Vec<ParameterInfo> {
        (0..self.num_parameters())
            .map(|index| ParameterInfo {
                index,
                name: self.parameter_name(index),
                label: self.parameter_label(index),
                text: self.parameter_text(index),
                value: self.get_parameter(index),
                automatable: self.is_parameter_automatable(index),
            })
            .collect()
    }

    // -- programs -----------------------------------------------------------

    pub fn num_programs(&self) -> usize {
        self.shared.num_programs.load(Ordering::Acquire) as usize
    }

    pub fn current_program(&self) -> usize {
        self.shared
            .with_core(0, |core| core.0.current_program().max(0) as usize)
    }

    /// Selects a program, clamping the index into range.
    pub fn set_current_program(&self, index: usize) {
        let count = self.num_programs();
        if count == 0 {
            return;
        }
        let index = index.min(count - 1) as isize;
        self.shared.with_core((), |core| {
            if core.0.current_program() as isize != index {
                core.0.op(EffectOpcode::SetProgram, 0, index);
            }
        });
    }

    pub fn current_program_name(&self) -> String {
        if self.num_programs() == 0 {
            return String::new();
        }
        self.shared.with_core(String::new(), |core| {
            core.0.text(EffectOpcode::GetProgramName, 0)
        })
    }

    pub fn program_name(&self, index: usize) -> String {
        if index >= self.num_programs() {
            return String::new();
        }
        if index == self.current_program() {
            return self.current_program_name();
        }
        self.program_names().get(index).cloned().unwrap_or_default()
    }

    pub fn program_names(&self) -> Vec<String> {
        let dirty = self.shared.names_dirty.swap(false, Ordering::AcqRel);
        self.shared.with_core(Vec::new(), |core| {
            if dirty || core.0.program_names.len() != core.0.layout.num_programs.max(0) as usize {
                core.0.refresh_program_names();
            }
            core.0.program_names.clone()
        })
    }

    /// Renames the current program. Other indices are ignored.
    pub fn change_program_name(&self, index: usize, name: &str) {
        if self.num_programs() == 0 || index != self.current_program() {
            return;
        }
        let name: String = name.chars().take(MAX_PROGRAM_NAME_LEN).collect();
        if name == self.current_program_name() {
            return;
        }
        let Ok(text) = CString::new(name) else {
            return;
        };
        self.shared.with_core((), |core| {
            core.0.call(
                Invocation::new(EffectOpcode::SetProgramName).ptr(text.as_ptr() as *mut u8),
            );
            core.0.refresh_program_names();
        });
    }

    // -- chunks -------------------------------------------------------------

    pub fn uses_chunks(&self) -> bool {
        self.shared
            .with_core(false, |core| core.0.layout.uses_chunks())
    }

    /// The plugin's opaque state: the current program when `preset` is set,
    /// otherwise the whole bank.
    pub fn get_chunk(&self, preset: bool) -> Vec<u8> {
        let limit = host_config().max_chunk_size;
        self.shared.with_core(Vec::new(), |core| {
            if !core.0.layout.uses_chunks() {
                return Vec::new();
            }
            let mut data: *mut c_void = std::ptr::null_mut();
            let call = Invocation::new(EffectOpcode::GetChunk)
                .index(i32::from(preset))
                .ptr(&mut data as *mut *mut c_void);
            let size = core.0.call(call);
            if data.is_null() || size <= 0 {
                return Vec::new();
            }
            let size = size as usize;
            if size > limit {
                tracing::warn!(size, limit, "plugin chunk exceeds limit, ignored");
                return Vec::new();
            }
            // SAFETY: the plugin owns `size` bytes at `data` until its next call.
            unsafe { slice::from_raw_parts(data as *const u8, size) }.to_vec()
        })
    }

    /// Hands opaque state back to the plugin. Returns false when the plugin
    /// has no chunk support or the data is unusable.
    pub fn set_chunk(&self, preset: bool, data: &[u8]) -> bool {
        if data.is_empty() || data.len() > host_config().max_chunk_size {
            return false;
        }
        self.shared.with_core(false, |core| {
            if !core.0.layout.uses_chunks() {
                return false;
            }
            let call = Invocation::new(EffectOpcode::SetChunk)
                .index(i32::from(preset))
                .value(data.len() as isize)
                .ptr(data.as_ptr() as *mut u8);
            core.0.call(call);
            if !preset {
                core.0.refresh_program_names();
            }
            true
        })
    }

    // -- description --------------------------------------------------------

    pub fn layout(&self) -> EffectLayout {
        self.shared.with_core(EffectLayout::default(), |core| core.0.layout)
    }

    /// Re-reads channel counts and latency after the plugin reported an IO
    /// change.
    pub fn refresh_layout(&self) {
        let latency_moved = self.shared.with_core(false, |core| {
            core.0.layout = core.0.effect.layout();
            self.shared.sync_layout(&core.0.layout)
        });
        self.shared.layout_dirty.store(false, Ordering::Release);
        if latency_moved {
            let samples = self.shared.latency.load(Ordering::Acquire);
            self.shared.emit(InstanceEvent::LatencyChanged(samples));
        }
    }

    pub fn layout_changed(&self) -> bool {
        self.shared.layout_dirty.load(Ordering::Acquire)
    }

    pub fn name(&self) -> String {
        let name = self.shared.with_core(String::new(), |core| {
            let name = core.0.text(EffectOpcode::GetEffectName, 0);
            if name.is_empty() {
                core.0.text(EffectOpcode::GetProductString, 0)
            } else {
                name
            }
        });
        if name.is_empty() {
            self.shared.module_name.clone()
        } else {
            name
        }
    }

    pub fn vendor(&self) -> String {
        self.shared.with_core(String::new(), |core| {
            core.0.text(EffectOpcode::GetVendorString, 0)
        })
    }

    pub fn product(&self) -> String {
        self.shared.with_core(String::new(), |core| {
            core.0.text(EffectOpcode::GetProductString, 0)
        })
    }

    pub fn version_number(&self) -> i32 {
        self.layout().version
    }

    /// Vendor version as `"V1.2.3"`, falling back to the record's version.
    pub fn version_string(&self) -> String {
        let vendor_version = self.shared.with_core(0, |core| {
            core.0.op(EffectOpcode::GetVendorVersion, 0, 0) as i32
        });
        let packed = if vendor_version == 0 || vendor_version == -1 {
            self.version_number()
        } else {
            vendor_version
        };
        format_version(packed)
    }

    pub fn category(&self) -> PluginCategory {
        self.shared.with_core(PluginCategory::Unknown, |core| {
            PluginCategory::from_raw(core.0.op(EffectOpcode::GetPlugCategory, 0, 0))
        })
    }

    /// Reported identifier, or a hash of the file path when the plugin
    /// reports none.
    pub fn unique_id(&self) -> i32 {
        match self.layout().unique_id {
            0 => path_hash_id(&self.shared.path),
            id => id,
        }
    }

    pub fn shell_id(&self) -> i32 {
        self.shared.shell_id
    }

    pub fn num_inputs(&self) -> usize {
        self.shared.num_inputs.load(Ordering::Acquire) as usize
    }

    pub fn num_outputs(&self) -> usize {
        self.shared.num_outputs.load(Ordering::Acquire) as usize
    }

    pub fn accepts_midi(&self) -> bool {
        self.shared.wants_midi.load(Ordering::Acquire)
    }

    pub fn produces_midi(&self) -> bool {
        self.shared
            .with_core(false, |core| core.0.can_do("sendVstMidiEvent"))
    }

    pub fn has_editor(&self) -> bool {
        self.layout().has_editor()
    }

    pub fn latency_samples(&self) -> usize {
        self.shared.latency.load(Ordering::Acquire) as usize
    }

    pub fn tail_samples(&self) -> usize {
        self.shared.with_core(0, |core| {
            core.0.op(EffectOpcode::GetTailSize, 0, 0).max(0) as usize
        })
    }

    fn pin_properties(&self, opcode: EffectOpcode, index: usize) -> Option<VstPinProperties> {
        self.shared.with_core(None, |core| {
            let mut props = VstPinProperties::default();
            let call = Invocation::new(opcode)
                .index(index as i32)
                .ptr(&mut props as *mut VstPinProperties);
            (core.0.call(call) != 0).then_some(props)
        })
    }

    pub fn input_channel_name(&self, index: usize) -> String {
        if index >= self.num_inputs() {
            return String::new();
        }
        self.pin_properties(EffectOpcode::GetInputProperties, index)
            .map(|p| abi::text_from_chars(&p.label))
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| format!("Input {}", index + 1))
    }

    pub fn output_channel_name(&self, index: usize) -> String {
        if index >= self.num_outputs() {
            return String::new();
        }
        self.pin_properties(EffectOpcode::GetOutputProperties, index)
            .map(|p| abi::text_from_chars(&p.label))
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| format!("Output {}", index + 1))
    }

    pub fn is_input_stereo_pair(&self, index: usize) -> bool {
        index < self.num_inputs()
            && self
                .pin_properties(EffectOpcode::GetInputProperties, index)
                .map_or(true, |p| p.flags & pin_flags::IS_STEREO != 0)
    }

    pub fn is_output_stereo_pair(&self, index: usize) -> bool {
        index < self.num_outputs()
            && self
                .pin_properties(EffectOpcode::GetOutputProperties, index)
                .map_or(true, |p| p.flags & pin_flags::IS_STEREO != 0)
    }

    pub fn fill_description(&self, desc: &mut PluginDescriptor) {
        let layout = self.layout();
        desc.name = self.name();
        desc.path = self.shared.path.clone();
        desc.unique_id = self.unique_id();
        desc.format = "VST".to_string();
        desc.category = self.category();
        desc.manufacturer = self.vendor();
        desc.version = self.version_string();
        desc.num_inputs = layout.num_inputs.max(0) as usize;
        desc.num_outputs = layout.num_outputs.max(0) as usize;
        desc.is_instrument = layout.is_synth();
        desc.accepts_midi = self.accepts_midi();
        desc.produces_midi = self.produces_midi();
        desc.has_editor = layout.has_editor();
        desc.latency_samples = layout.initial_delay.max(0) as usize;
        desc.last_modified = std::fs::metadata(&self.shared.path)
            .and_then(|m| m.modified())
            .ok();
    }

    pub fn describe(&self) -> PluginDescriptor {
        let mut desc = PluginDescriptor::new("", self.shared.path.clone(), 0);
        self.fill_description(&mut desc);
        desc
    }

    // -- control thread -----------------------------------------------------

    /// Receiver for notifications the plugin raises.
    pub fn events(&self) -> Receiver<InstanceEvent> {
        self.shared.events_rx.clone()
    }

    /// Periodic control-thread tick for plugins that asked for idle time.
    pub fn idle(&self) {
        if self.shared.needs_idle.load(Ordering::Acquire) {
            self.shared.run_idle();
        }
    }

    pub fn needs_idle(&self) -> bool {
        self.shared.needs_idle.load(Ordering::Acquire)
    }

    /// Raw dispatch for opcodes without a typed wrapper.
    ///
    /// # Safety
    /// `call.ptr` must satisfy the contract of `call.opcode`.
    pub unsafe fn dispatch(&self, call: Invocation) -> isize {
        self.shared.with_core(0, |core| core.dispatch(call))
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        let shared = &*self.shared;
        debug_assert!(
            !shared.editor_attached.load(Ordering::Acquire),
            "plugin instance dropped while its editor is attached"
        );
        if shared.editor_attached.load(Ordering::Acquire) {
            tracing::warn!(path = %shared.path.display(), "instance dropped with editor attached");
        }

        {
            let mut core = shared.core.lock();
            if core.state == LifecycleState::Processing {
                core.op(EffectOpcode::StopProcess, 0, 0);
                core.op(EffectOpcode::MainsChanged, 0, 0);
            }
            if core.state != LifecycleState::Closed {
                core.op(EffectOpcode::Close, 0, 0);
                core.state = LifecycleState::Closed;
            }
        }
        host::deregister(shared.key);
        tracing::debug!(path = %shared.path.display(), "effect closed");
    }
}
