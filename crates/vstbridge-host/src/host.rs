//! The callback side of the bridge: what a plugin reaches when it calls the
//! host.
//!
//! Calls arrive either through [`audio_master`] (native modules) or through
//! [`HostCallback`] (in-process effects). Both end up in one dispatcher that
//! first tries the calling instance, found through a registry keyed by the
//! effect's identity, and then falls back to answers that need no instance.
//!
//! Two pieces of ambient state live here:
//!
//! - a process-wide depth counter of calls currently inside plugin code,
//!   maintained by [`NativeCallGuard`], used to refuse idle re-entry;
//! - a thread-local creation session carrying the shell sub-plugin id that
//!   `CurrentId` must report while an entry point is running.

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::RwLock;

use crate::abi::{self, AEffect, HostOpcode, VstTimeInfo};
use crate::config::host_config;
use crate::effect::{EffectKey, Invocation};
use crate::instance::InstanceShared;
use crate::midi::{MidiEvent, NativeEventList};

/// Capabilities answered `1` to `CanDo`.
pub const HOST_CAPABILITIES: &[&str] = &[
    "sendVstEvents",
    "sendVstMidiEvent",
    "sendVstTimeInfo",
    "receiveVstEvents",
    "receiveVstMidiEvent",
    "supplyIdle",
    "sizeWindow",
    "startStopProcess",
    "shellCategory",
    "supportShell",
];

// ---------------------------------------------------------------------------
// Reentrancy
// ---------------------------------------------------------------------------

static NATIVE_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Counts one call into plugin code for as long as it lives.
pub struct NativeCallGuard(());

impl NativeCallGuard {
    pub fn enter() -> Self {
        NATIVE_DEPTH.fetch_add(1, Ordering::AcqRel);
        Self(())
    }
}

impl Drop for NativeCallGuard {
    fn drop(&mut self) {
        NATIVE_DEPTH.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Number of calls currently executing inside plugin code, process-wide.
pub fn native_call_depth() -> usize {
    NATIVE_DEPTH.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// Per-thread call context
// ---------------------------------------------------------------------------

thread_local! {
    static SHELL_ID: Cell<i32> = const { Cell::new(0) };
    static IN_AUDIO_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

struct RestoreShellId(i32);

impl Drop for RestoreShellId {
    fn drop(&mut self) {
        SHELL_ID.with(|id| id.set(self.0));
    }
}

/// Runs `f` with `shell_id` answered to `CurrentId` on this thread.
pub fn with_creation_session<R>(shell_id: i32, f: impl FnOnce() -> R) -> R {
    let previous = SHELL_ID.with(|id| id.replace(shell_id));
    let _restore = RestoreShellId(previous);
    f()
}

pub fn current_shell_id() -> i32 {
    SHELL_ID.with(Cell::get)
}

/// Marks the current thread as running a processing block.
pub(crate) struct AudioCallbackScope(bool);

impl AudioCallbackScope {
    pub(crate) fn enter() -> Self {
        Self(IN_AUDIO_CALLBACK.with(|flag| flag.replace(true)))
    }
}

impl Drop for AudioCallbackScope {
    fn drop(&mut self) {
        IN_AUDIO_CALLBACK.with(|flag| flag.set(self.0));
    }
}

fn in_audio_callback() -> bool {
    IN_AUDIO_CALLBACK.with(Cell::get)
}

// ---------------------------------------------------------------------------
// Instance registry
// ---------------------------------------------------------------------------

static REGISTRY: LazyLock<RwLock<HashMap<EffectKey, Weak<InstanceShared>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

pub(crate) fn register(key: EffectKey, shared: &Arc<InstanceShared>) {
    REGISTRY.write().insert(key, Arc::downgrade(shared));
}

pub(crate) fn deregister(key: EffectKey) {
    REGISTRY.write().remove(&key);
}

fn lookup(key: EffectKey) -> Option<Arc<InstanceShared>> {
    REGISTRY.read().get(&key).and_then(Weak::upgrade)
}

pub fn registered_instances() -> usize {
    REGISTRY.read().values().filter(|w| w.strong_count() > 0).count()
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// The callback handed to native entry points.
pub extern "C" fn audio_master(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize {
    let from = (!effect.is_null()).then(|| EffectKey::from_ptr(effect));
    let call = Invocation {
        opcode,
        index,
        value,
        ptr,
        opt,
    };
    panic::catch_unwind(AssertUnwindSafe(|| unsafe { handle(from, call) })).unwrap_or(0)
}

/// Handle through which in-process effects reach the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCallback;

impl HostCallback {
    pub fn proc_ptr(&self) -> abi::HostCallbackProc {
        audio_master
    }

    /// Raw dispatch, exactly as a native module would call it.
    ///
    /// # Safety
    /// `call.ptr` must satisfy the contract of `call.opcode`.
    pub unsafe fn dispatch(&self, from: Option<EffectKey>, call: Invocation) -> isize {
        panic::catch_unwind(AssertUnwindSafe(|| handle(from, call))).unwrap_or(0)
    }

    fn simple(&self, from: Option<EffectKey>, call: Invocation) -> isize {
        debug_assert!(call.ptr.is_null());
        unsafe { self.dispatch(from, call) }
    }

    pub fn version(&self) -> isize {
        self.simple(None, Invocation::host(HostOpcode::Version))
    }

    pub fn current_id(&self) -> i32 {
        self.simple(None, Invocation::host(HostOpcode::CurrentId)) as i32
    }

    pub fn automate(&self, from: EffectKey, index: i32, value: f32) {
        self.simple(
            Some(from),
            Invocation::host(HostOpcode::Automate).index(index).opt(value),
        );
    }

    pub fn begin_edit(&self, from: EffectKey, index: i32) {
        self.simple(Some(from), Invocation::host(HostOpcode::BeginEdit).index(index));
    }

    pub fn end_edit(&self, from: EffectKey, index: i32) {
        self.simple(Some(from), Invocation::host(HostOpcode::EndEdit).index(index));
    }

    pub fn wants_midi(&self, from: EffectKey) {
        self.simple(Some(from), Invocation::host(HostOpcode::WantMidi).value(1));
    }

    pub fn need_idle(&self, from: EffectKey) {
        self.simple(Some(from), Invocation::host(HostOpcode::NeedIdle));
    }

    pub fn idle(&self, from: EffectKey) {
        self.simple(Some(from), Invocation::host(HostOpcode::Idle));
    }

    pub fn io_changed(&self, from: EffectKey) -> bool {
        self.simple(Some(from), Invocation::host(HostOpcode::IoChanged)) != 0
    }

    pub fn size_window(&self, from: EffectKey, width: i32, height: i32) -> bool {
        let call = Invocation::host(HostOpcode::SizeWindow)
            .index(width)
            .value(height as isize);
        self.simple(Some(from), call) != 0
    }

    pub fn sample_rate(&self, from: Option<EffectKey>) -> f64 {
        self.simple(from, Invocation::host(HostOpcode::GetSampleRate)) as f64
    }

    pub fn block_size(&self, from: Option<EffectKey>) -> usize {
        self.simple(from, Invocation::host(HostOpcode::GetBlockSize)).max(0) as usize
    }

    pub fn process_level(&self, from: Option<EffectKey>) -> isize {
        self.simple(from, Invocation::host(HostOpcode::GetCurrentProcessLevel))
    }

    pub fn time_info(&self, from: EffectKey) -> Option<VstTimeInfo> {
        let ptr = self.simple(Some(from), Invocation::host(HostOpcode::GetTime))
            as *const VstTimeInfo;
        // SAFETY: a non-null answer points at the instance's time record.
        (!ptr.is_null()).then(|| unsafe { *ptr })
    }

    pub fn directory(&self, from: EffectKey) -> Option<String> {
        let ptr = self.simple(Some(from), Invocation::host(HostOpcode::GetDirectory))
            as *const c_char;
        if ptr.is_null() {
            return None;
        }
        // SAFETY: the host answers with the module's NUL-terminated directory.
        Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
    }

    pub fn can_do(&self, from: Option<EffectKey>, what: &str) -> bool {
        let Ok(text) = std::ffi::CString::new(what) else {
            return false;
        };
        let call = Invocation::host(HostOpcode::CanDo).ptr(text.as_ptr() as *mut c_char);
        unsafe { self.dispatch(from, call) > 0 }
    }

    pub fn vendor_string(&self) -> String {
        let mut buf = [0u8; 64];
        let call = Invocation::host(HostOpcode::GetVendorString).ptr(buf.as_mut_ptr());
        unsafe { self.dispatch(None, call) };
        abi::text_from_buffer(&buf)
    }

    pub fn product_string(&self) -> String {
        let mut buf = [0u8; 64];
        let call = Invocation::host(HostOpcode::GetProductString).ptr(buf.as_mut_ptr());
        unsafe { self.dispatch(None, call) };
        abi::text_from_buffer(&buf)
    }

    /// Sends plugin-generated MIDI to the host.
    pub fn send_midi(&self, from: EffectKey, events: &[MidiEvent]) {
        let mut list = NativeEventList::new();
        list.fill(events);
        let call = Invocation::host(HostOpcode::ProcessEvents).ptr(list.as_mut_ptr());
        unsafe { self.dispatch(Some(from), call) };
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

unsafe fn handle(from: Option<EffectKey>, call: Invocation) -> isize {
    let Some(opcode) = call.host_opcode() else {
        tracing::trace!(opcode = call.opcode, "unhandled host opcode");
        return 0;
    };

    if let Some(shared) = from.and_then(lookup) {
        if let Some(answer) = shared.handle_callback(opcode, &call) {
            return answer;
        }
    }

    general(opcode, &call)
}

/// Answers that need no instance context.
unsafe fn general(opcode: HostOpcode, call: &Invocation) -> isize {
    match opcode {
        HostOpcode::Version => abi::HOST_ABI_VERSION,
        HostOpcode::CurrentId => current_shell_id() as isize,
        HostOpcode::Idle => 0,
        HostOpcode::CanDo => {
            if call.ptr.is_null() {
                return 0;
            }
            let what = CStr::from_ptr(call.ptr as *const c_char).to_string_lossy();
            isize::from(HOST_CAPABILITIES.contains(&what.as_ref()))
        }
        HostOpcode::GetVendorString => {
            abi::write_text(call.ptr.cast(), 64, &host_config().vendor_name);
            1
        }
        HostOpcode::GetProductString => {
            abi::write_text(call.ptr.cast(), 64, &host_config().product_name);
            1
        }
        HostOpcode::GetVendorVersion => host_config().vendor_version as isize,
        HostOpcode::GetSampleRate => host_config().default_sample_rate as isize,
        HostOpcode::GetBlockSize => host_config().default_block_size as isize,
        HostOpcode::GetCurrentProcessLevel => {
            if in_audio_callback() {
                abi::process_level::REALTIME
            } else {
                abi::process_level::USER
            }
        }
        HostOpcode::GetAutomationState => 1,
        HostOpcode::GetLanguage => 1,
        HostOpcode::WillReplaceOrAccumulate => 1,
        _ => {
            tracing::trace!(?opcode, "host opcode answered with default");
            0
        }
    }
}
