//! The effect capability interface.
//!
//! Everything the host does to a plugin goes through [`Effect`]. The native
//! implementation wraps the `AEffect` record returned by a module's entry
//! point; in-process implementations (see the `testing` feature) implement the
//! same trait in Rust.

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use smallvec::SmallVec;

use crate::abi::{self, AEffect, EffectOpcode, HostOpcode};
use crate::error::DispatchFailure;
use crate::host::NativeCallGuard;

/// Identity of a live effect, used to route host callbacks back to the
/// owning instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectKey(usize);

/// High bit marks keys that were not derived from a native pointer.
const SYNTHETIC_BIT: usize = 1 << (usize::BITS - 1);
static NEXT_SYNTHETIC: AtomicUsize = AtomicUsize::new(1);

impl EffectKey {
    pub fn from_ptr(effect: *const AEffect) -> Self {
        Self(effect as usize)
    }

    /// Fresh key for an effect that has no native record.
    pub fn allocate() -> Self {
        Self(SYNTHETIC_BIT | NEXT_SYNTHETIC.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> usize {
        self.0
    }
}

/// One call across the dispatcher, in either direction.
#[derive(Debug, Clone, Copy)]
pub struct Invocation {
    pub opcode: i32,
    pub index: i32,
    pub value: isize,
    pub ptr: *mut c_void,
    pub opt: f32,
}

impl Invocation {
    pub fn new(opcode: EffectOpcode) -> Self {
        Self::raw(opcode.raw())
    }

    pub fn host(opcode: HostOpcode) -> Self {
        Self::raw(opcode.raw())
    }

    pub fn raw(opcode: i32) -> Self {
        Self {
            opcode,
            index: 0,
            value: 0,
            ptr: ptr::null_mut(),
            opt: 0.0,
        }
    }

    pub fn index(mut self, index: i32) -> Self {
        self.index = index;
        self
    }

    pub fn value(mut self, value: isize) -> Self {
        self.value = value;
        self
    }

    pub fn ptr<T>(mut self, ptr: *mut T) -> Self {
        self.ptr = ptr.cast();
        self
    }

    pub fn opt(mut self, opt: f32) -> Self {
        self.opt = opt;
        self
    }

    pub fn effect_opcode(&self) -> Option<EffectOpcode> {
        EffectOpcode::from_raw(self.opcode)
    }

    pub fn host_opcode(&self) -> Option<HostOpcode> {
        HostOpcode::from_raw(self.opcode)
    }
}

/// Static shape of an effect as published in its record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectLayout {
    pub num_programs: i32,
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    pub initial_delay: i32,
    pub unique_id: i32,
    pub version: i32,
}

impl EffectLayout {
    pub fn has_editor(&self) -> bool {
        self.flags & abi::flags::HAS_EDITOR != 0
    }

    pub fn can_replacing(&self) -> bool {
        self.flags & abi::flags::CAN_REPLACING != 0
    }

    pub fn uses_chunks(&self) -> bool {
        self.flags & abi::flags::PROGRAM_CHUNKS != 0
    }

    pub fn is_synth(&self) -> bool {
        self.flags & abi::flags::IS_SYNTH != 0
    }

    /// Channels a processing call touches.
    pub fn max_channels(&self) -> usize {
        self.num_inputs.max(self.num_outputs).max(0) as usize
    }
}

/// Capability interface of a hosted effect.
///
/// Implementations are not required to be thread-safe; callers serialize all
/// access behind the owning instance's lock.
pub trait Effect: Send {
    fn key(&self) -> EffectKey;

    /// Current record fields. May change after `Open` or `IOChanged`.
    fn layout(&self) -> EffectLayout;

    /// # Safety
    /// `call.ptr` must satisfy the contract of `call.opcode`.
    unsafe fn dispatch(&mut self, call: Invocation) -> isize;

    /// In-place processing over `max(inputs, outputs)` channels.
    fn process_replacing(&mut self, channels: &mut [&mut [f32]], frames: usize);

    /// Accumulating processing into separate output buffers.
    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize);

    fn get_parameter(&mut self, index: i32) -> f32;

    fn set_parameter(&mut self, index: i32, value: f32);
}

/// Runs `f` as a call into plugin code: counted by the reentrancy guard and
/// with panics converted to `default`.
pub(crate) fn guarded<R>(site: DispatchFailure, default: R, f: impl FnOnce() -> R) -> R {
    try_guarded(f).unwrap_or_else(|message| {
        tracing::warn!("{site}: {message}");
        default
    })
}

/// Like [`guarded`], but hands the panic message back instead of logging it.
pub(crate) fn try_guarded<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    let _native = NativeCallGuard::enter();
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| panic_message(payload.as_ref()).to_string())
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// An effect record produced by a native module.
pub struct NativeEffect {
    raw: NonNull<AEffect>,
}

// The record is only touched behind the owning instance's lock.
unsafe impl Send for NativeEffect {}

impl NativeEffect {
    /// # Safety
    /// `raw` must be null or the record returned by a module entry point,
    /// valid until `Close` is dispatched.
    pub unsafe fn from_raw(raw: *mut AEffect) -> Option<Self> {
        NonNull::new(raw).map(|raw| Self { raw })
    }

    pub fn magic(&self) -> i32 {
        unsafe { self.raw.as_ref().magic }
    }

    fn record(&self) -> &AEffect {
        unsafe { self.raw.as_ref() }
    }
}

impl Effect for NativeEffect {
    fn key(&self) -> EffectKey {
        EffectKey::from_ptr(self.raw.as_ptr())
    }

    fn layout(&self) -> EffectLayout {
        let e = self.record();
        EffectLayout {
            num_programs: e.num_programs,
            num_params: e.num_params,
            num_inputs: e.num_inputs,
            num_outputs: e.num_outputs,
            flags: e.flags,
            initial_delay: e.initial_delay,
            unique_id: e.unique_id,
            version: e.version,
        }
    }

    unsafe fn dispatch(&mut self, call: Invocation) -> isize {
        match self.record().dispatcher {
            Some(dispatcher) => dispatcher(
                self.raw.as_ptr(),
                call.opcode,
                call.index,
                call.value,
                call.ptr,
                call.opt,
            ),
            None => 0,
        }
    }

    fn process_replacing(&mut self, channels: &mut [&mut [f32]], frames: usize) {
        let Some(process) = self.record().process_replacing else {
            return;
        };
        let mut ptrs: SmallVec<[*mut f32; 16]> =
            channels.iter_mut().map(|c| c.as_mut_ptr()).collect();
        let io = ptrs.as_mut_ptr();
        process(self.raw.as_ptr(), io, io, frames as i32);
    }

    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], frames: usize) {
        let Some(process) = self.record().process else {
            return;
        };
        let mut ins: SmallVec<[*mut f32; 16]> =
            inputs.iter().map(|c| c.as_ptr() as *mut f32).collect();
        let mut outs: SmallVec<[*mut f32; 16]> =
            outputs.iter_mut().map(|c| c.as_mut_ptr()).collect();
        process(
            self.raw.as_ptr(),
            ins.as_mut_ptr(),
            outs.as_mut_ptr(),
            frames as i32,
        );
    }

    fn get_parameter(&mut self, index: i32) -> f32 {
        match self.record().get_parameter {
            Some(get) => get(self.raw.as_ptr(), index),
            None => 0.0,
        }
    }

    fn set_parameter(&mut self, index: i32, value: f32) {
        if let Some(set) = self.record().set_parameter {
            set(self.raw.as_ptr(), index, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_keys_are_unique() {
        let a = EffectKey::allocate();
        let b = EffectKey::allocate();
        assert_ne!(a, b);
        assert!(a.raw() & SYNTHETIC_BIT != 0);
        let native = EffectKey::from_ptr(0x7f00_0000_1000usize as *const AEffect);
        assert_ne!(native, a);
    }

    #[test]
    fn test_invocation_builder() {
        let mut buf = [0u8; 4];
        let call = Invocation::new(EffectOpcode::SetProgram)
            .index(3)
            .value(7)
            .ptr(buf.as_mut_ptr())
            .opt(0.5);
        assert_eq!(call.effect_opcode(), Some(EffectOpcode::SetProgram));
        assert_eq!((call.index, call.value, call.opt), (3, 7, 0.5));
        assert_eq!(call.ptr, buf.as_mut_ptr().cast());
        assert_eq!(Invocation::raw(12345).effect_opcode(), None);
    }

    #[test]
    fn test_layout_flags() {
        let layout = EffectLayout {
            num_inputs: 2,
            num_outputs: 6,
            flags: abi::flags::CAN_REPLACING | abi::flags::PROGRAM_CHUNKS,
            ..Default::default()
        };
        assert!(layout.can_replacing());
        assert!(layout.uses_chunks());
        assert!(!layout.has_editor());
        assert_eq!(layout.max_channels(), 6);
    }

    #[test]
    fn test_guarded_suppresses_panic() {
        let site = DispatchFailure::Dispatch(EffectOpcode::GetProgram.raw());
        let value = guarded(site, -1isize, || panic!("boom"));
        assert_eq!(value, -1);
        assert_eq!(guarded(site, 0, || 42), 42);
        let err = try_guarded(|| -> i32 { panic!("in process") }).unwrap_err();
        assert_eq!(err, "in process");
    }

    extern "C" fn fake_dispatcher(
        _e: *mut AEffect,
        opcode: i32,
        index: i32,
        _value: isize,
        _ptr: *mut c_void,
        _opt: f32,
    ) -> isize {
        (opcode * 100 + index) as isize
    }

    fn record(dispatcher: Option<abi::DispatcherProc>) -> AEffect {
        AEffect {
            magic: abi::EFFECT_MAGIC,
            dispatcher,
            process: None,
            set_parameter: None,
            get_parameter: None,
            num_programs: 4,
            num_params: 3,
            num_inputs: 2,
            num_outputs: 2,
            flags: abi::flags::CAN_REPLACING,
            resvd1: 0,
            resvd2: 0,
            initial_delay: 64,
            real_qualities: 0,
            off_qualities: 0,
            io_ratio: 1.0,
            object: ptr::null_mut(),
            user: ptr::null_mut(),
            unique_id: 0x1234,
            version: 1000,
            process_replacing: None,
            process_double_replacing: None,
            future: [0; 56],
        }
    }

    #[test]
    fn test_native_effect_reads_record() {
        let mut record = record(None);
        let mut effect = unsafe { NativeEffect::from_raw(&mut record) }.unwrap();
        assert_eq!(effect.magic(), abi::EFFECT_MAGIC);
        let layout = effect.layout();
        assert_eq!(layout.num_params, 3);
        assert_eq!(layout.initial_delay, 64);
        assert_eq!(effect.get_parameter(0), 0.0);
        assert_eq!(
            unsafe { effect.dispatch(Invocation::new(EffectOpcode::GetProgram)) },
            0
        );
    }

    #[test]
    fn test_native_dispatch_goes_through_record() {
        let mut record = record(Some(fake_dispatcher));
        let mut effect = unsafe { NativeEffect::from_raw(&mut record) }.unwrap();
        let r = unsafe { effect.dispatch(Invocation::new(EffectOpcode::SetProgram).index(2)) };
        assert_eq!(r, 202);
        assert_eq!(effect.key(), EffectKey::from_ptr(&record));
    }
}
