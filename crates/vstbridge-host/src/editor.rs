//! Embedding a plugin-drawn editor inside a host window.

use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver};
use raw_window_handle::RawWindowHandle;

use crate::abi::{EffectOpcode, ERect};
use crate::config::host_config;
use crate::effect::Invocation;
use crate::error::{HostError, Result};
use crate::instance::{InstanceCoreRef, InstanceShared, PluginInstance};

/// Smallest edge accepted from a plugin's reported rect.
pub const MIN_EDITOR_EDGE: i32 = 32;

impl PluginInstance {
    /// Returns the editor for this instance, or `None` when the plugin has
    /// none or one is already attached.
    pub fn create_editor(&self) -> Option<PluginEditor> {
        if !self.has_editor() {
            return None;
        }
        let shared = self.shared();
        if shared.editor_attached.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(PluginEditor {
            shared: Arc::clone(shared),
            size: (0, 0),
            open: false,
        })
    }
}

/// A plugin editor window, open or not.
///
/// Drop it before the instance it came from.
pub struct PluginEditor {
    shared: Arc<InstanceShared>,
    size: (i32, i32),
    open: bool,
}

impl PluginEditor {
    /// Opens the editor as a child of `parent` and returns its size.
    pub fn open(&mut self, parent: RawWindowHandle) -> Result<(i32, i32)> {
        if self.open {
            return Ok(self.size);
        }
        let parent = parent_pointer(parent)?;

        let size = self
            .shared
            .with_core(None, |core| {
                // Some plugins only know their size after opening.
                let before = editor_rect(core);
                if core.dispatch(Invocation::new(EffectOpcode::EditOpen).ptr(parent)) == 0 {
                    tracing::debug!("editor reported failure to open, continuing");
                }
                Some(editor_rect(core).or(before))
            })
            .ok_or_else(|| HostError::Editor("plugin is closed".into()))?;

        let config = host_config();
        let (width, height) = size.unwrap_or((config.default_editor_width, config.default_editor_height));
        self.size = (width.max(MIN_EDITOR_EDGE), height.max(MIN_EDITOR_EDGE));
        self.open = true;
        self.shared.editor_open.store(true, Ordering::Release);

        tracing::debug!(width = self.size.0, height = self.size.1, "editor opened");
        Ok(self.size)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Size chosen at open, updated by accepted resize requests.
    pub fn size(&self) -> (i32, i32) {
        self.size
    }

    /// Size the plugin asked for since the last call, if any.
    pub fn take_resize_request(&mut self) -> Option<(i32, i32)> {
        let (width, height) = self.shared.take_resize_request()?;
        self.size = (width.max(MIN_EDITOR_EDGE), height.max(MIN_EDITOR_EDGE));
        Some(self.size)
    }

    /// Periodic tick from the UI thread. Skipped when the instance is busy.
    pub fn idle(&self) {
        if self.open {
            self.shared.run_idle();
        }
    }

    /// Idles the editor every `editor_idle_interval_ms` until `stop` yields
    /// or disconnects. Returns the number of ticks delivered.
    pub fn idle_until(&self, stop: &Receiver<()>) -> usize {
        if !self.open {
            return 0;
        }
        let ticker = idle_ticker();
        let mut ticks = 0;
        loop {
            select! {
                recv(ticker) -> _ => {
                    self.idle();
                    ticks += 1;
                }
                recv(stop) -> _ => return ticks,
            }
        }
    }

    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.shared.editor_open.store(false, Ordering::Release);
        self.shared.with_core(0, |core| core.dispatch(Invocation::new(EffectOpcode::EditClose)));
        tracing::debug!("editor closed");
    }
}

impl Drop for PluginEditor {
    fn drop(&mut self) {
        self.close();
        self.shared.editor_attached.store(false, Ordering::Release);
    }
}

/// Fires at the configured editor idle interval, for hosts that drive
/// [`PluginEditor::idle`] from their own event loop.
pub fn idle_ticker() -> Receiver<Instant> {
    let interval = host_config().editor_idle_interval_ms.max(1);
    crossbeam_channel::tick(Duration::from_millis(interval))
}

fn editor_rect(core: &mut InstanceCoreRef<'_>) -> Option<(i32, i32)> {
    let mut rect: *mut ERect = ptr::null_mut();
    let answered = core.dispatch(Invocation::new(EffectOpcode::EditGetRect).ptr(&mut rect as *mut *mut ERect));
    if answered == 0 || rect.is_null() {
        return None;
    }
    // SAFETY: the plugin owns the rect and keeps it alive while the editor
    // exists; it is copied out immediately.
    let rect = unsafe { *rect };
    let (width, height) = (rect.width(), rect.height());
    (width > 0 && height > 0).then_some((width, height))
}

fn parent_pointer(parent: RawWindowHandle) -> Result<*mut c_void> {
    let pointer = match parent {
        RawWindowHandle::Xlib(handle) => handle.window as usize as *mut c_void,
        RawWindowHandle::Xcb(handle) => handle.window.get() as usize as *mut c_void,
        RawWindowHandle::Win32(handle) => handle.hwnd.get() as *mut c_void,
        RawWindowHandle::AppKit(handle) => handle.ns_view.as_ptr(),
        other => {
            return Err(HostError::Editor(format!(
                "unsupported parent window type: {other:?}"
            )))
        }
    };
    if pointer.is_null() {
        return Err(HostError::Editor("null parent window".into()));
    }
    Ok(pointer)
}
