//! MIDI events and their native event-list form.

use std::ptr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::abi::{VstEvent, VstEvents, VstMidiEvent, MIDI_EVENT_TYPE};

pub const MIDI_STACK_CAPACITY: usize = 256;

/// Events delivered to a plugin in one block beyond this are dropped.
pub const MAX_BLOCK_EVENTS: usize = 1024;

/// A short MIDI message positioned within a processing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MidiEvent {
    pub frame_offset: u32,
    pub data: [u8; 3],
    pub len: u8,
}

impl MidiEvent {
    pub fn from_bytes(frame_offset: u32, bytes: &[u8]) -> Self {
        let mut data = [0u8; 3];
        let len = bytes.len().min(3);
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            frame_offset,
            data,
            len: len as u8,
        }
    }

    pub fn note_on(frame_offset: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self::from_bytes(frame_offset, &[0x90 | (channel & 0x0f), note & 0x7f, velocity & 0x7f])
    }

    pub fn note_off(frame_offset: u32, channel: u8, note: u8) -> Self {
        Self::from_bytes(frame_offset, &[0x80 | (channel & 0x0f), note & 0x7f, 0])
    }

    pub fn control_change(frame_offset: u32, channel: u8, controller: u8, value: u8) -> Self {
        Self::from_bytes(
            frame_offset,
            &[0xb0 | (channel & 0x0f), controller & 0x7f, value & 0x7f],
        )
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn status(&self) -> u8 {
        self.data[0]
    }

    pub fn channel(&self) -> Option<u8> {
        (self.len > 0 && self.status() < 0xf0).then(|| self.status() & 0x0f)
    }

    pub fn is_note_on(&self) -> bool {
        self.status() & 0xf0 == 0x90 && self.data[2] > 0
    }
}

pub type MidiEventVec = SmallVec<[MidiEvent; MIDI_STACK_CAPACITY]>;

/// Length of a short message implied by its status byte.
pub fn message_len(status: u8) -> usize {
    match status {
        0x80..=0xbf | 0xe0..=0xef => 3,
        0xc0..=0xdf => 2,
        0xf1 | 0xf3 => 2,
        0xf2 => 3,
        0xf4..=0xff => 1,
        _ => 0,
    }
}

#[repr(C)]
struct EventListStorage {
    num_events: i32,
    reserved: isize,
    events: [*mut VstEvent; MAX_BLOCK_EVENTS],
}

/// Preallocated `VstEvents` block handed to `ProcessEvents`.
///
/// Allocated once per instance; filling it never allocates.
pub(crate) struct NativeEventList {
    list: Box<EventListStorage>,
    events: Vec<VstMidiEvent>,
}

// Raw pointers only reference `events`, which is owned alongside them.
unsafe impl Send for NativeEventList {}

impl NativeEventList {
    pub fn new() -> Self {
        Self {
            list: Box::new(EventListStorage {
                num_events: 0,
                reserved: 0,
                events: [ptr::null_mut(); MAX_BLOCK_EVENTS],
            }),
            events: vec![VstMidiEvent::default(); MAX_BLOCK_EVENTS],
        }
    }

    pub fn len(&self) -> usize {
        self.list.num_events as usize
    }

    pub fn clear(&mut self) {
        self.list.num_events = 0;
    }

    /// Loads events for a block of `frames` samples, clamping offsets into
    /// `[0, frames - 1]`.
    pub fn fill_block(&mut self, midi: &[MidiEvent], frames: usize) -> usize {
        let last = frames.saturating_sub(1) as u32;
        self.load(midi.iter().map(|e| (e.frame_offset.min(last), e)))
    }

    /// Loads events with their offsets as given.
    pub fn fill(&mut self, midi: &[MidiEvent]) -> usize {
        self.load(midi.iter().map(|e| (e.frame_offset, e)))
    }

    fn load<'a>(&mut self, midi: impl Iterator<Item = (u32, &'a MidiEvent)>) -> usize {
        let mut count = 0;
        let mut dropped = 0usize;
        for (offset, event) in midi {
            if count == MAX_BLOCK_EVENTS {
                dropped += 1;
                continue;
            }
            let slot = &mut self.events[count];
            *slot = VstMidiEvent::new(offset as i32, event.data);
            self.list.events[count] = (slot as *mut VstMidiEvent).cast::<VstEvent>();
            count += 1;
        }
        if dropped > 0 {
            tracing::warn!(dropped, "MIDI events beyond block capacity dropped");
        }
        self.list.num_events = count as i32;
        count
    }

    pub fn as_mut_ptr(&mut self) -> *mut VstEvents {
        (&mut *self.list as *mut EventListStorage).cast::<VstEvents>()
    }
}

/// Appends the MIDI messages in a plugin-supplied event list to `out`.
///
/// # Safety
/// `list` must be null or point to a valid `VstEvents` whose `num_events`
/// pointers are readable.
pub(crate) unsafe fn read_events(list: *const VstEvents, out: &mut MidiEventVec) -> usize {
    if list.is_null() {
        return 0;
    }
    let count = (*list).num_events.max(0) as usize;
    let slots = ptr::addr_of!((*list).events).cast::<*const VstEvent>();
    let mut read = 0;
    for i in 0..count {
        let event = *slots.add(i);
        if event.is_null() || (*event).event_type != MIDI_EVENT_TYPE {
            continue;
        }
        let midi = &*event.cast::<VstMidiEvent>();
        let len = message_len(midi.midi_data[0]);
        if len == 0 {
            continue;
        }
        out.push(MidiEvent::from_bytes(
            midi.delta_frames.max(0) as u32,
            &midi.midi_data[..len],
        ));
        read += 1;
    }
    read
}
