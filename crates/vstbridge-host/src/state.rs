//! `.fxp` / `.fxb` state records.
//!
//! Four layouts share one 28-byte header:
//!
//! | record | body                                                   |
//! |--------|--------------------------------------------------------|
//! | `FxCk` | name\[28\], `count` parameters                         |
//! | `FxBk` | current program, future\[124\], `count` `FxCk` records |
//! | `FBCh` | current program, future\[124\], size, opaque bytes     |
//! | `FPCh` | name\[28\], size, opaque bytes                         |
//!
//! Every integer and float is big-endian. A record is decoded completely
//! before anything is applied to a plugin.

use std::fs;
use std::path::Path;

use crate::abi::fourcc;
use crate::config::host_config;
use crate::error::{HostError, StateFormatError};
use crate::instance::PluginInstance;

const CHUNK_MAGIC: i32 = fourcc(b"CcnK");
const CHUNK_MAGIC_SWAPPED: i32 = fourcc(b"KncC");
const PROGRAM_MAGIC: i32 = fourcc(b"FxCk");
const BANK_MAGIC: i32 = fourcc(b"FxBk");
const CHUNK_BANK_MAGIC: i32 = fourcc(b"FBCh");
const CHUNK_BANK_MAGIC_SWAPPED: i32 = fourcc(b"hCBF");
const CHUNK_PROGRAM_MAGIC: i32 = fourcc(b"FPCh");
const CHUNK_PROGRAM_MAGIC_SWAPPED: i32 = fourcc(b"hCPF");

pub const HEADER_LEN: usize = 28;
pub const NAME_LEN: usize = 28;
const BANK_RESERVED_LEN: usize = 128;
const MAX_VERSION: i32 = 2;

/// One program of flat parameter values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramRecord {
    pub name: String,
    pub params: Vec<f32>,
}

/// A decoded state record.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChunk {
    Program {
        fx_id: i32,
        fx_version: i32,
        program: ProgramRecord,
    },
    Bank {
        fx_id: i32,
        fx_version: i32,
        /// Present in version 2 records.
        current_program: Option<i32>,
        programs: Vec<ProgramRecord>,
    },
    ChunkBank {
        fx_id: i32,
        fx_version: i32,
        num_programs: i32,
        current_program: Option<i32>,
        data: Vec<u8>,
    },
    ChunkProgram {
        fx_id: i32,
        fx_version: i32,
        num_programs: i32,
        name: String,
        data: Vec<u8>,
    },
}

struct Header {
    record: i32,
    version: i32,
    fx_id: i32,
    fx_version: i32,
    count: i32,
}

/// Bounds-checked big-endian reader.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Stops reading at `end`.
    fn limit(&mut self, end: usize) {
        self.data = &self.data[..end.min(self.data.len())];
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], StateFormatError> {
        let needed = self.pos.checked_add(len).ok_or(StateFormatError::Truncated {
            needed: usize::MAX,
            available: self.data.len(),
        })?;
        if needed > self.data.len() {
            return Err(StateFormatError::Truncated {
                needed,
                available: self.data.len(),
            });
        }
        let bytes = &self.data[self.pos..needed];
        self.pos = needed;
        Ok(bytes)
    }

    fn i32(&mut self) -> Result<i32, StateFormatError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_be_bytes(raw))
    }

    fn f32(&mut self) -> Result<f32, StateFormatError> {
        Ok(f32::from_bits(self.i32()? as u32))
    }

    fn name(&mut self) -> Result<String, StateFormatError> {
        let raw = self.take(NAME_LEN)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    fn header(&mut self) -> Result<Header, StateFormatError> {
        let magic = self.i32()?;
        if magic != CHUNK_MAGIC && magic != CHUNK_MAGIC_SWAPPED {
            return Err(StateFormatError::UnknownMagic(magic as u32));
        }
        let _byte_size = self.i32()?;
        let record = self.i32()?;
        let version = self.i32()?;
        if !(0..=MAX_VERSION).contains(&version) {
            return Err(StateFormatError::UnsupportedVersion(version));
        }
        Ok(Header {
            record,
            version,
            fx_id: self.i32()?,
            fx_version: self.i32()?,
            count: self.i32()?,
        })
    }

    fn count(value: i32) -> Result<usize, StateFormatError> {
        usize::try_from(value).map_err(|_| StateFormatError::InvalidCount(value))
    }

    fn program(&mut self) -> Result<ProgramRecord, StateFormatError> {
        let header = self.header()?;
        if header.record != PROGRAM_MAGIC {
            return Err(StateFormatError::UnknownRecord(header.record as u32));
        }
        self.program_body(header.count)
    }

    fn program_body(&mut self, count: i32) -> Result<ProgramRecord, StateFormatError> {
        let count = Self::count(count)?;
        let name = self.name()?;
        if count.saturating_mul(4) > self.remaining() {
            return Err(StateFormatError::Truncated {
                needed: self.pos.saturating_add(count.saturating_mul(4)),
                available: self.data.len(),
            });
        }
        let params = (0..count).map(|_| self.f32()).collect::<Result<_, _>>()?;
        Ok(ProgramRecord { name, params })
    }

    fn blob(&mut self, limit: usize) -> Result<Vec<u8>, StateFormatError> {
        let size = self.i32()?;
        let size = Self::count(size)?;
        if size > limit {
            return Err(StateFormatError::ChunkTooLarge { size, limit });
        }
        Ok(self.take(size)?.to_vec())
    }
}

/// Big-endian record writer.
#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a name field, truncated to leave room for the terminator.
    fn name(&mut self, name: &str) {
        let mut end = name.len().min(NAME_LEN - 1);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut field = [0u8; NAME_LEN];
        field[..end].copy_from_slice(&name.as_bytes()[..end]);
        self.buf.extend_from_slice(&field);
    }

    /// Starts a record; returns its offset for [`finish`](Self::finish).
    fn header(&mut self, record: i32, version: i32, fx_id: i32, fx_version: i32, count: i32) -> usize {
        let start = self.buf.len();
        self.i32(CHUNK_MAGIC);
        self.i32(0);
        self.i32(record);
        self.i32(version);
        self.i32(fx_id);
        self.i32(fx_version);
        self.i32(count);
        start
    }

    fn finish(&mut self, start: usize) {
        let size = (self.buf.len() - start - 8) as i32;
        self.buf[start + 4..start + 8].copy_from_slice(&size.to_be_bytes());
    }

    fn program(&mut self, fx_id: i32, fx_version: i32, program: &ProgramRecord) {
        let start = self.header(PROGRAM_MAGIC, 1, fx_id, fx_version, program.params.len() as i32);
        self.name(&program.name);
        for &value in &program.params {
            self.f32(value);
        }
        self.finish(start);
    }

    fn bank_reserved(&mut self, current_program: Option<i32>) {
        self.i32(current_program.unwrap_or(0));
        self.buf.extend_from_slice(&[0u8; BANK_RESERVED_LEN - 4]);
    }

    fn blob(&mut self, data: &[u8]) {
        self.i32(data.len() as i32);
        self.buf.extend_from_slice(data);
    }
}

impl StateChunk {
    /// Decodes a record, accepting opaque payloads up to the configured
    /// maximum chunk size.
    pub fn parse(data: &[u8]) -> Result<Self, StateFormatError> {
        Self::parse_with_limit(data, host_config().max_chunk_size)
    }

    pub fn parse_with_limit(data: &[u8], max_chunk_size: usize) -> Result<Self, StateFormatError> {
        if data.is_empty() {
            return Err(StateFormatError::Empty);
        }
        if data.len() < HEADER_LEN {
            return Err(StateFormatError::TooShort {
                len: data.len(),
                needed: HEADER_LEN,
            });
        }

        let mut reader = Reader::new(data);
        let header = reader.header()?;

        // Zero is written by some hosts to mean "unspecified".
        let declared = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if declared != 0 {
            let total = declared.saturating_add(8);
            if total > data.len() {
                return Err(StateFormatError::DeclaredSizeExceedsBuffer {
                    declared: total,
                    available: data.len(),
                });
            }
            if total < HEADER_LEN {
                return Err(StateFormatError::Truncated {
                    needed: HEADER_LEN,
                    available: total,
                });
            }
            reader.limit(total);
        }
        let current = |version: i32, value: i32| (version >= 2).then_some(value);

        match header.record {
            PROGRAM_MAGIC => Ok(Self::Program {
                fx_id: header.fx_id,
                fx_version: header.fx_version,
                program: reader.program_body(header.count)?,
            }),
            BANK_MAGIC => {
                let count = Reader::count(header.count)?;
                let current_program = reader.i32()?;
                reader.take(BANK_RESERVED_LEN - 4)?;
                let min_program_len = HEADER_LEN + NAME_LEN;
                let mut programs = Vec::with_capacity(count.min(reader.remaining() / min_program_len));
                for _ in 0..count {
                    programs.push(reader.program()?);
                }
                Ok(Self::Bank {
                    fx_id: header.fx_id,
                    fx_version: header.fx_version,
                    current_program: current(header.version, current_program),
                    programs,
                })
            }
            CHUNK_BANK_MAGIC | CHUNK_BANK_MAGIC_SWAPPED => {
                let current_program = reader.i32()?;
                reader.take(BANK_RESERVED_LEN - 4)?;
                Ok(Self::ChunkBank {
                    fx_id: header.fx_id,
                    fx_version: header.fx_version,
                    num_programs: header.count,
                    current_program: current(header.version, current_program),
                    data: reader.blob(max_chunk_size)?,
                })
            }
            CHUNK_PROGRAM_MAGIC | CHUNK_PROGRAM_MAGIC_SWAPPED => {
                let name = reader.name()?;
                Ok(Self::ChunkProgram {
                    fx_id: header.fx_id,
                    fx_version: header.fx_version,
                    num_programs: header.count,
                    name,
                    data: reader.blob(max_chunk_size)?,
                })
            }
            other => Err(StateFormatError::UnknownRecord(other as u32)),
        }
    }

    /// Encodes the record with freshly computed byte sizes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::default();
        let version = |current: &Option<i32>| if current.is_some() { 2 } else { 1 };
        match self {
            Self::Program {
                fx_id,
                fx_version,
                program,
            } => w.program(*fx_id, *fx_version, program),
            Self::Bank {
                fx_id,
                fx_version,
                current_program,
                programs,
            } => {
                let start = w.header(
                    BANK_MAGIC,
                    version(current_program),
                    *fx_id,
                    *fx_version,
                    programs.len() as i32,
                );
                w.bank_reserved(*current_program);
                for program in programs {
                    w.program(*fx_id, *fx_version, program);
                }
                w.finish(start);
            }
            Self::ChunkBank {
                fx_id,
                fx_version,
                num_programs,
                current_program,
                data,
            } => {
                let start = w.header(
                    CHUNK_BANK_MAGIC,
                    version(current_program),
                    *fx_id,
                    *fx_version,
                    *num_programs,
                );
                w.bank_reserved(*current_program);
                w.blob(data);
                w.finish(start);
            }
            Self::ChunkProgram {
                fx_id,
                fx_version,
                num_programs,
                name,
                data,
            } => {
                let start = w.header(CHUNK_PROGRAM_MAGIC, 1, *fx_id, *fx_version, *num_programs);
                w.name(name);
                w.blob(data);
                w.finish(start);
            }
        }
        w.buf
    }

    pub fn fx_id(&self) -> i32 {
        match self {
            Self::Program { fx_id, .. }
            | Self::Bank { fx_id, .. }
            | Self::ChunkBank { fx_id, .. }
            | Self::ChunkProgram { fx_id, .. } => *fx_id,
        }
    }

    pub fn is_bank(&self) -> bool {
        matches!(self, Self::Bank { .. } | Self::ChunkBank { .. })
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::ChunkBank { .. } | Self::ChunkProgram { .. })
    }
}

/// What the serializer needs from a plugin.
pub trait PresetTarget {
    fn unique_id(&self) -> i32;
    fn version_number(&self) -> i32;
    fn num_parameters(&self) -> usize;
    fn get_parameter(&self, index: usize) -> f32;
    fn set_parameter(&self, index: usize, value: f32);
    fn num_programs(&self) -> usize;
    fn current_program(&self) -> usize;
    fn set_current_program(&self, index: usize);
    fn current_program_name(&self) -> String;
    fn change_program_name(&self, index: usize, name: &str);
    fn uses_chunks(&self) -> bool;
    fn get_chunk(&self, preset: bool) -> Vec<u8>;
    fn set_chunk(&self, preset: bool, data: &[u8]) -> bool;
}

fn capture_program<T: PresetTarget + ?Sized>(target: &T) -> ProgramRecord {
    ProgramRecord {
        name: target.current_program_name(),
        params: (0..target.num_parameters())
            .map(|i| target.get_parameter(i))
            .collect(),
    }
}

fn apply_program<T: PresetTarget + ?Sized>(target: &T, program: &ProgramRecord) {
    target.change_program_name(target.current_program(), &program.name);
    let count = program.params.len().min(target.num_parameters());
    for (index, &value) in program.params[..count].iter().enumerate() {
        target.set_parameter(index, value);
    }
}

/// Captures the current program.
pub fn save_program<T: PresetTarget + ?Sized>(target: &T) -> StateChunk {
    let fx_id = target.unique_id();
    let fx_version = target.version_number();
    if target.uses_chunks() {
        return StateChunk::ChunkProgram {
            fx_id,
            fx_version,
            num_programs: target.num_programs() as i32,
            name: target.current_program_name(),
            data: target.get_chunk(true),
        };
    }
    StateChunk::Program {
        fx_id,
        fx_version,
        program: capture_program(target),
    }
}

/// Captures every program.
///
/// Walking a flat bank switches the live program; the original program and
/// its parameter values are put back afterwards.
pub fn save_bank<T: PresetTarget + ?Sized>(target: &T) -> StateChunk {
    let fx_id = target.unique_id();
    let fx_version = target.version_number();
    let num_programs = target.num_programs();
    let current = target.current_program();

    if target.uses_chunks() {
        return StateChunk::ChunkBank {
            fx_id,
            fx_version,
            num_programs: num_programs as i32,
            current_program: Some(current as i32),
            data: target.get_chunk(false),
        };
    }

    let snapshot = capture_program(target);
    let slots = num_programs.max(1);
    let mut programs = vec![ProgramRecord::default(); slots];
    let current_slot = current.min(slots - 1);
    programs[current_slot] = snapshot.clone();

    for index in (0..num_programs).filter(|&i| i != current_slot) {
        target.set_current_program(index);
        programs[index] = capture_program(target);
    }

    if num_programs > 0 {
        target.set_current_program(current);
        for (index, &value) in snapshot.params.iter().enumerate() {
            if target.get_parameter(index) != value {
                target.set_parameter(index, value);
            }
        }
    }

    StateChunk::Bank {
        fx_id,
        fx_version,
        current_program: Some(current as i32),
        programs,
    }
}

/// Decodes `data` and applies it. Nothing is applied when decoding fails.
pub fn load<T: PresetTarget + ?Sized>(target: &T, data: &[u8]) -> Result<StateChunk, StateFormatError> {
    let chunk = StateChunk::parse(data)?;
    apply(target, &chunk)?;
    Ok(chunk)
}

/// Applies an already decoded record.
pub fn apply<T: PresetTarget + ?Sized>(target: &T, chunk: &StateChunk) -> Result<(), StateFormatError> {
    if chunk.is_opaque() && !target.uses_chunks() {
        return Err(StateFormatError::NotChunkBased);
    }
    if chunk.fx_id() != target.unique_id() {
        tracing::warn!(
            expected = target.unique_id(),
            found = chunk.fx_id(),
            "state record was saved by a different plugin"
        );
    }

    match chunk {
        StateChunk::Program { program, .. } => apply_program(target, program),
        StateChunk::Bank {
            current_program,
            programs,
            ..
        } => {
            let num_programs = target.num_programs();
            let old = target.current_program();
            let usable = if num_programs == 0 {
                programs.len().min(1)
            } else {
                programs.len().min(num_programs)
            };

            for (index, program) in programs[..usable].iter().enumerate() {
                if index == old {
                    continue;
                }
                if num_programs > 0 {
                    target.set_current_program(index);
                }
                apply_program(target, program);
            }
            if num_programs > 0 {
                target.set_current_program(old);
            }
            if let Some(program) = programs[..usable].get(old) {
                apply_program(target, program);
            }

            if let Some(index) = current_program {
                if num_programs > 0 && *index >= 0 && (*index as usize) < num_programs {
                    target.set_current_program(*index as usize);
                }
            }
        }
        StateChunk::ChunkBank {
            current_program,
            data,
            ..
        } => {
            if !target.set_chunk(false, data) {
                return Err(StateFormatError::ChunkRejected { size: data.len() });
            }
            if let Some(index) = current_program {
                let num_programs = target.num_programs();
                if num_programs > 0 && *index >= 0 && (*index as usize) < num_programs {
                    target.set_current_program(*index as usize);
                }
            }
        }
        StateChunk::ChunkProgram { name, data, .. } => {
            if !target.set_chunk(true, data) {
                return Err(StateFormatError::ChunkRejected { size: data.len() });
            }
            target.change_program_name(target.current_program(), name);
        }
    }
    Ok(())
}

impl PresetTarget for PluginInstance {
    fn unique_id(&self) -> i32 {
        PluginInstance::unique_id(self)
    }

    fn version_number(&self) -> i32 {
        PluginInstance::version_number(self)
    }

    fn num_parameters(&self) -> usize {
        PluginInstance::num_parameters(self)
    }

    fn get_parameter(&self, index: usize) -> f32 {
        PluginInstance::get_parameter(self, index)
    }

    fn set_parameter(&self, index: usize, value: f32) {
        PluginInstance::set_parameter(self, index, value)
    }

    fn num_programs(&self) -> usize {
        PluginInstance::num_programs(self)
    }

    fn current_program(&self) -> usize {
        PluginInstance::current_program(self)
    }

    fn set_current_program(&self, index: usize) {
        PluginInstance::set_current_program(self, index)
    }

    fn current_program_name(&self) -> String {
        PluginInstance::current_program_name(self)
    }

    fn change_program_name(&self, index: usize, name: &str) {
        PluginInstance::change_program_name(self, index, name)
    }

    fn uses_chunks(&self) -> bool {
        PluginInstance::uses_chunks(self)
    }

    fn get_chunk(&self, preset: bool) -> Vec<u8> {
        PluginInstance::get_chunk(self, preset)
    }

    fn set_chunk(&self, preset: bool, data: &[u8]) -> bool {
        PluginInstance::set_chunk(self, preset, data)
    }
}

impl PluginInstance {
    /// The whole bank as an `.fxb` image.
    pub fn save_state(&self) -> Vec<u8> {
        save_bank(self).to_bytes()
    }

    /// The current program as an `.fxp` image.
    pub fn save_program_state(&self) -> Vec<u8> {
        save_program(self).to_bytes()
    }

    /// Restores an `.fxp` or `.fxb` image.
    pub fn restore_state(&self, data: &[u8]) -> Result<(), StateFormatError> {
        load(self, data).map(|_| ())
    }

    /// Writes a bank (`bank == true`) or the current program to `path`.
    pub fn save_to_file(&self, path: &Path, bank: bool) -> Result<(), HostError> {
        let bytes = if bank {
            self.save_state()
        } else {
            self.save_program_state()
        };
        fs::write(path, bytes)?;
        tracing::debug!(path = %path.display(), bank, "saved plugin state");
        Ok(())
    }

    pub fn load_from_file(&self, path: &Path) -> Result<(), HostError> {
        let bytes = fs::read(path)?;
        self.restore_state(&bytes)?;
        tracing::debug!(path = %path.display(), "restored plugin state");
        Ok(())
    }
}
