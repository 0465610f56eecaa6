// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Flat create envelope sent to the worker
//!
//! Layout (little-endian):
//!
//! ```text
//! 0    fixed header (CREATE_HEADER_SIZE bytes)
//!      ├─ 48  access-state block (descriptor/name offsets relative to here)
//!      └─ 88  create-parameters block (file-name offset relative to here)
//! 96   security descriptor bytes            (optional, aligned)
//!      object-name record                   (present with access state)
//!      object-type record                   (present with access state)
//!      file name, UTF-16LE + u16 terminator (aligned)
//! ```
//!
//! Every sub-record starts on an [`ENVELOPE_ALIGNMENT`] boundary and padding
//! bytes are zero.

use crate::error::ProtoError;
use byteorder::{ByteOrder, LittleEndian};

pub const ENVELOPE_VERSION: u32 = 1;
pub const ENVELOPE_ALIGNMENT: usize = 8;
pub const ACCESS_STATE_OFFSET: usize = 48;
pub const CREATE_PARAMS_OFFSET: usize = 88;
pub const CREATE_HEADER_SIZE: usize = 96;

const NAME_RECORD_PREFIX: usize = 4;
const TERMINATOR_SIZE: usize = 2;

const OFF_VERSION: usize = 0;
const OFF_LENGTH: usize = 4;
const OFF_SERIAL: usize = 8;
const OFF_SESSION: usize = 16;
const OFF_PROCESS: usize = 24;
const OFF_CONTROL_FLAGS: usize = 28;
const OFF_DESIRED_ACCESS: usize = 32;
const OFF_ATTRIBUTES: usize = 36;
const OFF_OPTIONS: usize = 40;
const OFF_SHARE: usize = 44;

// Access-state block fields, relative to ACCESS_STATE_OFFSET.
const AS_EVALUATED: usize = 0;
const AS_GENERATE_AUDIT: usize = 1;
const AS_GENERATE_ON_CLOSE: usize = 2;
const AS_AUDIT_PRIVILEGES: usize = 3;
const AS_FLAGS: usize = 4;
const AS_REMAINING: usize = 8;
const AS_PREVIOUSLY_GRANTED: usize = 12;
const AS_ORIGINAL: usize = 16;
const AS_SD_OFFSET: usize = 20;
const AS_SD_LENGTH: usize = 24;
const AS_NAME_OFFSET: usize = 28;
const AS_TYPE_OFFSET: usize = 32;

// Create-parameters block fields, relative to CREATE_PARAMS_OFFSET.
const CP_NAME_LENGTH: usize = 0;
const CP_NAME_OFFSET: usize = 4;

pub fn align_up(len: usize) -> usize {
    (len + ENVELOPE_ALIGNMENT - 1) & !(ENVELOPE_ALIGNMENT - 1)
}

/// Fixed request fields copied into every envelope
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateHeader {
    pub serial: u64,
    pub session_id: u64,
    pub process_id: u32,
    /// Snapshot of the control block's flags when the envelope was built
    pub control_flags: u32,
    pub desired_access: u32,
    pub file_attributes: u32,
    /// Option bits with the disposition in bits 24..31
    pub create_options: u32,
    pub share_access: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessStateHeader {
    pub security_evaluated: bool,
    pub generate_audit: bool,
    pub generate_on_close: bool,
    pub audit_privileges: bool,
    pub flags: u32,
    pub remaining_desired_access: u32,
    pub previously_granted_access: u32,
    pub original_desired_access: u32,
}

#[derive(Clone, Debug, Default)]
pub struct AccessStatePayload<'a> {
    pub header: AccessStateHeader,
    pub security_descriptor: Option<&'a [u8]>,
    pub object_name: &'a str,
    pub object_type: &'a str,
}

#[derive(Clone, Debug, Default)]
pub struct EnvelopeParams<'a> {
    pub header: CreateHeader,
    pub access_state: Option<AccessStatePayload<'a>>,
    pub file_name: &'a str,
}

impl EnvelopeParams<'_> {
    /// Total buffer size, each component rounded up to the alignment
    pub fn encoded_len(&self) -> usize {
        let mut len = CREATE_HEADER_SIZE;
        if let Some(state) = &self.access_state {
            len += state
                .security_descriptor
                .map(|sd| align_up(sd.len()))
                .unwrap_or(0);
            len += name_record_size(utf16_len(state.object_name));
            len += name_record_size(utf16_len(state.object_type));
        }
        len + align_up(utf16_len(self.file_name) + TERMINATOR_SIZE)
    }
}

fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

fn utf16le(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let mut bytes = vec![0u8; units.len() * 2];
    LittleEndian::write_u16_into(&units, &mut bytes);
    bytes
}

fn name_record_size(byte_len: usize) -> usize {
    align_up(NAME_RECORD_PREFIX + byte_len + TERMINATOR_SIZE)
}

fn name_record(name: &str) -> Result<Vec<u8>, ProtoError> {
    let units = utf16le(name);
    let size = name_record_size(units.len());
    let length = u16::try_from(units.len()).map_err(|_| ProtoError::NameTooLong(units.len()))?;
    let max_length = u16::try_from(size).map_err(|_| ProtoError::NameTooLong(units.len()))?;

    let mut record = Vec::with_capacity(size);
    record.resize(NAME_RECORD_PREFIX, 0);
    LittleEndian::write_u16(&mut record[0..2], length);
    LittleEndian::write_u16(&mut record[2..4], max_length);
    record.extend_from_slice(&units);
    record.extend_from_slice(&[0, 0]);
    Ok(record)
}

/// Growable buffer that appends aligned sub-records and reports their offsets
struct FlatWriter {
    buf: Vec<u8>,
}

impl FlatWriter {
    fn new(header_size: usize, capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(capacity);
        buf.resize(header_size, 0);
        Self { buf }
    }

    fn append_aligned(&mut self, bytes: &[u8]) -> usize {
        let offset = self.buf.len();
        self.buf.extend_from_slice(bytes);
        let padded = align_up(self.buf.len());
        self.buf.resize(padded, 0);
        offset
    }

    fn put_u8(&mut self, at: usize, value: u8) {
        self.buf[at] = value;
    }

    fn put_u32(&mut self, at: usize, value: u32) {
        LittleEndian::write_u32(&mut self.buf[at..at + 4], value);
    }

    fn put_u64(&mut self, at: usize, value: u64) {
        LittleEndian::write_u64(&mut self.buf[at..at + 8], value);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn to_u32(value: usize) -> Result<u32, ProtoError> {
    u32::try_from(value).map_err(|_| ProtoError::NameTooLong(value))
}

/// Serialize a create request into one contiguous envelope
pub fn build_envelope(params: &EnvelopeParams<'_>) -> Result<Vec<u8>, ProtoError> {
    let total = params.encoded_len();
    let mut w = FlatWriter::new(CREATE_HEADER_SIZE, total);

    let h = &params.header;
    w.put_u32(OFF_VERSION, ENVELOPE_VERSION);
    w.put_u32(OFF_LENGTH, to_u32(total)?);
    w.put_u64(OFF_SERIAL, h.serial);
    w.put_u64(OFF_SESSION, h.session_id);
    w.put_u32(OFF_PROCESS, h.process_id);
    w.put_u32(OFF_CONTROL_FLAGS, h.control_flags);
    w.put_u32(OFF_DESIRED_ACCESS, h.desired_access);
    w.put_u32(OFF_ATTRIBUTES, h.file_attributes);
    w.put_u32(OFF_OPTIONS, h.create_options);
    w.put_u32(OFF_SHARE, h.share_access);

    if let Some(state) = &params.access_state {
        let base = ACCESS_STATE_OFFSET;
        let s = &state.header;
        w.put_u8(base + AS_EVALUATED, s.security_evaluated as u8);
        w.put_u8(base + AS_GENERATE_AUDIT, s.generate_audit as u8);
        w.put_u8(base + AS_GENERATE_ON_CLOSE, s.generate_on_close as u8);
        w.put_u8(base + AS_AUDIT_PRIVILEGES, s.audit_privileges as u8);
        w.put_u32(base + AS_FLAGS, s.flags);
        w.put_u32(base + AS_REMAINING, s.remaining_desired_access);
        w.put_u32(base + AS_PREVIOUSLY_GRANTED, s.previously_granted_access);
        w.put_u32(base + AS_ORIGINAL, s.original_desired_access);

        if let Some(sd) = state.security_descriptor.filter(|sd| !sd.is_empty()) {
            let at = w.append_aligned(sd);
            w.put_u32(base + AS_SD_OFFSET, to_u32(at - base)?);
            w.put_u32(base + AS_SD_LENGTH, to_u32(sd.len())?);
        }

        let at = w.append_aligned(&name_record(state.object_name)?);
        w.put_u32(base + AS_NAME_OFFSET, to_u32(at - base)?);
        let at = w.append_aligned(&name_record(state.object_type)?);
        w.put_u32(base + AS_TYPE_OFFSET, to_u32(at - base)?);
    }

    let mut file_name = utf16le(params.file_name);
    let name_len = to_u32(file_name.len())?;
    file_name.extend_from_slice(&[0, 0]);
    let at = w.append_aligned(&file_name);
    w.put_u32(CREATE_PARAMS_OFFSET + CP_NAME_LENGTH, name_len);
    w.put_u32(CREATE_PARAMS_OFFSET + CP_NAME_OFFSET, to_u32(at - CREATE_PARAMS_OFFSET)?);

    let buf = w.finish();
    debug_assert_eq!(buf.len(), total);
    Ok(buf)
}

/// A `{length, max_length, UTF-16LE bytes, terminator}` record inside an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NameRecord<'a> {
    pub length: u16,
    pub max_length: u16,
    raw: &'a [u8],
}

impl<'a> NameRecord<'a> {
    /// Name bytes without the terminator
    pub fn data(&self) -> &'a [u8] {
        &self.raw[..self.length as usize]
    }

    /// Name bytes followed by the u16 terminator
    pub fn data_with_terminator(&self) -> &'a [u8] {
        self.raw
    }

    pub fn terminator(&self) -> u16 {
        let at = self.length as usize;
        LittleEndian::read_u16(&self.raw[at..at + 2])
    }

    pub fn decode(&self) -> Result<String, ProtoError> {
        decode_utf16(self.data())
    }
}

fn decode_utf16(bytes: &[u8]) -> Result<String, ProtoError> {
    let mut units = vec![0u16; bytes.len() / 2];
    LittleEndian::read_u16_into(&bytes[..units.len() * 2], &mut units);
    String::from_utf16(&units).map_err(|_| ProtoError::BadName)
}

/// Read-only view over an envelope produced by [`build_envelope`]
#[derive(Clone, Copy, Debug)]
pub struct EnvelopeReader<'a> {
    buf: &'a [u8],
}

impl<'a> EnvelopeReader<'a> {
    /// Validate version, bounds and alignment of every sub-record
    pub fn parse(buf: &'a [u8]) -> Result<Self, ProtoError> {
        if buf.len() < CREATE_HEADER_SIZE {
            return Err(ProtoError::Truncated {
                needed: CREATE_HEADER_SIZE,
                available: buf.len(),
            });
        }
        let version = read_u32(buf, OFF_VERSION);
        if version != ENVELOPE_VERSION {
            return Err(ProtoError::BadVersion(version));
        }
        let length = read_u32(buf, OFF_LENGTH) as usize;
        if length > buf.len() || length < CREATE_HEADER_SIZE {
            return Err(ProtoError::Truncated {
                needed: length.max(CREATE_HEADER_SIZE),
                available: buf.len(),
            });
        }

        let reader = Self { buf: &buf[..length] };
        reader.try_file_name_bytes()?;
        reader.try_security_descriptor()?;
        reader.try_record(AS_NAME_OFFSET)?;
        reader.try_record(AS_TYPE_OFFSET)?;
        Ok(reader)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    pub fn header(&self) -> CreateHeader {
        CreateHeader {
            serial: read_u64(self.buf, OFF_SERIAL),
            session_id: read_u64(self.buf, OFF_SESSION),
            process_id: read_u32(self.buf, OFF_PROCESS),
            control_flags: read_u32(self.buf, OFF_CONTROL_FLAGS),
            desired_access: read_u32(self.buf, OFF_DESIRED_ACCESS),
            file_attributes: read_u32(self.buf, OFF_ATTRIBUTES),
            create_options: read_u32(self.buf, OFF_OPTIONS),
            share_access: read_u32(self.buf, OFF_SHARE),
        }
    }

    /// Access-state block, present when the request carried a security context
    pub fn access_state(&self) -> Option<AccessStateHeader> {
        if self.access_field(AS_NAME_OFFSET) == 0 {
            return None;
        }
        let base = ACCESS_STATE_OFFSET;
        Some(AccessStateHeader {
            security_evaluated: self.buf[base + AS_EVALUATED] != 0,
            generate_audit: self.buf[base + AS_GENERATE_AUDIT] != 0,
            generate_on_close: self.buf[base + AS_GENERATE_ON_CLOSE] != 0,
            audit_privileges: self.buf[base + AS_AUDIT_PRIVILEGES] != 0,
            flags: self.access_field(AS_FLAGS),
            remaining_desired_access: self.access_field(AS_REMAINING),
            previously_granted_access: self.access_field(AS_PREVIOUSLY_GRANTED),
            original_desired_access: self.access_field(AS_ORIGINAL),
        })
    }

    pub fn security_descriptor(&self) -> Option<&'a [u8]> {
        self.try_security_descriptor().ok().flatten()
    }

    pub fn object_name(&self) -> Option<NameRecord<'a>> {
        self.try_record(AS_NAME_OFFSET).ok().flatten()
    }

    pub fn object_type(&self) -> Option<NameRecord<'a>> {
        self.try_record(AS_TYPE_OFFSET).ok().flatten()
    }

    /// File name bytes followed by the u16 terminator
    pub fn file_name_bytes(&self) -> &'a [u8] {
        self.try_file_name_bytes().unwrap_or_default()
    }

    pub fn file_name(&self) -> Result<String, ProtoError> {
        let bytes = self.try_file_name_bytes()?;
        decode_utf16(&bytes[..bytes.len() - TERMINATOR_SIZE])
    }

    fn access_field(&self, field: usize) -> u32 {
        read_u32(self.buf, ACCESS_STATE_OFFSET + field)
    }

    fn checked_range(&self, offset: usize, len: usize) -> Result<&'a [u8], ProtoError> {
        if offset < CREATE_HEADER_SIZE || offset % ENVELOPE_ALIGNMENT != 0 {
            return Err(ProtoError::BadOffset { offset });
        }
        let end = offset.checked_add(len).ok_or(ProtoError::BadOffset { offset })?;
        if end > self.buf.len() {
            return Err(ProtoError::BadOffset { offset });
        }
        Ok(&self.buf[offset..end])
    }

    fn try_security_descriptor(&self) -> Result<Option<&'a [u8]>, ProtoError> {
        let rel = self.access_field(AS_SD_OFFSET) as usize;
        if rel == 0 {
            return Ok(None);
        }
        let len = self.access_field(AS_SD_LENGTH) as usize;
        self.checked_range(ACCESS_STATE_OFFSET + rel, len).map(Some)
    }

    fn try_record(&self, field: usize) -> Result<Option<NameRecord<'a>>, ProtoError> {
        let rel = self.access_field(field) as usize;
        if rel == 0 {
            return Ok(None);
        }
        let offset = ACCESS_STATE_OFFSET + rel;
        let prefix = self.checked_range(offset, NAME_RECORD_PREFIX)?;
        let length = LittleEndian::read_u16(&prefix[0..2]);
        let max_length = LittleEndian::read_u16(&prefix[2..4]);
        let raw = self.checked_range(offset, NAME_RECORD_PREFIX + length as usize + TERMINATOR_SIZE)?;
        Ok(Some(NameRecord {
            length,
            max_length,
            raw: &raw[NAME_RECORD_PREFIX..],
        }))
    }

    fn try_file_name_bytes(&self) -> Result<&'a [u8], ProtoError> {
        let len = read_u32(self.buf, CREATE_PARAMS_OFFSET + CP_NAME_LENGTH) as usize;
        let rel = read_u32(self.buf, CREATE_PARAMS_OFFSET + CP_NAME_OFFSET) as usize;
        if len % 2 != 0 {
            return Err(ProtoError::BadName);
        }
        self.checked_range(CREATE_PARAMS_OFFSET + rel, len + TERMINATOR_SIZE)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    LittleEndian::read_u32(&buf[at..at + 4])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    LittleEndian::read_u64(&buf[at..at + 8])
}
