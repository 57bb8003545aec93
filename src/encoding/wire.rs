//! # Wire Format Helpers
//!
//! Minimal protobuf-style field encoding used by the persisted metadata
//! records and the hash slot records. A field is a varint tag
//! `(field_number << 3) | wire_type` followed by its payload:
//!
//! ```text
//! wire type 0 (varint):  tag | varint value
//! wire type 1 (fixed64): tag | 8 bytes little-endian
//! wire type 2 (bytes):   tag | varint length | payload
//! ```
//!
//! Zero-valued varint and fixed64 fields are omitted by the writers, and
//! readers default them to zero, which is what makes the slot record's
//! trailing `value_size = 0` and the short-key `key_sum = 0` optimizations
//! free on disk.
//!
//! Unknown fields are not tolerated: this format is written and read only by
//! this crate, so an unexpected tag means the region is corrupted.

use eyre::{bail, ensure, Result};

use super::varint::{decode_uvarint, put_uvarint};

pub const WIRE_VARINT: u64 = 0;
pub const WIRE_FIXED64: u64 = 1;
pub const WIRE_BYTES: u64 = 2;

pub fn put_tag(out: &mut Vec<u8>, field: u64, wire_type: u64) {
    put_uvarint(out, (field << 3) | wire_type);
}

/// Appends a varint field, omitting it entirely when the value is zero.
pub fn put_uvarint_field(out: &mut Vec<u8>, field: u64, value: u64) {
    if value == 0 {
        return;
    }
    put_tag(out, field, WIRE_VARINT);
    put_uvarint(out, value);
}

/// Appends an int64 field using two's-complement varint encoding.
pub fn put_int64_field(out: &mut Vec<u8>, field: u64, value: i64) {
    put_uvarint_field(out, field, value as u64);
}

/// Appends a fixed64 field, omitting it entirely when the value is zero.
pub fn put_fixed64_field(out: &mut Vec<u8>, field: u64, value: u64) {
    if value == 0 {
        return;
    }
    put_tag(out, field, WIRE_FIXED64);
    out.extend_from_slice(&value.to_le_bytes());
}

/// Appends a length-delimited bytes field (written even when empty).
pub fn put_bytes_field(out: &mut Vec<u8>, field: u64, payload: &[u8]) {
    put_tag(out, field, WIRE_BYTES);
    put_uvarint(out, payload.len() as u64);
    out.extend_from_slice(payload);
}

/// Cursor over an encoded message body.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Reads the next field tag, or None at end of message.
    pub fn next_tag(&mut self) -> Result<Option<(u64, u64)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let (tag, n) = decode_uvarint(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(Some((tag >> 3, tag & 0x7)))
    }

    pub fn read_uvarint(&mut self) -> Result<u64> {
        let (value, n) = decode_uvarint(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(value)
    }

    pub fn read_int64(&mut self) -> Result<i64> {
        Ok(self.read_uvarint()? as i64)
    }

    pub fn read_fixed64(&mut self) -> Result<u64> {
        ensure!(
            self.pos + 8 <= self.buf.len(),
            "truncated fixed64 field at offset {}",
            self.pos
        );
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_uvarint()? as usize;
        ensure!(
            self.pos + len <= self.buf.len(),
            "truncated bytes field: need {} bytes, have {}",
            len,
            self.buf.len() - self.pos
        );
        let payload = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(payload)
    }
}

/// Rejects a field the decoder does not know about.
pub fn unknown_field(message: &str, field: u64) -> eyre::Report {
    eyre::eyre!("unknown field {} in {} record", field, message)
}

/// Rejects a field carried with the wrong wire type.
pub fn check_wire_type(message: &str, field: u64, got: u64, want: u64) -> Result<()> {
    if got != want {
        bail!(
            "field {} in {} record has wire type {} (expected {})",
            field,
            message,
            got,
            want
        );
    }
    Ok(())
}
