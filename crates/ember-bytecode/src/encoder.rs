//! Low-level byte-buffer reader/writer used to (de)serialize a [`Chunk`](crate::Chunk).

use crate::opcode::Instr;
use thiserror::Error;

/// Errors that can occur while decoding a byte buffer into a chunk.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Ran off the end of the buffer while reading a fixed-size field.
    #[error("unexpected end of bytecode stream at offset {0}")]
    UnexpectedEnd(usize),
    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),
    /// A constant-pool entry carried an unrecognized type tag.
    #[error("invalid constant tag {0} at offset {1}")]
    InvalidConstantTag(u8, usize),
}

/// Append-only byte buffer with little-endian integer emission helpers.
pub struct Writer {
    pub(crate) buffer: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn emit_u8(&mut self, v: u8) {
        self.buffer.push(v);
    }

    pub fn emit_u16(&mut self, v: u16) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_u32(&mut self, v: u32) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_i32(&mut self, v: i32) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_f64(&mut self, v: f64) {
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_str(&mut self, s: &str) {
        self.emit_u32(s.len() as u32);
        self.buffer.extend_from_slice(s.as_bytes());
    }

    /// Emit a whole instruction word.
    pub fn emit_instr(&mut self, instr: Instr) {
        self.emit_u32(instr.raw());
    }

    /// Reserve four bytes for a value to be filled in later via [`Writer::patch_u32`].
    pub fn reserve_u32(&mut self) -> usize {
        let at = self.offset();
        self.emit_u32(0);
        at
    }

    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.buffer[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a byte slice with bounds-checked little-endian reads.
pub struct Reader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn need(&self, n: usize) -> Result<(), EncodeError> {
        if self.position + n > self.buffer.len() {
            Err(EncodeError::UnexpectedEnd(self.position))
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, EncodeError> {
        self.need(1)?;
        let v = self.buffer[self.position];
        self.position += 1;
        Ok(v)
    }

    pub fn read_u16(&mut self) -> Result<u16, EncodeError> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.buffer[self.position..self.position + 2].try_into().unwrap());
        self.position += 2;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32, EncodeError> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buffer[self.position..self.position + 4].try_into().unwrap());
        self.position += 4;
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32, EncodeError> {
        self.need(4)?;
        let v = i32::from_le_bytes(self.buffer[self.position..self.position + 4].try_into().unwrap());
        self.position += 4;
        Ok(v)
    }

    pub fn read_f64(&mut self) -> Result<f64, EncodeError> {
        self.need(8)?;
        let v = f64::from_le_bytes(self.buffer[self.position..self.position + 8].try_into().unwrap());
        self.position += 8;
        Ok(v)
    }

    pub fn read_str(&mut self) -> Result<String, EncodeError> {
        let len = self.read_u32()? as usize;
        self.need(len)?;
        let bytes = &self.buffer[self.position..self.position + len];
        let start = self.position;
        self.position += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| EncodeError::InvalidUtf8(start))
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, EncodeError> {
        self.need(count)?;
        let bytes = self.buffer[self.position..self.position + count].to_vec();
        self.position += count;
        Ok(bytes)
    }

    pub fn read_instr(&mut self) -> Result<Instr, EncodeError> {
        Ok(Instr::from_raw(self.read_u32()?))
    }
}

/// Serialize a chunk to its on-disk byte representation.
pub fn write_module(chunk: &crate::Chunk) -> Vec<u8> {
    chunk.encode()
}

/// Parse a chunk from its on-disk byte representation.
pub fn read_module(bytes: &[u8]) -> Result<crate::Chunk, crate::ModuleError> {
    crate::Chunk::decode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let mut w = Writer::new();
        w.emit_u8(1);
        w.emit_u16(0x2030);
        w.emit_u32(0x4050_6070);
        w.emit_i32(-5);
        w.emit_f64(3.5);
        w.emit_str("hi");
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u8().unwrap(), 1);
        assert_eq!(r.read_u16().unwrap(), 0x2030);
        assert_eq!(r.read_u32().unwrap(), 0x4050_6070);
        assert_eq!(r.read_i32().unwrap(), -5);
        assert_eq!(r.read_f64().unwrap(), 3.5);
        assert_eq!(r.read_str().unwrap(), "hi");
    }

    #[test]
    fn reading_past_end_errors() {
        let bytes = [0u8; 2];
        let mut r = Reader::new(&bytes);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn patch_u32_overwrites_reserved_slot() {
        let mut w = Writer::new();
        let at = w.reserve_u32();
        w.emit_u8(0xAA);
        w.patch_u32(at, 0xDEAD_BEEF);
        let bytes = w.into_bytes();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
    }
}
