//! Chunk constant pool.

use crate::encoder::{EncodeError, Reader, Writer};
use std::collections::HashMap;

/// A single entry in a chunk's constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i32),
    Float(f64),
    Str(String),
}

const TAG_NIL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;

/// The constants referenced by `LOAD_CONST`, `GET_GLOBAL`, struct field
/// names, and similar `Bx`-indexed operands. Strings are interned: pushing
/// the same string twice returns the same index.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    entries: Vec<Constant>,
    string_index: HashMap<String, u16>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u16) -> Option<&Constant> {
        self.entries.get(index as usize)
    }

    /// Append a non-string constant, returning its index. Does not dedup —
    /// callers wanting interning for strings should use [`ConstantPool::intern_str`].
    pub fn push(&mut self, constant: Constant) -> u16 {
        let idx = self.entries.len();
        assert!(idx <= u16::MAX as usize, "constant pool overflow");
        self.entries.push(constant);
        idx as u16
    }

    /// Intern a string, returning the existing index if already present.
    pub fn intern_str(&mut self, s: &str) -> u16 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.push(Constant::Str(s.to_string()));
        self.string_index.insert(s.to_string(), idx);
        idx
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constant> {
        self.entries.iter()
    }

    pub(crate) fn encode(&self, w: &mut Writer) {
        w.emit_u32(self.entries.len() as u32);
        for c in &self.entries {
            match c {
                Constant::Nil => w.emit_u8(TAG_NIL),
                Constant::Bool(b) => {
                    w.emit_u8(TAG_BOOL);
                    w.emit_u8(*b as u8);
                }
                Constant::Int(i) => {
                    w.emit_u8(TAG_INT);
                    w.emit_i32(*i);
                }
                Constant::Float(f) => {
                    w.emit_u8(TAG_FLOAT);
                    w.emit_f64(*f);
                }
                Constant::Str(s) => {
                    w.emit_u8(TAG_STR);
                    w.emit_str(s);
                }
            }
        }
    }

    pub(crate) fn decode(r: &mut Reader) -> Result<Self, EncodeError> {
        let count = r.read_u32()? as usize;
        let mut pool = ConstantPool {
            entries: Vec::with_capacity(count),
            string_index: HashMap::new(),
        };
        for _ in 0..count {
            let tag = r.read_u8()?;
            let constant = match tag {
                TAG_NIL => Constant::Nil,
                TAG_BOOL => Constant::Bool(r.read_u8()? != 0),
                TAG_INT => Constant::Int(r.read_i32()?),
                TAG_FLOAT => Constant::Float(r.read_f64()?),
                TAG_STR => Constant::Str(r.read_str()?),
                other => return Err(EncodeError::InvalidConstantTag(other, r.position())),
            };
            if let Constant::Str(s) = &constant {
                let idx = pool.entries.len() as u16;
                pool.string_index.entry(s.clone()).or_insert(idx);
            }
            pool.entries.push(constant);
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups_strings() {
        let mut pool = ConstantPool::new();
        let a = pool.intern_str("hello");
        let b = pool.intern_str("hello");
        let c = pool.intern_str("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut pool = ConstantPool::new();
        pool.push(Constant::Nil);
        pool.push(Constant::Bool(true));
        pool.push(Constant::Int(-42));
        pool.push(Constant::Float(2.5));
        pool.intern_str("name");

        let mut w = Writer::new();
        pool.encode(&mut w);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        let decoded = ConstantPool::decode(&mut r).unwrap();
        assert_eq!(decoded.len(), 5);
        assert_eq!(decoded.get(0), Some(&Constant::Nil));
        assert_eq!(decoded.get(2), Some(&Constant::Int(-42)));
        assert_eq!(decoded.get(4), Some(&Constant::Str("name".to_string())));
    }
}
