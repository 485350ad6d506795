//! Binary encodings of updates.
//!
//! Both formats are built from the same primitives: LEB128 variable-length unsigned
//! integers, zig-zag signed integers, little-endian floats and length-prefixed UTF-8.

pub(crate) mod v1;
pub(crate) mod v2;

use crate::block::Value;
use crate::error::{Error, Result};

// Value tags, shared by both formats.
const VALUE_NULL: u8 = 126;
const VALUE_INT: u8 = 125;
const VALUE_FLOAT: u8 = 123;
const VALUE_FALSE: u8 = 121;
const VALUE_TRUE: u8 = 120;
const VALUE_STRING: u8 = 119;
const VALUE_BYTES: u8 = 116;

#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub(crate) fn write_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    pub(crate) fn write_var_u64(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    pub(crate) fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(u64::from(value));
    }

    pub(crate) fn write_var_usize(&mut self, value: usize) {
        self.write_var_u64(value as u64);
    }

    /// Zig-zag, so small negative numbers stay small.
    pub(crate) fn write_var_i64(&mut self, value: i64) {
        self.write_var_u64(((value << 1) ^ (value >> 63)) as u64);
    }

    pub(crate) fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_var_usize(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    pub(crate) fn write_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.write_u8(VALUE_NULL),
            Value::Bool(false) => self.write_u8(VALUE_FALSE),
            Value::Bool(true) => self.write_u8(VALUE_TRUE),
            Value::Int(n) => {
                self.write_u8(VALUE_INT);
                self.write_var_i64(*n);
            }
            Value::Float(f) => {
                self.write_u8(VALUE_FLOAT);
                self.write_f64(*f);
            }
            Value::String(s) => {
                self.write_u8(VALUE_STRING);
                self.write_str(s);
            }
            Value::Bytes(b) => {
                self.write_u8(VALUE_BYTES);
                self.write_bytes(b);
            }
        }
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

fn truncated() -> Error {
    Error::MalformedUpdate("unexpected end of buffer".into())
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reject trailing bytes after a complete message.
    pub(crate) fn finish(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::MalformedUpdate(format!("{n} trailing bytes"))),
        }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or_else(truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(truncated());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn read_var_u64(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let bits = u64::from(byte & 0x7f);
            if (shift == 63 && bits > 1) || shift > 63 {
                return Err(Error::MalformedUpdate("varint overflows 64 bits".into()));
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub(crate) fn read_var_u32(&mut self) -> Result<u32> {
        let value = self.read_var_u64()?;
        u32::try_from(value)
            .map_err(|_| Error::MalformedUpdate(format!("value {value} does not fit in 32 bits")))
    }

    /// A collection length, bounded by the bytes left so hostile input cannot force a
    /// huge allocation.
    pub(crate) fn read_count(&mut self) -> Result<usize> {
        let count = self.read_var_u64()?;
        if count > self.remaining() as u64 {
            return Err(Error::MalformedUpdate(format!(
                "count {count} exceeds remaining input"
            )));
        }
        Ok(count as usize)
    }

    pub(crate) fn read_var_i64(&mut self) -> Result<i64> {
        let raw = self.read_var_u64()?;
        Ok((raw >> 1) as i64 ^ -((raw & 1) as i64))
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(raw))
    }

    pub(crate) fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_count()?;
        self.take(len)
    }

    pub(crate) fn read_str(&mut self) -> Result<&'a str> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map_err(|e| Error::MalformedUpdate(format!("invalid utf-8: {e}")))
    }

    pub(crate) fn read_value(&mut self) -> Result<Value> {
        match self.read_u8()? {
            VALUE_NULL => Ok(Value::Null),
            VALUE_FALSE => Ok(Value::Bool(false)),
            VALUE_TRUE => Ok(Value::Bool(true)),
            VALUE_INT => Ok(Value::Int(self.read_var_i64()?)),
            VALUE_FLOAT => Ok(Value::Float(self.read_f64()?)),
            VALUE_STRING => Ok(Value::String(self.read_str()?.to_owned())),
            VALUE_BYTES => Ok(Value::Bytes(self.read_bytes()?.to_vec())),
            tag => Err(Error::MalformedUpdate(format!("unknown value tag {tag}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varints_roundtrip_at_boundaries() {
        let samples = [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX];
        let mut w = Writer::new();
        for &n in &samples {
            w.write_var_u64(n);
        }
        let bytes = w.into_inner();
        let mut r = Reader::new(&bytes);
        for &n in &samples {
            assert_eq!(r.read_var_u64().unwrap(), n);
        }
        r.finish().unwrap();
    }

    #[test]
    fn zigzag_keeps_small_negatives_short() {
        let mut w = Writer::new();
        w.write_var_i64(-1);
        w.write_var_i64(i64::MIN);
        let bytes = w.into_inner();
        assert_eq!(bytes[0], 1);
        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_var_i64().unwrap(), -1);
        assert_eq!(r.read_var_i64().unwrap(), i64::MIN);
    }

    #[test]
    fn overlong_varint_is_rejected() {
        let bytes = [0xffu8; 11];
        let mut r = Reader::new(&bytes);
        assert!(matches!(r.read_var_u64(), Err(Error::MalformedUpdate(_))));
    }

    #[test]
    fn truncated_and_invalid_strings_are_rejected() {
        let mut r = Reader::new(&[5, b'a', b'b']);
        assert!(matches!(r.read_str(), Err(Error::MalformedUpdate(_))));
        let mut r = Reader::new(&[2, 0xc3, 0x28]);
        assert!(matches!(r.read_str(), Err(Error::MalformedUpdate(_))));
    }

    #[test]
    fn trailing_bytes_fail_finish() {
        let mut r = Reader::new(&[1, 2]);
        r.read_u8().unwrap();
        assert!(r.finish().is_err());
    }
}
