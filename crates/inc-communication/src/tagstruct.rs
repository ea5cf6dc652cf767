//! Self-describing, ordered typed payload used for method-call arguments,
//! replies, and event data. Each field is written as a one-byte type tag
//! followed by its value; reads check the tag before consuming and leave the
//! cursor untouched on mismatch, so a caller can probe a field's type without
//! losing its place.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::TagError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    U8 = 1,
    U16 = 2,
    U32 = 3,
    U64 = 4,
    I32 = 5,
    I64 = 6,
    Bool = 7,
    String = 8,
    Bytes = 9,
    Double = 10,
}

impl Tag {
    fn from_byte(b: u8) -> Option<Tag> {
        Some(match b {
            1 => Tag::U8,
            2 => Tag::U16,
            3 => Tag::U32,
            4 => Tag::U64,
            5 => Tag::I32,
            6 => Tag::I64,
            7 => Tag::Bool,
            8 => Tag::String,
            9 => Tag::Bytes,
            10 => Tag::Double,
            _ => return None,
        })
    }
}

/// Forward-read, forward-written typed field stream. Read and write cursors
/// are independent: `rewind` resets only the read side, `clear` empties both.
#[derive(Debug, Default, Clone)]
pub struct TagStruct {
    buf: BytesMut,
    read_pos: usize,
}

impl TagStruct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self { buf: BytesMut::from(bytes), read_pos: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.read_pos = 0;
    }

    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    /// Bytes not yet consumed by `get_*`. Useful when a sender packs an
    /// initial fixed field (e.g. an event name) ahead of an opaque tail the
    /// caller decodes separately.
    pub fn remaining_bytes(&self) -> &[u8] {
        &self.buf[self.read_pos..]
    }

    pub fn eof(&self) -> bool {
        self.read_pos >= self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.read_pos)
    }

    fn peek_tag(&self) -> Option<Tag> {
        self.buf.get(self.read_pos).copied().and_then(Tag::from_byte)
    }

    fn expect(&mut self, tag: Tag) -> Result<(), TagError> {
        match self.peek_tag() {
            Some(found) if found == tag => {
                self.read_pos += 1;
                Ok(())
            }
            Some(found) => Err(TagError::TypeMismatch { expected: tag, found }),
            None if self.remaining() == 0 => Err(TagError::Underflow),
            None => Err(TagError::TypeMismatch { expected: tag, found: tag }),
        }
    }

    fn take(&mut self, n: usize) -> Result<&[u8], TagError> {
        if self.remaining() < n {
            return Err(TagError::Underflow);
        }
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.buf[start..self.read_pos])
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(Tag::U8 as u8);
        self.buf.put_u8(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u8(Tag::U16 as u8);
        self.buf.put_u16(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u8(Tag::U32 as u8);
        self.buf.put_u32(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u8(Tag::U64 as u8);
        self.buf.put_u64(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_u8(Tag::I32 as u8);
        self.buf.put_i32(v);
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_u8(Tag::I64 as u8);
        self.buf.put_i64(v);
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.buf.put_u8(Tag::Bool as u8);
        self.buf.put_u8(v as u8);
        self
    }

    pub fn put_double(&mut self, v: f64) -> &mut Self {
        self.buf.put_u8(Tag::Double as u8);
        self.buf.put_f64(v);
        self
    }

    pub fn put_string(&mut self, v: &str) -> &mut Self {
        self.buf.put_u8(Tag::String as u8);
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v.as_bytes());
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_u8(Tag::Bytes as u8);
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
        self
    }

    pub fn get_u8(&mut self) -> Result<u8, TagError> {
        self.expect(Tag::U8)?;
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, TagError> {
        self.expect(Tag::U16)?;
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, TagError> {
        self.expect(Tag::U32)?;
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, TagError> {
        self.expect(Tag::U64)?;
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32, TagError> {
        self.expect(Tag::I32)?;
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64, TagError> {
        self.expect(Tag::I64)?;
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bool(&mut self) -> Result<bool, TagError> {
        self.expect(Tag::Bool)?;
        Ok(self.take(1)?[0] != 0)
    }

    pub fn get_double(&mut self) -> Result<f64, TagError> {
        self.expect(Tag::Double)?;
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_string(&mut self) -> Result<String, TagError> {
        self.expect(Tag::String)?;
        let len = u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| TagError::InvalidUtf8)
    }

    pub fn get_bytes(&mut self) -> Result<Vec<u8>, TagError> {
        self.expect(Tag::Bytes)?;
        let len = u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Debug dump sufficient to reconstruct field types and sizes without
    /// decoding values.
    pub fn dump(&self) -> String {
        let mut cursor = self.buf.clone().freeze();
        let mut out = String::new();
        while cursor.has_remaining() {
            let Some(tag) = Tag::from_byte(cursor.get_u8()) else { break };
            let size = match tag {
                Tag::U8 | Tag::Bool => 1,
                Tag::U16 => 2,
                Tag::U32 | Tag::I32 => 4,
                Tag::U64 | Tag::I64 | Tag::Double => 8,
                Tag::String | Tag::Bytes => {
                    if cursor.remaining() < 4 {
                        break;
                    }
                    let len = cursor.get_u32() as usize;
                    out.push_str(&format!("{tag:?}({len}) "));
                    if cursor.remaining() < len {
                        break;
                    }
                    cursor.advance(len);
                    continue;
                }
            };
            if cursor.remaining() < size {
                break;
            }
            out.push_str(&format!("{tag:?} "));
            cursor.advance(size);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_scalar_type() {
        let mut ts = TagStruct::new();
        ts.put_u8(7).put_u32(42).put_i64(-9).put_bool(true).put_string("hi").put_double(1.5);

        let mut read = TagStruct::from_bytes(ts.as_bytes());
        assert_eq!(read.get_u8().unwrap(), 7);
        assert_eq!(read.get_u32().unwrap(), 42);
        assert_eq!(read.get_i64().unwrap(), -9);
        assert!(read.get_bool().unwrap());
        assert_eq!(read.get_string().unwrap(), "hi");
        assert_eq!(read.get_double().unwrap(), 1.5);
        assert!(read.eof());
    }

    #[test]
    fn wrong_tag_does_not_advance_cursor() {
        let mut ts = TagStruct::new();
        ts.put_u32(5);
        let mut read = TagStruct::from_bytes(ts.as_bytes());
        assert!(matches!(read.get_string(), Err(TagError::TypeMismatch { .. })));
        assert_eq!(read.get_u32().unwrap(), 5);
    }

    #[test]
    fn rewind_replays_the_same_values() {
        let mut ts = TagStruct::new();
        ts.put_u16(3).put_bytes(b"abc");
        let mut read = TagStruct::from_bytes(ts.as_bytes());
        assert_eq!(read.get_u16().unwrap(), 3);
        assert_eq!(read.get_bytes().unwrap(), b"abc");
        read.rewind();
        assert_eq!(read.get_u16().unwrap(), 3);
        assert_eq!(read.get_bytes().unwrap(), b"abc");
    }
}
