//! Deterministic, big-endian, length-prefixed binary primitives.
//!
//! Every signed object is serialized by hand rather than through a generic
//! derive: the signed bytes must be byte-exact, because the object's id is
//! defined only by `raw()` (spec §9, "deterministic serialization"). A
//! generic serde-based encoding would not give us that guarantee across
//! library versions, so `Writer`/`Reader` stay hand-rolled.

use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Length in bytes of every hash/id used by the core.
pub const HASH_LEN: usize = 32;
/// Length in bytes of a UUID.
pub const UUID_LEN: usize = 16;
/// The all-zero id, meaning "no predecessor".
pub const SENTINEL: [u8; HASH_LEN] = [0u8; HASH_LEN];

/// A 32-byte content-addressed id (operation or block).
pub type Id = [u8; HASH_LEN];

/// `double_sha(b) = SHA256(SHA256(b))`.
pub fn double_sha256(bytes: &[u8]) -> [u8; HASH_LEN] {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&second);
    out
}

/// Appends big-endian, length-prefixed primitives to an in-progress buffer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_fixed(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn write_sized(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_u32(bytes.len() as u32);
        self.write_fixed(bytes)
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.write_sized(s.as_bytes())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

/// Reads big-endian, length-prefixed primitives out of a byte slice,
/// tracking a cursor. Reading past the end fails with `RawFormat`.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreError> {
        if self.pos + n > self.buf.len() {
            return Err(CoreError::RawFormat("raw input too short".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32, CoreError> {
        let slice = self.take(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(slice);
        Ok(u32::from_be_bytes(arr))
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], CoreError> {
        let slice = self.take(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(slice);
        Ok(arr)
    }

    pub fn read_sized(&mut self) -> Result<Vec<u8>, CoreError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Current byte offset of the read cursor.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn read_string(&mut self) -> Result<String, CoreError> {
        let bytes = self.read_sized()?;
        String::from_utf8(bytes).map_err(|_| CoreError::RawFormat("invalid utf-8 string".into()))
    }

    /// Fails with `RawFormat("raw input too long")` if bytes remain.
    pub fn finish(self) -> Result<(), CoreError> {
        if self.pos != self.buf.len() {
            Err(CoreError::RawFormat("raw input too long".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let mut w = Writer::new();
        w.write_u32(7).write_fixed(&[1, 2, 3]).write_string("hi");
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_fixed::<3>().unwrap(), [1, 2, 3]);
        assert_eq!(r.read_string().unwrap(), "hi");
        r.finish().unwrap();
    }

    #[test]
    fn too_short_is_raw_format() {
        let mut r = Reader::new(&[0, 0, 0]);
        assert!(matches!(r.read_u32(), Err(CoreError::RawFormat(_))));
    }

    #[test]
    fn trailing_bytes_is_raw_format() {
        let mut w = Writer::new();
        w.write_u32(1);
        let mut bytes = w.into_bytes();
        bytes.push(0);
        let mut r = Reader::new(&bytes);
        r.read_u32().unwrap();
        assert!(matches!(r.finish(), Err(CoreError::RawFormat(_))));
    }

    #[test]
    fn double_sha_is_deterministic_and_sensitive() {
        let a = double_sha256(b"hello");
        let b = double_sha256(b"hello");
        let c = double_sha256(b"hellp");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
