use std::io::{self, ErrorKind};

/// Growable in-memory byte buffer with big-endian integer helpers.
///
/// All multi-byte integers in the capture file format are big-endian, and
/// several structures are "sized": a 4-byte length prefix followed by that
/// many bytes. This buffer is the single place where both conventions live.
#[derive(Debug, Default, Clone)]
pub struct ByteStream {
    buf: Vec<u8>,
    pos: usize,
}

impl ByteStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps existing bytes; the position starts at 0.
    #[must_use]
    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn seek_to_end(&mut self) {
        self.pos = self.buf.len();
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        if self.pos == self.buf.len() {
            self.buf.extend_from_slice(bytes);
        } else {
            // Overwrite-in-place semantics, extending if the write runs past
            // the current end.
            let overlap = bytes.len().min(self.buf.len() - self.pos);
            self.buf[self.pos..self.pos + overlap].copy_from_slice(&bytes[..overlap]);
            self.buf.extend_from_slice(&bytes[overlap..]);
        }
        self.pos = end;
    }

    pub fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_be_bytes());
    }

    /// 4-byte big-endian length prefix, then the bytes themselves.
    pub fn write_sized(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.write_bytes(data);
    }

    /// Writes zeros until the position reaches `end`. A no-op if the position
    /// is already at or past `end`.
    pub fn zero_fill_to(&mut self, end: usize) {
        if end > self.pos {
            self.write_bytes(&vec![0u8; end - self.pos]);
        }
    }

    fn take(&mut self, n: usize) -> io::Result<&[u8]> {
        if self.pos + n > self.buf.len() {
            return Err(ErrorKind::UnexpectedEof.into());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn next_u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn next_u32(&mut self) -> io::Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub fn next_u64(&mut self) -> io::Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("8-byte slice")))
    }

    pub fn next_sized(&mut self) -> io::Result<Vec<u8>> {
        let size = self.next_u32()? as usize;
        Ok(self.take(size)?.to_vec())
    }
}
