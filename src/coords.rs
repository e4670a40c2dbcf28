use std::io;

use crate::stream::ByteStream;

/// Two-dimensional address of a datum inside a capture file.
///
/// The first axis is the absolute file position of the size-prefixed
/// compressed block holding the datum; the second is the datum's offset
/// within that block once decompressed. A block start equal to the writer's
/// current `file_limit` addresses the still-uncompressed in-memory buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DataCoordinates {
    /// Start position of the compressed block in the capture file.
    pub compressed_block_start: u64,
    /// Position of the datum within the uncompressed block.
    pub data_start: u32,
}

impl DataCoordinates {
    /// Encoded size: big-endian `(u64, u32)`.
    pub const SIZE: usize = 12;

    /// Encoded size with the one-byte height prefix used inside the master
    /// node's rightmost-path serialization.
    pub const HEIGHT_PREFIXED_SIZE: usize = 13;

    #[must_use]
    pub const fn new(compressed_block_start: u64, data_start: u32) -> Self {
        Self { compressed_block_start, data_start }
    }

    #[must_use]
    pub const fn null() -> Self {
        Self::new(0, 0)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.compressed_block_start == 0 && self.data_start == 0
    }

    pub fn write_to(&self, stream: &mut ByteStream) {
        stream.write_u64(self.compressed_block_start);
        stream.write_u32(self.data_start);
    }

    pub fn read_from(stream: &mut ByteStream) -> io::Result<Self> {
        let compressed_block_start = stream.next_u64()?;
        let data_start = stream.next_u32()?;
        Ok(Self { compressed_block_start, data_start })
    }

    /// Decodes the 12-byte form at `offset` within `block`.
    pub fn from_slice(block: &[u8], offset: usize) -> io::Result<Self> {
        let bytes = block
            .get(offset..offset + Self::SIZE)
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        Ok(Self {
            compressed_block_start: u64::from_be_bytes(bytes[..8].try_into().expect("8 bytes")),
            data_start: u32::from_be_bytes(bytes[8..].try_into().expect("4 bytes")),
        })
    }

    /// Decodes the 13-byte `(height, u64, u32)` form used in the master node.
    pub fn read_height_prefixed(stream: &mut ByteStream) -> io::Result<(u8, Self)> {
        let height = stream.next_u8()?;
        Ok((height, Self::read_from(stream)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trip() {
        let coords = DataCoordinates::new(0x1_0000_0001, 42);
        let mut stream = ByteStream::new();
        coords.write_to(&mut stream);
        assert_eq!(stream.len(), DataCoordinates::SIZE);

        let decoded = DataCoordinates::from_slice(stream.as_slice(), 0).unwrap();
        assert_eq!(decoded, coords);

        let mut stream = ByteStream::from_vec(stream.into_vec());
        assert_eq!(DataCoordinates::read_from(&mut stream).unwrap(), coords);
    }

    #[test]
    fn null_is_both_fields_zero() {
        assert!(DataCoordinates::null().is_null());
        assert!(!DataCoordinates::new(0, 1).is_null());
        assert!(!DataCoordinates::new(1, 0).is_null());
    }
}
