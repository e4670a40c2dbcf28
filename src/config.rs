use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::errors::{CaptureFileError, Result};

/// File-type magic at offset 0.
pub const CAPTURE_FILE_TYPE: &[u8; 11] = b"MioCapture\0";
/// Older name once used in the header; still accepted on read.
pub const LEGACY_CAPTURE_FILE_TYPE: &[u8; 11] = b"WebCapture\0";

/// Highest file-format version this code can read and write.
pub const CURRENT_VERSION: u32 = 2;

const HEADER_SIZE: usize = CAPTURE_FILE_TYPE.len() + 4 * 4;

/// The persistent configuration stored in the first bytes of a capture
/// file, plus the geometry derived from it.
///
/// The entire first page is reserved for this header even though only a few
/// bytes are used; it is written once at creation and never rewritten, which
/// is also what makes offset 0 a safe place to park the file position before
/// a truncate.
#[derive(Debug, Clone)]
pub struct CaptureFileConfiguration {
    /// Version recorded in the file. Newer code reads older files; a file
    /// with a version above [`CURRENT_VERSION`] is rejected.
    pub version: u32,
    /// Minimum I/O granule for appending data.
    pub page_size: u32,
    /// Once the in-memory buffer reaches this many bytes it is compressed
    /// and written out. Must be a multiple of `page_size`.
    pub compression_block_size: u32,
    /// Maximum children per index-tree node.
    pub fan_out: u32,

    pub master_node_size: u32,
    /// Absolute start positions of the two master-node slots.
    pub master_node_positions: [u64; 2],
    /// First data byte of a freshly created file: the byte after the second
    /// master slot.
    pub initial_file_limit: u64,
}

impl Default for CaptureFileConfiguration {
    fn default() -> Self {
        Self::new(CURRENT_VERSION, 4096, 32768, 32)
    }
}

impl CaptureFileConfiguration {
    #[must_use]
    pub fn new(version: u32, page_size: u32, compression_block_size: u32, fan_out: u32) -> Self {
        assert_eq!(
            compression_block_size % page_size,
            0,
            "compression block size must be a multiple of page size"
        );
        assert!(
            u64::from(page_size) * 2 + u64::from(compression_block_size) <= u64::from(u32::MAX),
            "master node size must fit in a u32"
        );
        let master_node_size = page_size * 2 + compression_block_size;
        let master_node_positions =
            [u64::from(page_size), u64::from(page_size) + u64::from(master_node_size)];
        let initial_file_limit = master_node_positions[1] + u64::from(master_node_size);
        Self {
            version,
            page_size,
            compression_block_size,
            fan_out,
            master_node_size,
            master_node_positions,
            initial_file_limit,
        }
    }

    /// Reads and validates the fixed header at offset 0.
    pub fn read(file: &File) -> Result<Self> {
        let mut file = file;
        file.seek(SeekFrom::Start(0))?;
        let mut buffer = [0u8; HEADER_SIZE];
        file.read_exact(&mut buffer)?;

        let magic = &buffer[..CAPTURE_FILE_TYPE.len()];
        if magic != CAPTURE_FILE_TYPE && magic != LEGACY_CAPTURE_FILE_TYPE {
            return Err(CaptureFileError::Invalid("not a valid capture file".into()));
        }

        let mut fields = [0u32; 4];
        for (index, field) in fields.iter_mut().enumerate() {
            let start = CAPTURE_FILE_TYPE.len() + index * 4;
            *field = u32::from_be_bytes(buffer[start..start + 4].try_into().expect("4 bytes"));
        }
        let [version, page_size, compression_block_size, fan_out] = fields;

        if version > CURRENT_VERSION {
            return Err(CaptureFileError::Invalid(format!(
                "file uses format version {version}; the highest supported version is \
                 {CURRENT_VERSION}"
            )));
        }
        if page_size == 0
            || fan_out == 0
            || compression_block_size == 0
            || compression_block_size % page_size != 0
            || u64::from(page_size) * 2 + u64::from(compression_block_size)
                > u64::from(u32::MAX)
        {
            return Err(CaptureFileError::Invalid("corrupt configuration header".into()));
        }

        Ok(Self::new(version, page_size, compression_block_size, fan_out))
    }

    /// Writes the header page and zero-fills through both master slots, so a
    /// new file starts exactly `initial_file_limit` bytes long.
    pub fn write(&self, file: &File) -> Result<()> {
        let mut buffer = vec![0u8; self.initial_file_limit as usize];
        buffer[..CAPTURE_FILE_TYPE.len()].copy_from_slice(CAPTURE_FILE_TYPE);
        for (index, value) in
            [CURRENT_VERSION, self.page_size, self.compression_block_size, self.fan_out]
                .into_iter()
                .enumerate()
        {
            let start = CAPTURE_FILE_TYPE.len() + index * 4;
            buffer[start..start + 4].copy_from_slice(&value.to_be_bytes());
        }
        let mut file = file;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buffer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn default_geometry() {
        let config = CaptureFileConfiguration::default();
        assert_eq!(config.master_node_size, 40960);
        assert_eq!(config.master_node_positions, [4096, 45056]);
        assert_eq!(config.initial_file_limit, 86016);
    }

    #[test]
    fn header_round_trip() {
        let file = tempfile::tempfile().unwrap();
        let config = CaptureFileConfiguration::default();
        config.write(&file).unwrap();

        let read_back = CaptureFileConfiguration::read(&file).unwrap();
        assert_eq!(read_back.version, CURRENT_VERSION);
        assert_eq!(read_back.page_size, 4096);
        assert_eq!(read_back.compression_block_size, 32768);
        assert_eq!(read_back.fan_out, 32);
    }

    #[test]
    fn rejects_unknown_magic() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"NotCapture\0\0\0\0\x02\0\0\x10\0\0\0\x80\0\0\0\0\x20").unwrap();
        let err = CaptureFileConfiguration::read(&file).unwrap_err();
        assert!(matches!(err, CaptureFileError::Invalid(_)));
    }

    #[test]
    fn rejects_geometry_that_overflows_the_master_node_size() {
        // A multiple-of-page-size block size can still push the master node
        // size past u32; that is corruption, not a panic.
        let mut file = tempfile::tempfile().unwrap();
        let mut header = Vec::new();
        header.extend_from_slice(CAPTURE_FILE_TYPE);
        for value in [CURRENT_VERSION, 0x8000_0000, 0x8000_0000, 32] {
            header.extend_from_slice(&value.to_be_bytes());
        }
        file.write_all(&header).unwrap();

        let err = CaptureFileConfiguration::read(&file).unwrap_err();
        assert!(matches!(err, CaptureFileError::Invalid(_)));
    }

    #[test]
    fn accepts_legacy_magic_and_rejects_newer_versions() {
        let file = tempfile::tempfile().unwrap();
        CaptureFileConfiguration::default().write(&file).unwrap();

        let mut file = &file;
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(LEGACY_CAPTURE_FILE_TYPE).unwrap();
        assert!(CaptureFileConfiguration::read(file).is_ok());

        file.seek(SeekFrom::Start(CAPTURE_FILE_TYPE.len() as u64)).unwrap();
        file.write_all(&(CURRENT_VERSION + 1).to_be_bytes()).unwrap();
        let err = CaptureFileConfiguration::read(file).unwrap_err();
        assert!(matches!(err, CaptureFileError::Invalid(_)));
    }
}
