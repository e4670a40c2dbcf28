use crate::config::CaptureFileConfiguration;
use crate::coords::DataCoordinates;
use crate::errors::{CaptureFileError, Result};
use crate::stream::ByteStream;
use crate::tree::RightmostPath;

/// One commit's worth of state: where everything is in the capture file.
///
/// Two master nodes alternate in fixed slots so that a torn write of the
/// current one still leaves the previous commit intact. The slot is chosen
/// by `serial_number % 2`, and the node with the newer serial (mod 2^32) is
/// the active one.
#[derive(Debug, Clone)]
pub struct MasterNode {
    /// Wraps at 2^32; the two persisted serials are always 1 apart.
    pub serial_number: u32,
    /// The next file position to start writing at. Not the end of the OS
    /// file, which is grown in larger increments.
    pub file_limit: u64,
    /// Coordinates of the user metadata blob, or null when unset.
    pub metadata_pointer: DataCoordinates,
    pub rightmost_path: RightmostPath,
    /// The partial last page of data, exactly `page_size` bytes. Only full
    /// pages are written to the file; the tail lives here until it fills.
    pub contents_of_last_page: Vec<u8>,
    /// Data accumulating toward the next compressed block.
    pub compression_block_contents: Vec<u8>,
}

impl MasterNode {
    /// The master of a freshly created, empty capture file.
    #[must_use]
    pub fn new_empty(config: &CaptureFileConfiguration) -> Self {
        Self {
            serial_number: 0,
            file_limit: config.initial_file_limit,
            metadata_pointer: DataCoordinates::null(),
            rightmost_path: RightmostPath::new(),
            contents_of_last_page: vec![0; config.page_size as usize],
            compression_block_contents: Vec::new(),
        }
    }

    /// Decodes a master-node body (everything after the leading CRC). The
    /// caller has already verified the CRC; a malformed body here is still
    /// reported as corruption rather than a panic.
    pub fn decode(body: &[u8], page_size: u32) -> Result<Self> {
        let page_size = page_size as usize;
        let corrupt = || CaptureFileError::Invalid("master node body is malformed".into());

        let mut stream = ByteStream::from_vec(body.to_vec());
        let serial_number = stream.next_u32().map_err(|_| corrupt())?;
        let file_limit = stream.next_u64().map_err(|_| corrupt())?;
        let compression_block_len = stream.next_u32().map_err(|_| corrupt())? as usize;
        let metadata_pointer = DataCoordinates::read_from(&mut stream).map_err(|_| corrupt())?;
        let rightmost_path = RightmostPath::read_from(&mut stream).map_err(|_| corrupt())?;

        // The first page of the slot holds the 4-byte CRC plus the first
        // page_size - 4 bytes of the body, so within the body the last-page
        // tail starts at page_size - 4 and the buffer right after it.
        let last_page_start = page_size - 4;
        let compression_block_start = page_size * 2 - 4;
        let compression_block_end = compression_block_start + compression_block_len;
        let contents_of_last_page =
            body.get(last_page_start..compression_block_start).ok_or_else(corrupt)?.to_vec();
        let compression_block_contents =
            body.get(compression_block_start..compression_block_end).ok_or_else(corrupt)?.to_vec();

        Ok(Self {
            serial_number,
            file_limit,
            metadata_pointer,
            rightmost_path,
            contents_of_last_page,
            compression_block_contents,
        })
    }

    /// Encodes the body this node is persisted as, `master_node_size - 4`
    /// bytes long; the caller prepends the CRC of it.
    #[must_use]
    pub fn encode(&self, config: &CaptureFileConfiguration) -> Vec<u8> {
        let page_size = config.page_size as usize;
        let mut stream = ByteStream::new();

        stream.write_u32(self.serial_number);
        stream.write_u64(self.file_limit);
        stream.write_u32(self.compression_block_contents.len() as u32);
        self.metadata_pointer.write_to(&mut stream);
        self.rightmost_path.write_rightmost_nodes(&mut stream);
        assert!(
            stream.position() <= page_size - 4,
            "too many rightmost nodes to fit on a page"
        );

        stream.zero_fill_to(page_size - 4);
        stream.write_bytes(&self.contents_of_last_page);
        stream.write_bytes(&self.compression_block_contents);
        stream.zero_fill_to(config.master_node_size as usize - 4);
        stream.into_vec()
    }

    pub fn increment_serial_number(&mut self) {
        self.serial_number = self.serial_number.wrapping_add(1);
    }

    /// Absolute slot position for this node: even serials use the first
    /// slot, odd serials the second.
    #[must_use]
    pub fn position(&self, config: &CaptureFileConfiguration) -> u64 {
        config.master_node_positions[(self.serial_number % 2) as usize]
    }

    #[must_use]
    pub fn compute_record_count(&self, fan_out: u32) -> u64 {
        self.rightmost_path.compute_record_count(fan_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(config: &CaptureFileConfiguration) -> MasterNode {
        let mut node = MasterNode::new_empty(config);
        node.serial_number = 7;
        node.file_limit = config.initial_file_limit + 12345;
        node.metadata_pointer = DataCoordinates::new(config.initial_file_limit, 99);
        node.compression_block_contents = b"buffered but not yet compressed".to_vec();
        node.contents_of_last_page[0] = 0xAB;
        for n in 0..5 {
            node.rightmost_path.rightmost_node(1).add_child(DataCoordinates::new(n, n as u32));
        }
        node.rightmost_path.rightmost_node(2).add_child(DataCoordinates::new(9, 9));
        node
    }

    #[test]
    fn encode_is_exactly_one_slot_minus_the_crc() {
        let config = CaptureFileConfiguration::default();
        let body = sample(&config).encode(&config);
        assert_eq!(body.len(), config.master_node_size as usize - 4);
    }

    #[test]
    fn decode_inverts_encode() {
        let config = CaptureFileConfiguration::default();
        let node = sample(&config);
        let decoded = MasterNode::decode(&node.encode(&config), config.page_size).unwrap();

        assert_eq!(decoded.serial_number, node.serial_number);
        assert_eq!(decoded.file_limit, node.file_limit);
        assert_eq!(decoded.metadata_pointer, node.metadata_pointer);
        assert_eq!(decoded.contents_of_last_page, node.contents_of_last_page);
        assert_eq!(decoded.compression_block_contents, node.compression_block_contents);
        assert_eq!(
            decoded.compute_record_count(config.fan_out),
            node.compute_record_count(config.fan_out)
        );
    }

    #[test]
    fn slot_alternates_with_serial() {
        let config = CaptureFileConfiguration::default();
        let mut node = MasterNode::new_empty(&config);
        assert_eq!(node.position(&config), config.master_node_positions[0]);
        node.increment_serial_number();
        assert_eq!(node.position(&config), config.master_node_positions[1]);
        node.serial_number = u32::MAX;
        node.increment_serial_number();
        assert_eq!(node.serial_number, 0);
    }
}
