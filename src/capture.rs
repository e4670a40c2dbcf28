use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use log::{debug, info, trace};

use crate::cache::LruMap;
use crate::config::CaptureFileConfiguration;
use crate::coords::DataCoordinates;
use crate::errors::{CaptureFileError, Result};
use crate::lock::{FileLocking, platform_locking};
use crate::master::MasterNode;
use crate::stream::ByteStream;
use crate::tree::{RightmostPath, leaf_to_root_path};

/// Capacity of the block cache and the full-node cache.
const CACHE_SIZE: usize = 10;

/// The file grows by at most this much at a time, page-aligned and never
/// more than doubling, to keep fragmentation down.
const FILE_GROWTH_CAP: u64 = 5 * 1024 * 1024;

/// A freshly created file is pre-grown to this many pages so that early
/// incremental appends do not fragment it.
const INITIAL_PAGES: u64 = 100;

const REFRESH_RETRIES: u32 = 3;
const REFRESH_RETRY_SLEEP: Duration = Duration::from_secs(4);

/// Creation options for [`CaptureFile::open_with`].
#[derive(Debug, Default, Clone)]
pub struct CaptureFileOptions {
    /// Metadata guaranteed to be present in a newly created file. Ignored
    /// when an existing file is opened.
    pub initial_metadata: Option<Vec<u8>>,
    /// Replace whatever is at the path with a new empty capture file.
    pub force_new_empty_file: bool,
}

/// An append-only record store in a single file.
///
/// One process at a time may hold a write handle; any number of handles, in
/// this or other processes, may read concurrently with it. Records and
/// metadata become durable and visible to other handles only at
/// [`commit`](CaptureFile::commit); a reader picks up committed changes by
/// calling [`refresh`](CaptureFile::refresh).
///
/// A handle is not meant for concurrent use from multiple threads; callers
/// serialize access to it.
#[derive(Debug)]
pub struct CaptureFile {
    path: PathBuf,
    to_write: bool,
    file: Option<File>,
    config: CaptureFileConfiguration,
    master: MasterNode,
    compression_block: ByteStream,
    record_count: u64,
    locking: Box<dyn FileLocking>,
    block_cache: LruMap<u64, Vec<u8>>,
    full_node_cache: LruMap<DataCoordinates, Vec<DataCoordinates>>,
}

impl CaptureFile {
    /// Opens an existing capture file for reading.
    pub fn open_for_read(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, false, CaptureFileOptions::default())
    }

    /// Opens a capture file for writing, creating it if it does not exist.
    pub fn open_for_write(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, true, CaptureFileOptions::default())
    }

    /// Creates a new empty capture file, replacing any existing file at the
    /// path, optionally seeding it with metadata.
    pub fn create(path: impl AsRef<Path>, initial_metadata: Option<&[u8]>) -> Result<Self> {
        Self::open_with(
            path,
            true,
            CaptureFileOptions {
                initial_metadata: initial_metadata.map(<[u8]>::to_vec),
                force_new_empty_file: true,
            },
        )
    }

    /// Opens (and if necessary first creates) a capture file.
    ///
    /// # Errors
    /// [`CaptureFileError::AlreadyOpen`] if another handle holds the file
    /// for write, [`CaptureFileError::Invalid`] if the file is not a capture
    /// file, uses a newer format version, or is corrupt beyond the
    /// dual-master recovery.
    pub fn open_with(
        path: impl AsRef<Path>,
        to_write: bool,
        options: CaptureFileOptions,
    ) -> Result<Self> {
        let path = std::path::absolute(path.as_ref())?;
        let config = CaptureFileConfiguration::default();
        let mut capture_file = Self {
            master: MasterNode::new_empty(&config),
            config,
            path,
            to_write,
            file: None,
            compression_block: ByteStream::new(),
            record_count: 0,
            locking: platform_locking(),
            block_cache: LruMap::new(CACHE_SIZE),
            full_node_cache: LruMap::new(CACHE_SIZE),
        };
        if options.force_new_empty_file || (to_write && !capture_file.path.is_file()) {
            capture_file.new_file(options.initial_metadata.as_deref())?;
        }
        capture_file.open(to_write)?;
        Ok(capture_file)
    }

    /// Opens a handle that was previously closed, potentially switching
    /// between read and write.
    ///
    /// # Errors
    /// [`CaptureFileError::AlreadyOpen`] if this handle is already open, or
    /// if `to_write` and any handle anywhere holds the file for write.
    pub fn open(&mut self, to_write: bool) -> Result<()> {
        if self.file.is_some() {
            return Err(CaptureFileError::AlreadyOpen(self.path.clone()));
        }
        {
            let mut registry = crate::writer_registry().lock();
            if to_write && registry.contains(&self.path) {
                // OS-level locks do not always exclude within one process,
                // so the in-process registry is checked explicitly.
                return Err(CaptureFileError::AlreadyOpen(self.path.clone()));
            }
            self.to_write = to_write;
            let file = OpenOptions::new().read(true).write(to_write).open(&self.path)?;
            if to_write {
                if self.locking.try_lock_writer(&file).is_err() {
                    // Another process has a lock on this file.
                    return Err(CaptureFileError::AlreadyOpen(self.path.clone()));
                }
                registry.insert(self.path.clone());
            }
            self.file = Some(file);
        }
        let opened = (|| {
            self.config =
                CaptureFileConfiguration::read(self.file.as_ref().expect("just opened"))?;
            self.refresh_with_retries()
        })();
        if opened.is_err() {
            self.close();
        }
        opened
    }

    /// Releases the OS file and all locks. Uncommitted records and metadata
    /// are discarded. Closing a closed handle does nothing.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            if self.to_write {
                crate::writer_registry().lock().remove(&self.path);
            }
        }
    }

    /// Builds a brand-new capture file at `self.path`.
    ///
    /// The file is assembled in a temporary file and only moved into place
    /// once fully formed, so a partially constructed file can never be
    /// observed under the real name. Both master slots are made valid by
    /// committing twice.
    fn new_file(&mut self, initial_metadata: Option<&[u8]>) -> Result<()> {
        {
            let mut registry = crate::writer_registry().lock();
            if registry.contains(&self.path) {
                return Err(CaptureFileError::AlreadyOpen(self.path.clone()));
            }
            registry.insert(self.path.clone());
        }
        self.to_write = true;
        self.config = CaptureFileConfiguration::default();
        self.compression_block = ByteStream::new();

        let built = self.build_new_file(initial_metadata);
        // The temp-file handle is already dropped on success, and on early
        // failure one may never have been opened, so close() alone cannot be
        // relied on to clear the registry entry made above.
        self.file = None;
        crate::writer_registry().lock().remove(&self.path);
        built
    }

    fn build_new_file(&mut self, initial_metadata: Option<&[u8]>) -> Result<()> {
        let directory = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(directory)?;
        self.file = Some(temp.reopen()?);

        self.config.write(self.file.as_ref().expect("file is open"))?;
        self.master = MasterNode::new_empty(&self.config);
        self.record_count = 0;
        self.set_metadata(initial_metadata)?;
        self.commit()?;
        self.commit()?;

        {
            let mut file = self.file_ref()?;
            file.seek(SeekFrom::Start(u64::from(self.config.page_size) * INITIAL_PAGES - 1))?;
            file.write_all(&[0])?;
        }

        self.file = None;
        temp.persist(&self.path).map_err(|persist| CaptureFileError::Io(persist.error))?;
        info!("created capture file {:?}", self.path);
        Ok(())
    }

    fn file_ref(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| CaptureFileError::NotOpen(self.path.clone()))
    }

    fn require_writer(&self) -> Result<()> {
        self.file_ref()?;
        if !self.to_write {
            return Err(CaptureFileError::NotOpenForWrite(self.path.clone()));
        }
        Ok(())
    }

    /// Re-reads the current committed state from disk.
    ///
    /// A reader calls this to see records committed after it opened. A
    /// writer never needs to: no other handle can have changed the file.
    ///
    /// # Errors
    /// [`CaptureFileError::NotOpen`] on a closed handle. Any failure,
    /// including [`CaptureFileError::Invalid`] after the retry protocol,
    /// closes the handle before being returned.
    pub fn refresh(&mut self) -> Result<()> {
        self.file_ref()?;
        self.refresh_with_retries()
    }

    fn refresh_with_retries(&mut self) -> Result<()> {
        // The master nodes can transiently be more than one serial apart
        // while another process is mid-commit, so corruption verdicts are
        // retried: once immediately, once after a pause.
        let mut outcome = Ok(());
        for attempt in 0..REFRESH_RETRIES {
            outcome = self.refresh_once();
            match &outcome {
                Ok(()) => break,
                Err(CaptureFileError::Invalid(_)) if attempt == 0 => {}
                Err(CaptureFileError::Invalid(_)) if attempt == 1 => sleep(REFRESH_RETRY_SLEEP),
                Err(_) => break,
            }
        }
        if outcome.is_err() {
            self.close();
        }
        outcome
    }

    fn refresh_once(&mut self) -> Result<()> {
        self.acquire_master_nodes_lock()?;
        let refreshed = self.read_current_master();
        let unlocked = self.release_master_nodes_lock();
        refreshed.and(unlocked)
    }

    fn read_current_master(&mut self) -> Result<()> {
        let nodes = [
            self.decode_master_node(self.config.master_node_positions[0])?,
            self.decode_master_node(self.config.master_node_positions[1])?,
        ];
        let current = match nodes {
            [None, None] => {
                return Err(CaptureFileError::Invalid("both master nodes are corrupt".into()));
            }
            [Some(first), Some(second)] => {
                match first.serial_number.wrapping_sub(second.serial_number) {
                    1 => first,
                    u32::MAX => second,
                    _ => {
                        return Err(CaptureFileError::Invalid(
                            "master nodes are valid but have non-consecutive serial numbers"
                                .into(),
                        ));
                    }
                }
            }
            [Some(only), None] | [None, Some(only)] => only,
        };

        self.compression_block = ByteStream::from_vec(current.compression_block_contents.clone());
        self.compression_block.seek_to_end();
        self.record_count = current.compute_record_count(self.config.fan_out);
        debug!(
            "refreshed {:?}: serial {}, {} records",
            self.path, current.serial_number, self.record_count
        );
        self.master = current;
        Ok(())
    }

    /// Reads one master slot, returning `None` if its CRC does not match.
    fn decode_master_node(&self, position: u64) -> Result<Option<MasterNode>> {
        let mut file = self.file_ref()?;
        file.seek(SeekFrom::Start(position))?;
        let mut recorded_crc = [0u8; 4];
        file.read_exact(&mut recorded_crc)?;
        let mut body = vec![0u8; self.config.master_node_size as usize - 4];
        file.read_exact(&mut body)?;
        if u32::from_be_bytes(recorded_crc) != crc32fast::hash(&body) {
            return Ok(None);
        }
        Ok(MasterNode::decode(&body, self.config.page_size).ok())
    }

    fn acquire_master_nodes_lock(&self) -> Result<()> {
        let start = u64::from(self.config.page_size);
        let len = 2 * u64::from(self.config.master_node_size);
        self.locking.lock_master_nodes(self.file_ref()?, start, len, self.to_write)?;
        Ok(())
    }

    fn release_master_nodes_lock(&self) -> Result<()> {
        let start = u64::from(self.config.page_size);
        let len = 2 * u64::from(self.config.master_node_size);
        self.locking.unlock_master_nodes(self.file_ref()?, start, len)?;
        Ok(())
    }

    /// Returns the metadata stored at creation or by
    /// [`set_metadata`](CaptureFile::set_metadata), or `None` if unset.
    pub fn get_metadata(&self) -> Result<Option<Vec<u8>>> {
        self.file_ref()?;
        if self.master.metadata_pointer.is_null() {
            return Ok(None);
        }
        Ok(Some(self.sized_data_at(self.master.metadata_pointer)?))
    }

    /// Stores a metadata blob associated with the file as a whole.
    ///
    /// Metadata commits transactionally with records, which makes it a good
    /// place to remember how far processing got at the last commit. Pass
    /// `None` to clear it.
    pub fn set_metadata(&mut self, new_metadata: Option<&[u8]>) -> Result<()> {
        self.require_writer()?;
        self.master.metadata_pointer = match new_metadata {
            None => DataCoordinates::null(),
            Some(bytes) => self.add_data_block(bytes)?,
        };
        Ok(())
    }

    /// Appends a record, returning the new record count. The record is not
    /// durable or visible to other handles until [`commit`](CaptureFile::commit).
    pub fn add_record(&mut self, record: &[u8]) -> Result<u64> {
        self.require_writer()?;
        let coords = self.add_data_block(record)?;
        self.add_child_to_rightmost_node(coords, 1)?;
        self.record_count += 1;
        Ok(self.record_count)
    }

    /// Commits every record added and any metadata set since the last
    /// commit, atomically: after a failure at any point, a reopen sees the
    /// previous commit in full.
    pub fn commit(&mut self) -> Result<()> {
        self.require_writer()?;
        // Data pages referenced by the new master must be durable before
        // the master that points at them goes live.
        self.file_ref()?.sync_data()?;
        self.master.increment_serial_number();
        self.acquire_master_nodes_lock()?;
        let written: Result<()> = (|| {
            let position = self.master.position(&self.config);
            self.write_master_node(position)?;
            self.file_ref()?.sync_data()?;
            Ok(())
        })();
        let unlocked = self.release_master_nodes_lock();
        debug!(
            "committed {:?}: serial {}, file limit {}, {} records",
            self.path, self.master.serial_number, self.master.file_limit, self.record_count
        );
        written.and(unlocked)
    }

    fn write_master_node(&mut self, position: u64) -> Result<()> {
        self.master.compression_block_contents = self.compression_block.as_slice().to_vec();
        let body = self.master.encode(&self.config);
        let crc = crc32fast::hash(&body);
        let mut file = self.file_ref()?;
        file.seek(SeekFrom::Start(position))?;
        file.write_all(&crc.to_be_bytes())?;
        file.write_all(&body)?;
        Ok(())
    }

    /// The number of records visible on this handle: as of open/refresh for
    /// readers, up to date with uncommitted appends for the writer.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Returns the record at `record_number` (the first record is number 1).
    ///
    /// # Errors
    /// [`CaptureFileError::OutOfRange`] below 1 or above
    /// [`record_count`](CaptureFile::record_count).
    pub fn record_at(&self, record_number: u64) -> Result<Vec<u8>> {
        self.file_ref()?;
        if record_number < 1 || record_number > self.record_count {
            return Err(CaptureFileError::OutOfRange(record_number));
        }

        let rightmost = &self.master.rightmost_path;
        let height = rightmost.number_of_levels();
        let path = leaf_to_root_path(record_number - 1, height, self.config.fan_out);

        // Walk down from the root for as long as the path follows the
        // in-memory spine; the first divergence points at either the record
        // itself or the root of a fully persisted subtree.
        let mut level = height;
        let mut coords = loop {
            if level == 0 {
                return Err(CaptureFileError::Invalid("record index tree is inconsistent".into()));
            }
            let node = rightmost.node_at(level);
            let child_index = path[level - 1] as usize;
            if child_index != node.child_count() {
                break node.child(child_index);
            }
            level -= 1;
        };

        // Follow the remaining child indexes through persisted full nodes.
        for descend_level in (1..level).rev() {
            coords = self.full_node(coords)?[path[descend_level - 1] as usize];
        }
        self.sized_data_at(coords)
    }

    /// Returns a lazy iterator over records from `starting_record_number`
    /// to the record count at the time of this call.
    ///
    /// The iterator snapshots the mutable spine of the index, so records
    /// appended afterwards neither appear nor disturb iteration; ask for a
    /// fresh iterator to see them.
    pub fn records(&self, starting_record_number: u64) -> Result<Records<'_>> {
        self.file_ref()?;
        if starting_record_number < 1 {
            return Err(CaptureFileError::OutOfRange(starting_record_number));
        }
        let path = self.master.rightmost_path.clone();
        let level = path.number_of_levels();
        let mut records = Records {
            capture_file: self,
            path,
            fan_out: u64::from(self.config.fan_out),
            level,
            level_child: 0,
            index_remaining: starting_record_number - 1,
            stack: Vec::new(),
            failed: false,
        };
        records.position_level();
        Ok(records)
    }

    /// All records, first to last. Equivalent to `records(1)`.
    pub fn iter(&self) -> Result<Records<'_>> {
        self.records(1)
    }

    /// Coordinates the next datum written into the compression buffer will
    /// have.
    fn next_block_coordinates(&self) -> DataCoordinates {
        DataCoordinates::new(self.master.file_limit, self.compression_block.position() as u32)
    }

    /// Adds a size-prefixed datum to the compression buffer and returns its
    /// coordinates.
    fn add_data_block(&mut self, data: &[u8]) -> Result<DataCoordinates> {
        let coords = self.next_block_coordinates();
        self.compression_block.write_sized(data);
        self.compress_and_write_if_full()?;
        Ok(coords)
    }

    /// Appends `child` to the rightmost node at `height`, cascading upward:
    /// a node that fills is flushed to the data stream as an immutable full
    /// node, reset, and its coordinates added to the level above, growing
    /// the tree by a level when the root itself fills.
    fn add_child_to_rightmost_node(&mut self, child: DataCoordinates, height: u8) -> Result<()> {
        let mut child = child;
        let mut height = height;
        loop {
            let fan_out = self.config.fan_out;
            let node = self.master.rightmost_path.rightmost_node(height);
            node.add_child(child);
            if !node.is_full(fan_out) {
                return Ok(());
            }

            let promoted = self.next_block_coordinates();
            let mut encoded = ByteStream::new();
            let node = self.master.rightmost_path.rightmost_node(height);
            node.write_without_height(&mut encoded);
            node.reset();
            self.compression_block.write_bytes(encoded.as_slice());
            self.compress_and_write_if_full()?;

            child = promoted;
            height += 1;
        }
    }

    /// Once the buffer reaches the configured size, compresses it, grows
    /// the file if needed, and appends it as a size-prefixed block.
    fn compress_and_write_if_full(&mut self) -> Result<()> {
        if self.compression_block.position() < self.config.compression_block_size as usize {
            return Ok(());
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(self.compression_block.as_slice())?;
        let compressed = encoder.finish()?;
        trace!(
            "compressed {} bytes to {} at file limit {}",
            self.compression_block.len(),
            compressed.len(),
            self.master.file_limit
        );
        self.compression_block = ByteStream::new();

        let file_size = self.file_size()?;
        if self.master.file_limit + 4 + compressed.len() as u64 > file_size {
            // Park the position on the first page before truncating: that
            // page is written once at creation and never again, so the
            // truncate cannot re-read a page locked by another process.
            self.file_ref()?.seek(SeekFrom::Start(0))?;
            let page = u64::from(self.config.page_size);
            let growth = FILE_GROWTH_CAP.min(self.master.file_limit).div_ceil(page) * page;
            self.file_ref()?.set_len(file_size + growth)?;
            trace!("grew {:?} to {} bytes", self.path, file_size + growth);
        }

        self.write_full_pages(&(compressed.len() as u32).to_be_bytes())?;
        self.write_full_pages(&compressed)?;
        Ok(())
    }

    fn file_size(&self) -> Result<u64> {
        Ok(self.file_ref()?.seek(SeekFrom::End(0))?)
    }

    /// Appends `raw` at the file limit in whole-page increments. The
    /// trailing partial page stays in the master node until later bytes
    /// complete it.
    fn write_full_pages(&mut self, raw: &[u8]) -> Result<()> {
        let page_size = self.config.page_size as usize;
        let file_limit = self.master.file_limit;
        let pos_in_last_page = (file_limit % page_size as u64) as usize;
        let total_len = pos_in_last_page + raw.len();
        let full_pages_len = total_len / page_size * page_size;

        if full_pages_len > 0 {
            let mut file =
                self.file.as_ref().ok_or_else(|| CaptureFileError::NotOpen(self.path.clone()))?;
            let last_page = &mut self.master.contents_of_last_page;
            file.seek(SeekFrom::Start(file_limit / page_size as u64 * page_size as u64))?;
            file.write_all(&last_page[..pos_in_last_page])?;
            let full_page_remainder_len = full_pages_len - pos_in_last_page;
            file.write_all(&raw[..full_page_remainder_len])?;
            let tail = &raw[full_page_remainder_len..];
            last_page[..tail.len()].copy_from_slice(tail);
            last_page[tail.len()..].fill(0);
        } else {
            self.master.contents_of_last_page[pos_in_last_page..total_len].copy_from_slice(raw);
        }
        self.master.file_limit += raw.len() as u64;
        Ok(())
    }

    /// Reads `size` bytes starting at an absolute file position, stitching
    /// together persisted pages and the unwritten last-page tail.
    fn fetch_data(&self, start: u64, size: usize) -> Result<Vec<u8>> {
        let page = u64::from(self.config.page_size);
        let written_limit = self.master.file_limit / page * page;
        let end = start + size as u64;
        let tail = |range: std::ops::Range<usize>| {
            self.master
                .contents_of_last_page
                .get(range)
                .ok_or_else(|| CaptureFileError::Invalid("data pointer past file limit".into()))
        };

        if start < written_limit {
            let mut file = self.file_ref()?;
            file.seek(SeekFrom::Start(start))?;
            if end <= written_limit {
                // Entirely within persisted pages.
                let mut data = vec![0u8; size];
                file.read_exact(&mut data)?;
                Ok(data)
            } else {
                // Split between persisted pages and the unwritten tail.
                let written_size = (written_limit - start) as usize;
                let mut data = vec![0u8; written_size];
                file.read_exact(&mut data)?;
                data.extend_from_slice(tail(0..size - written_size)?);
                Ok(data)
            }
        } else {
            // Entirely within the unwritten tail.
            let offset = (start - written_limit) as usize;
            Ok(tail(offset..offset + size)?.to_vec())
        }
    }

    fn fetch_sized_data(&self, start: u64) -> Result<Vec<u8>> {
        let size_bytes = self.fetch_data(start, 4)?;
        let size = u32::from_be_bytes(size_bytes.try_into().expect("4 bytes")) as usize;
        self.fetch_data(start + 4, size)
    }

    /// The decompressed block starting at `file_position`. The final,
    /// possibly-incomplete block lives in the in-memory buffer and is
    /// returned directly rather than cached; persisted blocks are immutable,
    /// so the cache never needs invalidation.
    fn block(&self, file_position: u64) -> Result<Arc<Vec<u8>>> {
        if file_position == self.master.file_limit {
            return Ok(Arc::new(self.compression_block.as_slice().to_vec()));
        }
        self.block_cache.get_or_try_insert(file_position, || {
            let compressed = self.fetch_sized_data(file_position)?;
            let mut decompressed = Vec::new();
            ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut decompressed)?;
            Ok(decompressed)
        })
    }

    /// The `fan_out` child coordinates of a persisted full node.
    fn full_node(&self, coords: DataCoordinates) -> Result<Arc<Vec<DataCoordinates>>> {
        self.full_node_cache.get_or_try_insert(coords, || {
            let block = self.block(coords.compressed_block_start)?;
            let mut children = Vec::with_capacity(self.config.fan_out as usize);
            let mut offset = coords.data_start as usize;
            for _ in 0..self.config.fan_out {
                let child = DataCoordinates::from_slice(&block, offset).map_err(|_| {
                    CaptureFileError::Invalid("full node extends past its block".into())
                })?;
                children.push(child);
                offset += DataCoordinates::SIZE;
            }
            Ok(children)
        })
    }

    /// The size-prefixed datum at `coords`.
    fn sized_data_at(&self, coords: DataCoordinates) -> Result<Vec<u8>> {
        let truncated =
            || CaptureFileError::Invalid("sized datum extends past its block".into());
        let block = self.block(coords.compressed_block_start)?;
        let start = coords.data_start as usize;
        let size_bytes = block.get(start..start + 4).ok_or_else(truncated)?;
        let size = u32::from_be_bytes(size_bytes.try_into().expect("4 bytes")) as usize;
        Ok(block.get(start + 4..start + 4 + size).ok_or_else(truncated)?.to_vec())
    }
}

impl fmt::Display for CaptureFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (&self.file, self.to_write) {
            (Some(_), true) => "opened for writing",
            (Some(_), false) => "opened for reading",
            (None, _) => "currently closed but last seen",
        };
        write!(f, "{:?} {status} with {} records", self.path, self.record_count)
    }
}

impl Drop for CaptureFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// Lazy iterator over a contiguous range of records, pinned to the state of
/// the file when it was created. Returned by [`CaptureFile::records`].
pub struct Records<'a> {
    capture_file: &'a CaptureFile,
    /// Snapshot of the mutable spine taken at creation.
    path: RightmostPath,
    fan_out: u64,
    /// Spine level currently being walked, root first; 0 when exhausted.
    level: usize,
    level_child: usize,
    /// Remainder that positions the first entry into each level or subtree;
    /// zero once the starting record has been located.
    index_remaining: u64,
    /// In-progress descent through persisted perfect subtrees.
    stack: Vec<SubtreeFrame>,
    failed: bool,
}

struct SubtreeFrame {
    children: Arc<Vec<DataCoordinates>>,
    next_child: usize,
    height: usize,
}

impl Records<'_> {
    /// Records covered by one child at `height`: `fan_out ^ (height - 1)`.
    fn power(&self, height: usize) -> u64 {
        self.fan_out.pow(height as u32 - 1)
    }

    fn position_level(&mut self) {
        if self.level == 0 {
            return;
        }
        let power = self.power(self.level);
        self.level_child = (self.index_remaining / power) as usize;
        self.index_remaining %= power;
    }

    fn enter_subtree(&mut self, coords: DataCoordinates, height: usize) -> Result<()> {
        let children = self.capture_file.full_node(coords)?;
        let power = self.power(height);
        let next_child = (self.index_remaining / power) as usize;
        self.index_remaining %= power;
        self.stack.push(SubtreeFrame { children, next_child, height });
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            // Finish any perfect subtree currently being walked.
            if let Some(frame) = self.stack.last_mut() {
                if frame.next_child as u64 == self.fan_out {
                    self.stack.pop();
                    continue;
                }
                let child = frame.children[frame.next_child];
                let height = frame.height;
                frame.next_child += 1;
                if height == 1 {
                    return Ok(Some(self.capture_file.sized_data_at(child)?));
                }
                self.enter_subtree(child, height - 1)?;
                continue;
            }

            // Otherwise consume the spine, top level downward.
            if self.level == 0 {
                return Ok(None);
            }
            let child_count = self.path.node_at(self.level).child_count();
            if self.level_child >= child_count {
                self.level -= 1;
                self.position_level();
                continue;
            }
            let child = self.path.node_at(self.level).child(self.level_child);
            self.level_child += 1;
            if self.level == 1 {
                return Ok(Some(self.capture_file.sized_data_at(child)?));
            }
            let height = self.level - 1;
            self.enter_subtree(child, height)?;
        }
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(record) => record.map(Ok),
            Err(error) => {
                self.failed = true;
                Some(Err(error))
            }
        }
    }
}
