//! An embedded, single-writer / multi-reader, append-only record store.
//!
//! A capture file persists an ordered sequence of opaque byte records
//! (numbered from 1) together with a small metadata blob that commits
//! transactionally alongside them. Records are packed into zlib-compressed,
//! size-prefixed blocks inside one file, indexed by an implicit complete
//! N-ary tree whose only mutable part, the rightmost path, rides along in a
//! CRC-protected master node. Two master slots alternate on commit, so a
//! crash mid-write always leaves the previous commit intact.
//!
//! ```no_run
//! use capturefile::CaptureFile;
//!
//! # fn main() -> capturefile::Result<()> {
//! let mut cf = CaptureFile::create("events.capture", Some(b"starting state".as_slice()))?;
//! cf.add_record(b"first event")?;
//! cf.add_record(b"second event")?;
//! cf.commit()?;
//!
//! assert_eq!(cf.record_count(), 2);
//! assert_eq!(cf.record_at(1)?, b"first event");
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod capture;
pub mod config;
pub mod coords;
pub mod errors;
pub mod lock;
pub mod logger;
pub mod master;
pub mod stream;
pub mod tree;

pub use capture::{CaptureFile, CaptureFileOptions, Records};
pub use config::CaptureFileConfiguration;
pub use coords::DataCoordinates;
pub use errors::{CaptureFileError, Result};

use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::LazyLock;

/// Absolute paths currently open for write in this process.
///
/// OS byte-range locks reliably exclude other processes but, on POSIX, not
/// other handles within the same process, so write opens are also checked
/// against this registry.
static FILES_OPEN_FOR_WRITE: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

pub(crate) fn writer_registry() -> &'static Mutex<HashSet<PathBuf>> {
    &FILES_OPEN_FOR_WRITE
}
