use std::fmt::Debug;
use std::fs::File;
use std::io;

/// Start of the one-byte writer-exclusion lock range. Far past any offset
/// ever used for data, so the lock never collides with reads or writes.
pub const WRITER_LOCK_START: u64 = 0x7FFF_FFFF_FFFF_FFFE;
pub const WRITER_LOCK_LEN: u64 = 1;

/// OS byte-range locking, abstracted over the two families the capture file
/// runs on: POSIX advisory locks and Windows mandatory locks.
///
/// Two ranges are ever locked: the single writer-exclusion byte at
/// [`WRITER_LOCK_START`], and the span covering both master-node slots that
/// serializes commits against refreshes.
pub trait FileLocking: Debug + Send + Sync {
    /// Non-blocking exclusive lock on the writer-exclusion byte. Any
    /// failure means another handle holds it.
    fn try_lock_writer(&self, file: &File) -> io::Result<()>;

    /// Blocking lock over the master-node slots; shared for readers,
    /// exclusive for the writer.
    fn lock_master_nodes(&self, file: &File, start: u64, len: u64, exclusive: bool)
    -> io::Result<()>;

    fn unlock_master_nodes(&self, file: &File, start: u64, len: u64) -> io::Result<()>;
}

/// The locking implementation for the running platform.
#[must_use]
pub fn platform_locking() -> Box<dyn FileLocking> {
    #[cfg(unix)]
    {
        Box::new(posix::PosixLocking)
    }
    #[cfg(windows)]
    {
        Box::new(windows::WindowsLocking)
    }
}

#[cfg(unix)]
mod posix {
    use super::FileLocking;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    /// Advisory byte-range locks via `fcntl`. These exclude across
    /// processes but not within one, which is why the writer registry in
    /// `lib.rs` exists.
    #[derive(Debug)]
    pub(super) struct PosixLocking;

    fn fcntl_lock(file: &File, cmd: libc::c_int, kind: libc::c_short, start: u64, len: u64) -> io::Result<()> {
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = kind;
        lock.l_whence = libc::SEEK_SET as libc::c_short;
        lock.l_start = start as libc::off_t;
        lock.l_len = len as libc::off_t;
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &lock) };
        if rc == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    impl FileLocking for PosixLocking {
        fn try_lock_writer(&self, file: &File) -> io::Result<()> {
            fcntl_lock(
                file,
                libc::F_SETLK,
                libc::F_WRLCK as libc::c_short,
                super::WRITER_LOCK_START,
                super::WRITER_LOCK_LEN,
            )
        }

        fn lock_master_nodes(
            &self,
            file: &File,
            start: u64,
            len: u64,
            exclusive: bool,
        ) -> io::Result<()> {
            let kind = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
            fcntl_lock(file, libc::F_SETLKW, kind as libc::c_short, start, len)
        }

        fn unlock_master_nodes(&self, file: &File, start: u64, len: u64) -> io::Result<()> {
            fcntl_lock(file, libc::F_SETLK, libc::F_UNLCK as libc::c_short, start, len)
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::FileLocking;
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use winapi::um::fileapi::{LockFileEx, UnlockFileEx};
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};

    /// Mandatory byte-range locks via `LockFileEx`/`UnlockFileEx`.
    #[derive(Debug)]
    pub(super) struct WindowsLocking;

    fn overlapped_at(start: u64) -> OVERLAPPED {
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        unsafe {
            let offsets = overlapped.u.s_mut();
            offsets.Offset = (start & 0xFFFF_FFFF) as u32;
            offsets.OffsetHigh = (start >> 32) as u32;
        }
        overlapped
    }

    fn lock(file: &File, flags: u32, start: u64, len: u64) -> io::Result<()> {
        let mut overlapped = overlapped_at(start);
        let ok = unsafe {
            LockFileEx(
                file.as_raw_handle().cast(),
                flags,
                0,
                (len & 0xFFFF_FFFF) as u32,
                (len >> 32) as u32,
                &mut overlapped,
            )
        };
        if ok == 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    impl FileLocking for WindowsLocking {
        fn try_lock_writer(&self, file: &File) -> io::Result<()> {
            lock(
                file,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                super::WRITER_LOCK_START,
                super::WRITER_LOCK_LEN,
            )
        }

        fn lock_master_nodes(
            &self,
            file: &File,
            start: u64,
            len: u64,
            exclusive: bool,
        ) -> io::Result<()> {
            let flags = if exclusive { LOCKFILE_EXCLUSIVE_LOCK } else { 0 };
            lock(file, flags, start, len)
        }

        fn unlock_master_nodes(&self, file: &File, start: u64, len: u64) -> io::Result<()> {
            let mut overlapped = overlapped_at(start);
            let ok = unsafe {
                UnlockFileEx(
                    file.as_raw_handle().cast(),
                    0,
                    (len & 0xFFFF_FFFF) as u32,
                    (len >> 32) as u32,
                    &mut overlapped,
                )
            };
            if ok == 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn writer_lock_is_reentrant_within_one_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked");
        std::fs::write(&path, b"x").unwrap();

        let locking = platform_locking();
        let first = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        locking.try_lock_writer(&first).unwrap();

        // fcntl locks are per-process, so exclusion across handles within
        // one process is enforced by the registry, not here. Re-locking from
        // the same process succeeds; that behavior is what the registry
        // compensates for.
        let second = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        assert!(locking.try_lock_writer(&second).is_ok());
    }

    #[test]
    fn master_lock_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let locking = platform_locking();
        let file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        locking.lock_master_nodes(&file, 4096, 81920, true).unwrap();
        locking.unlock_master_nodes(&file, 4096, 81920).unwrap();
        locking.lock_master_nodes(&file, 4096, 81920, false).unwrap();
        locking.unlock_master_nodes(&file, 4096, 81920).unwrap();
    }
}
