//! `WorkerHeartbeat`: a per-worker liveness token observable by the
//! master.
//!
//! Ported directly from the original's `WorkerTmp`: a private temp file
//! created in the master (so its fd is inherited by the forked child,
//! rather than re-created per worker) whose mtime is bumped on
//! `notify()` by toggling its mode with `fchmod` — a portable way to
//! touch mtime without a `futimens` dependency, and exactly the trick
//! `tunicorn`'s Python original uses (`os.fchmod(fd, 0o700)` then back
//! to `0o600`). The master reads `last_update()` on every `murder_workers`
//! tick; I/O errors there are swallowed.

use std::io;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::stat::{fchmod, fstat, Mode};
use tempfile::NamedTempFile;

/// Observable liveness token for one worker. Created by the master
/// before fork so the same fd is visible to both sides.
#[derive(Debug)]
pub struct WorkerHeartbeat {
    file: NamedTempFile,
}

const QUIET_MODE: Mode = Mode::S_IRUSR.union(Mode::S_IWUSR);
const TOUCH_MODE: Mode = Mode::S_IRUSR.union(Mode::S_IWUSR).union(Mode::S_IXUSR);

impl WorkerHeartbeat {
    /// Create a new heartbeat file. Inherited across fork as an open fd;
    /// never re-opened by path in the child.
    pub fn new() -> io::Result<Self> {
        let file = NamedTempFile::new()?;
        fchmod(file.as_raw_fd(), QUIET_MODE).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(WorkerHeartbeat { file })
    }

    /// Bump the file's mtime to "now". Must be called by the worker at
    /// least once every `timeout` seconds; this is the sole contract
    /// that keeps `murder_workers` from killing it.
    pub fn notify(&self) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        fchmod(fd, TOUCH_MODE).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        fchmod(fd, QUIET_MODE).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(())
    }

    /// Time of the last `notify()`, as elapsed-since-now. Returns an
    /// error only on a genuine I/O failure reading the fd's metadata;
    /// callers swallow it.
    pub fn last_update(&self) -> io::Result<SystemTime> {
        let stat = fstat(self.file.as_raw_fd()).map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let secs = stat.st_mtime.max(0) as u64;
        let nanos = stat.st_mtime_nsec.max(0) as u32;
        Ok(UNIX_EPOCH + Duration::new(secs, nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_bumps_last_update() {
        let hb = WorkerHeartbeat::new().unwrap();
        let before = hb.last_update().unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        hb.notify().unwrap();
        let after = hb.last_update().unwrap();
        assert!(after >= before);
    }

    #[test]
    fn fresh_heartbeat_is_not_stale() {
        let hb = WorkerHeartbeat::new().unwrap();
        let last = hb.last_update().unwrap();
        let elapsed = SystemTime::now().duration_since(last).unwrap_or_default();
        assert!(elapsed < Duration::from_secs(5));
    }
}
