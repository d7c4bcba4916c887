//! Per-interface advisory lock
//!
//! One lock file per interface under the lock directory, held with
//! `flock(LOCK_EX)` for the duration of a single apply. Acquisition polls
//! `LOCK_NB` until a deadline so a stuck holder cannot block callers
//! forever. The lock is released when the guard is dropped.

use crate::error::{ControlError, ControlResult};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const POLL_JITTER_MS: u64 = 15;

/// Held interface lock; released on drop
pub struct InterfaceLock {
    _file: File,
    interface: String,
    path: PathBuf,
}

impl fmt::Debug for InterfaceLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceLock")
            .field("interface", &self.interface)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl InterfaceLock {
    /// Acquire the lock for `interface`, waiting at most `timeout`.
    ///
    /// `interface` must already be a validated interface name.
    pub fn acquire(lock_dir: &Path, interface: &str, timeout: Duration) -> ControlResult<Self> {
        crate::fsutil::ensure_private_dir(lock_dir).map_err(|e| ControlError::Lock {
            interface: interface.to_string(),
            reason: format!("cannot create {}: {}", lock_dir.display(), e),
        })?;

        let path = lock_dir.join(format!("{}.lock", interface));
        let file = open_lock_file(&path).map_err(|e| ControlError::Lock {
            interface: interface.to_string(),
            reason: format!("cannot open {}: {}", path.display(), e),
        })?;

        let start = Instant::now();
        loop {
            match try_flock_exclusive(&file) {
                Ok(true) => {
                    tracing::debug!(interface, "interface lock acquired");
                    return Ok(Self {
                        _file: file,
                        interface: interface.to_string(),
                        path,
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    return Err(ControlError::Lock {
                        interface: interface.to_string(),
                        reason: e.to_string(),
                    })
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                tracing::warn!(interface, waited = ?elapsed, "interface lock still busy");
                return Err(ControlError::LockTimeout {
                    interface: interface.to_string(),
                    waited_secs: elapsed.as_secs(),
                });
            }
            std::thread::sleep(POLL_INTERVAL + jitter());
        }
    }

    /// Interface this lock protects
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl Drop for InterfaceLock {
    fn drop(&mut self) {
        tracing::debug!(interface = %self.interface, "interface lock released");
    }
}

fn jitter() -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    Duration::from_millis(nanos % (POLL_JITTER_MS + 1))
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for the duration
        // of the call; flock does not retain it.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let held = InterfaceLock::acquire(dir.path(), "wg0", Duration::from_secs(1)).unwrap();
        assert_eq!(held.interface(), "wg0");

        let start = Instant::now();
        let err = InterfaceLock::acquire(dir.path(), "wg0", Duration::from_millis(150)).unwrap_err();
        assert!(matches!(err, ControlError::LockTimeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(150));

        drop(held);
        assert!(InterfaceLock::acquire(dir.path(), "wg0", Duration::from_millis(150)).is_ok());
    }

    #[test]
    fn test_distinct_interfaces_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let _a = InterfaceLock::acquire(dir.path(), "wg0", Duration::from_secs(1)).unwrap();
        let _b = InterfaceLock::acquire(dir.path(), "wg1", Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_waiter_proceeds_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();
        let held = InterfaceLock::acquire(&path, "wg0", Duration::from_secs(1)).unwrap();
        let acquired = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                let _lock = InterfaceLock::acquire(&path, "wg0", Duration::from_secs(5)).unwrap();
                acquired.fetch_add(1, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);
        drop(held);
        waiter.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }
}
