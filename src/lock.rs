//! Per-path advisory locks.
//!
//! A lock is a `<path>.lock` file containing the holder's pid. Holders whose
//! process is gone, or whose lock has not been touched for
//! [`STALE_LOCK_SECS`], are treated as abandoned and reclaimed by the next
//! acquirer. Locks are local to one machine; nothing here coordinates across
//! hosts.

use std::fs;
use std::io::{ErrorKind, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{CacheError, IoResultExt, Result};

/// Locks untouched for this long may be reclaimed even if the holder pid is
/// still alive.
pub const STALE_LOCK_SECS: u64 = 300;

/// Poll granularity while waiting on a held lock.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll attempts before giving up (~60 s wall clock).
const MAX_ATTEMPTS: u32 = 600;

/// Exclusive ownership of one path. Dropping the guard releases the lock,
/// but only if the lock file still carries our pid.
#[derive(Debug)]
pub struct PathLock {
    lock_path: Utf8PathBuf,
    pid: u32,
}

impl PathLock {
    /// Acquire the lock for `path`, waiting out a live holder and reclaiming
    /// stale ones. Fails with [`CacheError::Busy`] after the wait budget is
    /// exhausted.
    pub fn acquire(path: &Utf8Path) -> Result<Self> {
        let lock_path = lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).fs_context(parent)?;
        }

        let pid = std::process::id();
        for _ in 0..MAX_ATTEMPTS {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    write!(file, "{pid}").fs_context(&lock_path)?;
                    return Ok(PathLock { lock_path, pid });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if holder_is_stale(&lock_path) {
                        // Reclaim and retry immediately.
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(CacheError::fs(lock_path, e)),
            }
        }
        Err(CacheError::Busy(lock_path))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.lock_path
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        // Another process may have reclaimed a lock we held for too long;
        // never delete a lock that is no longer ours.
        if read_holder(&self.lock_path) == Some(self.pid) {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

fn lock_path_for(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.lock"))
}

fn read_holder(lock_path: &Utf8Path) -> Option<u32> {
    fs::read_to_string(lock_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn holder_is_stale(lock_path: &Utf8Path) -> bool {
    // Unreadable pid or dead holder: abandoned.
    match read_holder(lock_path) {
        None => return true,
        Some(pid) if !process_alive(pid) => return true,
        Some(_) => {}
    }
    // Live holder, but past the stale threshold: abandoned.
    match fs::metadata(lock_path).and_then(|m| m.modified()) {
        Ok(modified) => match modified.elapsed() {
            Ok(age) => age.as_secs() > STALE_LOCK_SECS,
            Err(_) => false,
        },
        // The holder may have released between our open attempt and now.
        Err(_) => true,
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes existence. EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness probe; rely on the mtime threshold alone.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn target(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8Path::from_path(dir.path()).unwrap().join("repo")
    }

    #[test]
    fn acquire_creates_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = target(&dir);
        let lock = PathLock::acquire(&path).unwrap();
        assert!(lock.path().exists());
        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        let lock_path = lock.path().to_owned();
        drop(lock);
        assert!(!lock_path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn dead_holder_is_reclaimed_quickly() {
        let dir = tempfile::tempdir().unwrap();
        let path = target(&dir);
        // A pid far above any real pid table; certainly not running.
        fs::write(lock_path_for(&path), "999999999").unwrap();

        let started = Instant::now();
        let lock = PathLock::acquire(&path).unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(lock);
    }

    #[test]
    fn garbage_holder_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = target(&dir);
        fs::write(lock_path_for(&path), "not-a-pid").unwrap();
        let _lock = PathLock::acquire(&path).unwrap();
    }

    #[test]
    fn independent_paths_lock_independently() {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let a = PathLock::acquire(&base.join("a")).unwrap();
        let b = PathLock::acquire(&base.join("b")).unwrap();
        drop(a);
        drop(b);
    }

    #[test]
    fn drop_leaves_foreign_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = target(&dir);
        let lock = PathLock::acquire(&path).unwrap();
        // Simulate a reclaim by another process.
        fs::write(lock.path(), "424242").unwrap();
        let lock_path = lock.path().to_owned();
        drop(lock);
        assert!(lock_path.exists());
        fs::remove_file(lock_path).unwrap();
    }
}
