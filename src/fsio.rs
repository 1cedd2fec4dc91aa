//! Atomic file primitives: temp+rename writes and per-record lock files.

use crate::error::StoreError;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Per-process counter so concurrent writers in one process never
/// collide on temp names.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Poll interval while waiting on a held lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn temp_path(path: &Path, name: &std::ffi::OsStr) -> PathBuf {
    let mut temp_name = name.to_os_string();
    temp_name.push(format!(
        ".tmp.{}.{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(temp_name)
}

/// Write `bytes` to `path` atomically.
///
/// Writes a uniquely named temp file in the destination directory, syncs
/// it, then renames over the destination. Readers see either the prior
/// committed content or the new content, never a partial write. Any
/// failure surfaces as `WriteFailed` with the prior state untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let name = path.file_name().ok_or_else(|| {
        StoreError::WriteFailed(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path has no file name",
        ))
    })?;
    let temp = temp_path(path, name);

    let result = (|| {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();

    if let Err(e) = result {
        fs::remove_file(&temp).ok();
        return Err(StoreError::WriteFailed(e));
    }
    Ok(())
}

/// Exclusive per-name lock backed by an `O_EXCL`-created file holding
/// the owner PID. Released on drop.
#[derive(Debug)]
pub struct RecordLock {
    path: PathBuf,
}

impl RecordLock {
    /// Acquire the lock named `name` under `locks_dir`.
    ///
    /// Polls until `timeout`, breaking locks whose holder PID is dead or
    /// whose file is older than `stale_age`. Timeout surfaces as `Busy`.
    pub fn acquire(
        locks_dir: &Path,
        name: &str,
        timeout: Duration,
        stale_age: Duration,
    ) -> Result<RecordLock, StoreError> {
        fs::create_dir_all(locks_dir)?;
        let path = locks_dir.join(format!("{}.lock", name));
        let deadline = Instant::now() + timeout;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let pid = std::process::id().to_string();
                    if let Err(e) = file.write_all(pid.as_bytes()).and_then(|_| file.sync_all()) {
                        fs::remove_file(&path).ok();
                        return Err(StoreError::Io(e));
                    }
                    return Ok(RecordLock { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if break_if_stale(&path, stale_age) {
                        // Retry the create immediately; the takeover rename
                        // guarantees at most one contender got here.
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::Busy(format!("lock on {}", name)));
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(StoreError::Io(e)),
            }
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
    }
}

/// Remove a stale lock file. Returns true if this process won the removal.
fn break_if_stale(path: &Path, stale_age: Duration) -> bool {
    if !is_stale(path, stale_age) {
        return false;
    }
    // Rename to a unique name before unlinking so that of several
    // contenders exactly one takes the stale lock over.
    let Some(name) = path.file_name() else {
        return false;
    };
    let takeover = temp_path(path, name);
    if fs::rename(path, &takeover).is_ok() {
        log::warn!("breaking stale lock {}", path.display());
        fs::remove_file(&takeover).ok();
        true
    } else {
        // Lost the race; someone else broke it or the holder released.
        false
    }
}

fn is_stale(path: &Path, stale_age: Duration) -> bool {
    // A lock whose holder PID no longer exists is stale. Signal 0 checks
    // existence without sending anything.
    if let Ok(pid_str) = fs::read_to_string(path)
        && let Ok(pid) = pid_str.trim().parse::<i32>()
        && pid > 0
    {
        let alive = unsafe { libc::kill(pid, 0) == 0 };
        if !alive {
            return true;
        }
    }

    // Age threshold catches garbage lock files and wedged holders.
    if let Ok(modified) = fs::metadata(path).and_then(|m| m.modified())
        && let Ok(age) = SystemTime::now().duration_since(modified)
    {
        return age > stale_age;
    }
    false
}

/// Sweep leftover temp files from interrupted writes.
///
/// Walks the root and its immediate subdirectories for `*.tmp.*` names
/// older than `max_age`. Best-effort; failures are ignored.
pub fn sweep_orphans(root: &Path, max_age: Duration) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Ok(children) = fs::read_dir(&path) {
                for child in children.flatten() {
                    sweep_file(&child.path(), max_age);
                }
            }
        } else {
            sweep_file(&path, max_age);
        }
    }
}

fn sweep_file(path: &Path, max_age: Duration) {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    if !name.contains(".tmp.") {
        return;
    }
    let old_enough = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > max_age);
    if old_enough {
        log::debug!("sweeping orphaned temp file {}", path.display());
        fs::remove_file(path).ok();
    }
}
