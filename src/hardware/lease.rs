//! Cross-Process Exclusive Instrument Lease
//!
//! The optical instruments are shared by every station process on the bench, so access
//! is serialized with an OS file lock on a lock file in the configured lock directory:
//! `flock(LOCK_EX | LOCK_NB)` on Unix, `LockFileEx` through `File::try_lock` elsewhere.
//! The lock belongs to the open file description: it is released when the file is
//! closed, which also happens when the owning process dies.
//!
//! Within one process the lease tracks the current holder so that a reentrant holder
//! can enter again without touching the lock file. Releases are counted and only the
//! outermost one unlocks.
//!
//! Every real acquisition and release appends one line to the audit log:
//!
//! ```text
//! [2026-03-02_10-15-00] Permission asked by OP1234 in bay #07
//! [2026-03-02_10-16-42] Exited by OP1234 in bay #07
//! ```

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::StationConfig;
use crate::TIMESTAMP_FORMAT;

/// Lease failures
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Maximum timeout {waited:?} reached waiting for lease '{name}' (holder {holder})")]
    Timeout {
        name: String,
        holder: String,
        waited: Duration,
    },

    #[error("Holder {holder} tried to re-enter non-reentrant lease '{name}'")]
    NotReentrant { name: String, holder: String },

    #[error("Lease file error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Lease parameters
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Lock name; the lock file is `<lock_dir>/<name>.lock`
    pub name: String,
    pub lock_dir: PathBuf,
    /// Audit log appended on acquire and release
    pub audit_log: PathBuf,
    /// Maximum time `acquire` waits for the lock
    pub timeout: Duration,
    /// Sleep between lock attempts
    pub poll_interval: Duration,
    pub reentrant: bool,
}

impl LeaseSettings {
    /// Settings from the `station` and `lease` configuration sections.
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            name: config.lease.name.clone(),
            lock_dir: config.station.lock_dir.clone(),
            audit_log: config.station.lock_log.clone(),
            timeout: config.lease_timeout(),
            poll_interval: config.lease_poll_interval(),
            reentrant: config.lease.reentrant,
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", self.name))
    }
}

/// Snapshot of a held lease
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseState {
    pub holder_id: String,
    pub bay: Option<u16>,
    pub acquired_at: DateTime<Local>,
    /// Nesting depth; 1 for a single acquisition
    pub reentrant_count: u32,
}

#[derive(Debug)]
struct Held {
    /// Holds the OS lock until dropped
    _file: File,
    state: LeaseState,
}

type HeldMap = Arc<Mutex<HashMap<String, Held>>>;

fn lock_held(held: &Mutex<HashMap<String, Held>>) -> MutexGuard<'_, HashMap<String, Held>> {
    held.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive lease over the shared optical instruments
///
/// Cloning shares the in-process holder bookkeeping. Two independent `InstrumentLease`
/// values over the same lock file contend exactly like two processes.
#[derive(Clone)]
pub struct InstrumentLease {
    settings: Arc<LeaseSettings>,
    held: HeldMap,
}

impl InstrumentLease {
    pub fn new(settings: LeaseSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    /// Current state for `holder`, if it holds the lease in this process.
    pub fn state(&self, holder: &str) -> Option<LeaseState> {
        lock_held(&self.held).get(holder).map(|h| h.state.clone())
    }

    /// Acquire with the configured timeout and poll interval.
    pub async fn acquire(&self, holder: &str, bay: Option<u16>) -> Result<LeaseGuard, LeaseError> {
        self.acquire_with(
            holder,
            bay,
            self.settings.timeout,
            self.settings.poll_interval,
        )
        .await
    }

    /// Acquire the lease for `holder`.
    ///
    /// Each attempt is a non-blocking lock; between attempts the task sleeps
    /// `min(poll_interval, remaining)`. At least one attempt is made even with a zero
    /// timeout. On timeout nothing is left held.
    pub async fn acquire_with(
        &self,
        holder: &str,
        bay: Option<u16>,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<LeaseGuard, LeaseError> {
        {
            let mut held = lock_held(&self.held);
            if let Some(entry) = held.get_mut(holder) {
                if !self.settings.reentrant {
                    return Err(LeaseError::NotReentrant {
                        name: self.settings.name.clone(),
                        holder: holder.to_string(),
                    });
                }
                entry.state.reentrant_count += 1;
                debug!(
                    lease = %self.settings.name,
                    holder,
                    depth = entry.state.reentrant_count,
                    "Lease re-entered"
                );
                return Ok(self.guard(holder));
            }
        }

        let path = self.settings.lock_path();
        debug!(lease = %self.settings.name, holder, "Trying to obtain the lease");
        let start = Instant::now();
        let file = loop {
            let file = self.open_lock_file(&path)?;
            if try_flock_exclusive(&file).map_err(|source| LeaseError::Io {
                path: path.clone(),
                source,
            })? {
                break file;
            }
            drop(file);

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                warn!(lease = %self.settings.name, holder, ?timeout, "Lease timeout");
                return Err(LeaseError::Timeout {
                    name: self.settings.name.clone(),
                    holder: holder.to_string(),
                    waited: elapsed,
                });
            }
            tokio::time::sleep(poll_interval.min(timeout - elapsed)).await;
        };

        let state = LeaseState {
            holder_id: holder.to_string(),
            bay,
            acquired_at: Local::now(),
            reentrant_count: 1,
        };
        // Dropping `file` on this error path releases the lock again.
        append_audit(
            &self.settings.audit_log,
            &format!("Permission asked by {} in bay #{}", holder, bay_label(bay)),
        )
        .map_err(|source| LeaseError::Io {
            path: self.settings.audit_log.clone(),
            source,
        })?;
        debug!(lease = %self.settings.name, holder, bay = ?bay, "Lease obtained");

        lock_held(&self.held).insert(holder.to_string(), Held { _file: file, state });
        Ok(self.guard(holder))
    }

    fn guard(&self, holder: &str) -> LeaseGuard {
        LeaseGuard {
            held: Arc::clone(&self.held),
            settings: Arc::clone(&self.settings),
            holder: holder.to_string(),
        }
    }

    fn open_lock_file(&self, path: &Path) -> Result<File, LeaseError> {
        let io_err = |source| LeaseError::Io {
            path: path.to_path_buf(),
            source,
        };
        fs::create_dir_all(&self.settings.lock_dir).map_err(io_err)?;
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)
    }
}

/// RAII guard for one level of lease nesting
///
/// Dropping the outermost guard unlocks the lock file and writes the release line to the
/// audit log. The lock file itself is never deleted.
#[derive(Debug)]
pub struct LeaseGuard {
    held: HeldMap,
    settings: Arc<LeaseSettings>,
    holder: String,
}

impl LeaseGuard {
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn state(&self) -> Option<LeaseState> {
        lock_held(&self.held).get(&self.holder).map(|h| h.state.clone())
    }

    /// Release explicitly; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let released = {
            let mut held = lock_held(&self.held);
            match held.get_mut(&self.holder) {
                Some(entry) if entry.state.reentrant_count > 1 => {
                    entry.state.reentrant_count -= 1;
                    None
                }
                Some(_) => held.remove(&self.holder),
                None => None,
            }
        };
        let Some(entry) = released else {
            return;
        };

        let bay = entry.state.bay;
        let held_for = Local::now() - entry.state.acquired_at;
        drop(entry);
        debug!(
            lease = %self.settings.name,
            holder = %self.holder,
            minutes = held_for.num_seconds() as f64 / 60.0,
            "Lease released"
        );
        if let Err(e) = append_audit(
            &self.settings.audit_log,
            &format!("Exited by {} in bay #{}", self.holder, bay_label(bay)),
        ) {
            warn!(path = %self.settings.audit_log.display(), error = %e, "Failed to write lease audit line");
        }
    }
}

fn bay_label(bay: Option<u16>) -> String {
    match bay {
        Some(bay) => format!("{:02}", bay),
        None => "--".to_string(),
    }
}

fn append_audit(path: &Path, message: &str) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "[{}] {}", Local::now().format(TIMESTAMP_FORMAT), message)
}

/// Try to acquire an exclusive lock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if another open file
/// description already holds it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for the duration of the call.
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
        // LockFileEx on Windows; the lock is held until the handle is closed.
        match file.try_lock() {
            Ok(()) => Ok(true),
            Err(std::fs::TryLockError::WouldBlock) => Ok(false),
            Err(std::fs::TryLockError::Error(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &TempDir, reentrant: bool) -> LeaseSettings {
        LeaseSettings {
            name: "Optical_lock".into(),
            lock_dir: dir.path().join("lock"),
            audit_log: dir.path().join("lock/lock_log.txt"),
            timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
            reentrant,
        }
    }

    fn audit_lines(dir: &TempDir) -> Vec<String> {
        fs::read_to_string(dir.path().join("lock/lock_log.txt"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_lock_file_excludes_second_descriptor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Optical_lock.lock");
        let open = || {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .unwrap()
        };

        let first = open();
        let second = open();
        assert!(try_flock_exclusive(&first).unwrap());
        assert!(!try_flock_exclusive(&second).unwrap());

        drop(first);
        assert!(try_flock_exclusive(&second).unwrap());
    }

    #[tokio::test]
    async fn test_acquire_release_audit() {
        let dir = TempDir::new().unwrap();
        let lease = InstrumentLease::new(settings(&dir, false));

        let guard = lease.acquire("OP1234", Some(7)).await.unwrap();
        let state = guard.state().unwrap();
        assert_eq!(state.holder_id, "OP1234");
        assert_eq!(state.bay, Some(7));
        assert_eq!(state.reentrant_count, 1);
        guard.release();

        let lines = audit_lines(&dir);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] Permission asked by OP1234 in bay #07"));
        assert!(lines[1].ends_with("] Exited by OP1234 in bay #07"));
        assert!(lines[0].starts_with('['));
        // Lock file survives release
        assert!(dir.path().join("lock/Optical_lock.lock").exists());
        assert!(lease.state("OP1234").is_none());
    }

    #[tokio::test]
    async fn test_second_station_times_out() {
        let dir = TempDir::new().unwrap();
        let station_a = InstrumentLease::new(settings(&dir, false));
        let station_b = InstrumentLease::new(settings(&dir, false));

        let _held = station_a.acquire("A", Some(1)).await.unwrap();
        let start = Instant::now();
        let err = station_b
            .acquire_with("B", Some(2), Duration::from_millis(200), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::Timeout { .. }));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(station_b.state("B").is_none());
        // Only A's acquisition was audited
        assert_eq!(audit_lines(&dir).len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let dir = TempDir::new().unwrap();
        let station_a = InstrumentLease::new(settings(&dir, false));
        let station_b = InstrumentLease::new(settings(&dir, false));

        let held = station_a.acquire("A", Some(1)).await.unwrap();
        let waiter = tokio::spawn(async move {
            station_b
                .acquire_with("B", Some(2), Duration::from_secs(2), Duration::from_millis(20))
                .await
                .map(|g| g.holder().to_string())
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), "B");
        let lines = audit_lines(&dir);
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains("Exited by A"));
        assert!(lines[2].contains("Permission asked by B in bay #02"));
    }

    #[tokio::test]
    async fn test_other_holder_in_same_process_contends() {
        let dir = TempDir::new().unwrap();
        let lease = InstrumentLease::new(settings(&dir, true));

        let _a = lease.acquire("A", None).await.unwrap();
        let err = lease
            .acquire_with("B", None, Duration::from_millis(60), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_reentrant_counts() {
        let dir = TempDir::new().unwrap();
        let lease = InstrumentLease::new(settings(&dir, true));
        let other = InstrumentLease::new(settings(&dir, true));

        let outer = lease.acquire("A", Some(3)).await.unwrap();
        let inner = lease.acquire("A", Some(3)).await.unwrap();
        assert_eq!(lease.state("A").unwrap().reentrant_count, 2);

        drop(inner);
        assert_eq!(lease.state("A").unwrap().reentrant_count, 1);
        assert!(other
            .acquire_with("B", None, Duration::ZERO, Duration::from_millis(10))
            .await
            .is_err());

        drop(outer);
        assert!(lease.state("A").is_none());
        assert!(other
            .acquire_with("B", None, Duration::ZERO, Duration::from_millis(10))
            .await
            .is_ok());
        // Nested entry is not audited
        assert_eq!(audit_lines(&dir).len(), 4);
    }

    #[tokio::test]
    async fn test_non_reentrant_rejects_second_entry() {
        let dir = TempDir::new().unwrap();
        let lease = InstrumentLease::new(settings(&dir, false));

        let _guard = lease.acquire("A", Some(1)).await.unwrap();
        let err = lease.acquire("A", Some(1)).await.unwrap_err();
        assert!(matches!(err, LeaseError::NotReentrant { .. }));
        assert_eq!(lease.state("A").unwrap().reentrant_count, 1);
    }

    #[test]
    fn test_bay_label() {
        assert_eq!(bay_label(Some(5)), "05");
        assert_eq!(bay_label(Some(70)), "70");
        assert_eq!(bay_label(None), "--");
    }
}
