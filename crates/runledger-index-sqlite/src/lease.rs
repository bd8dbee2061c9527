use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, UNIX_EPOCH};

use runledger_core::segment::{sync_parent_dir, write_file_atomic};
use runledger_core::{now_epoch_ms, LedgerError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::state::sibling_path;

const ACQUIRE_ATTEMPTS: usize = 3;
const MUTATION_LOCK_WAIT: Duration = Duration::from_secs(2);
const MUTATION_LOCK_POLL: Duration = Duration::from_millis(1);
/// A mutation lock older than this was left by a crashed process.
const MUTATION_LOCK_STALE_MS: i64 = 10_000;

/// Contents of the lease file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRecord {
    pub holder: String,
    pub token: Ulid,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
}

/// Exclusive right to write the derived store and its watermark, shared
/// across processes through a file next to the database.
#[derive(Debug, Clone)]
pub struct IndexLease {
    path: PathBuf,
    holder: String,
    ttl_ms: u64,
}

enum LeaseFile {
    Missing,
    Held(LeaseRecord),
    Unreadable { modified_ms: i64 },
}

impl IndexLease {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, holder: impl Into<String>, ttl_ms: u64) -> Self {
        Self {
            path: path.into(),
            holder: holder.into(),
            ttl_ms,
        }
    }

    /// Lease file `<db>.lease`.
    #[must_use]
    pub fn for_database(db_path: &Path, holder: impl Into<String>, ttl_ms: u64) -> Self {
        Self::new(sibling_path(db_path, "lease"), holder, ttl_ms)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Current lease file contents, if any.
    ///
    /// # Errors
    /// Returns [`LedgerError::Corrupt`] for an unparsable lease file.
    pub fn read(&self) -> Result<Option<LeaseRecord>, LedgerError> {
        match read_lease_file(&self.path)? {
            LeaseFile::Missing => Ok(None),
            LeaseFile::Held(record) => Ok(Some(record)),
            LeaseFile::Unreadable { .. } => Err(LedgerError::Corrupt(format!(
                "unreadable lease file {}",
                self.path.display()
            ))),
        }
    }

    /// Takes the lease, replacing an expired one left by a crashed holder.
    ///
    /// # Errors
    /// Returns [`LedgerError::LeaseConflict`] while another holder's lease is
    /// live, and [`LedgerError::Io`] when the lease file cannot be written.
    pub fn acquire(&self) -> Result<LeaseGuard, LedgerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    LedgerError::Io(format!("failed to create lease directory: {err}"))
                })?;
            }
        }

        for _ in 0..ACQUIRE_ATTEMPTS {
            let now = now_epoch_ms();
            let record = LeaseRecord {
                holder: self.holder.clone(),
                token: Ulid::new(),
                acquired_at_ms: now,
                expires_at_ms: now.saturating_add(self.ttl_i64()),
            };
            let bytes = encode(&record)?;

            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let written = file.write_all(&bytes).and_then(|()| file.sync_all());
                    if let Err(err) = written {
                        let _ = fs::remove_file(&self.path);
                        return Err(LedgerError::Io(format!("failed to write lease: {err}")));
                    }
                    sync_parent_dir(&self.path)?;
                    debug!(holder = %record.holder, token = %record.token, "index lease acquired");
                    return Ok(self.guard(record));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(LedgerError::Io(format!("failed to create lease: {err}")));
                }
            }

            if !self.is_expired(now)? {
                continue;
            }

            // Expired. Takeovers, renewals and releases all run under the
            // mutation lock, so the expiry is re-checked against the file as
            // it is now.
            let _lock = MutationLock::acquire(&self.path)?;
            let now = now_epoch_ms();
            if !self.is_expired(now)? {
                continue;
            }
            let record = LeaseRecord {
                acquired_at_ms: now,
                expires_at_ms: now.saturating_add(self.ttl_i64()),
                ..record
            };
            write_file_atomic(&self.path, &encode(&record)?)?;
            warn!(holder = %record.holder, "expired index lease taken over");
            return Ok(self.guard(record));
        }

        Err(LedgerError::LeaseConflict {
            holder: "unknown".to_string(),
            expires_at_ms: now_epoch_ms(),
        })
    }

    /// `Ok(false)` when the lease file is gone, `Ok(true)` when it is past
    /// its expiry, and a conflict while it is live.
    fn is_expired(&self, now: i64) -> Result<bool, LedgerError> {
        match read_lease_file(&self.path)? {
            LeaseFile::Missing => Ok(false),
            LeaseFile::Held(current) if current.expires_at_ms > now => {
                Err(LedgerError::LeaseConflict {
                    holder: current.holder,
                    expires_at_ms: current.expires_at_ms,
                })
            }
            LeaseFile::Unreadable { modified_ms }
                if modified_ms.saturating_add(self.ttl_i64()) > now =>
            {
                Err(LedgerError::LeaseConflict {
                    holder: "unknown".to_string(),
                    expires_at_ms: modified_ms.saturating_add(self.ttl_i64()),
                })
            }
            LeaseFile::Held(_) | LeaseFile::Unreadable { .. } => Ok(true),
        }
    }

    fn guard(&self, record: LeaseRecord) -> LeaseGuard {
        LeaseGuard {
            path: self.path.clone(),
            ttl_ms: self.ttl_ms,
            record,
            released: false,
        }
    }

    fn ttl_i64(&self) -> i64 {
        i64::try_from(self.ttl_ms).unwrap_or(i64::MAX)
    }
}

/// Proof of holding the lease. Released on drop if not released explicitly.
#[derive(Debug)]
pub struct LeaseGuard {
    path: PathBuf,
    ttl_ms: u64,
    record: LeaseRecord,
    released: bool,
}

impl LeaseGuard {
    #[must_use]
    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    #[must_use]
    pub fn token(&self) -> Ulid {
        self.record.token
    }

    /// Confirms the lease file still carries this guard's token.
    ///
    /// # Errors
    /// Returns [`LedgerError::LeaseConflict`] when the lease was taken over
    /// or removed.
    pub fn verify(&self) -> Result<(), LedgerError> {
        match read_lease_file(&self.path)? {
            LeaseFile::Held(current) if current.token == self.record.token => Ok(()),
            LeaseFile::Held(current) => Err(LedgerError::LeaseConflict {
                holder: current.holder,
                expires_at_ms: current.expires_at_ms,
            }),
            LeaseFile::Missing | LeaseFile::Unreadable { .. } => Err(LedgerError::LeaseConflict {
                holder: "nobody".to_string(),
                expires_at_ms: 0,
            }),
        }
    }

    /// Extends the expiry by one TTL from now.
    ///
    /// # Errors
    /// Same as [`LeaseGuard::verify`], plus [`LedgerError::Io`].
    pub fn renew(&mut self) -> Result<(), LedgerError> {
        let _lock = MutationLock::acquire(&self.path)?;
        self.verify()?;
        let ttl = i64::try_from(self.ttl_ms).unwrap_or(i64::MAX);
        let renewed = LeaseRecord {
            expires_at_ms: now_epoch_ms().saturating_add(ttl),
            ..self.record.clone()
        };
        write_file_atomic(&self.path, &encode(&renewed)?)?;
        self.record = renewed;
        Ok(())
    }

    /// Removes the lease file.
    ///
    /// # Errors
    /// Same as [`LeaseGuard::verify`]; a lease that was taken over is left in
    /// place for its new holder.
    pub fn release(mut self) -> Result<(), LedgerError> {
        self.released = true;
        let _lock = MutationLock::acquire(&self.path)?;
        self.verify()?;
        fs::remove_file(&self.path)
            .map_err(|err| LedgerError::Io(format!("failed to remove lease: {err}")))?;
        debug!(token = %self.record.token, "index lease released");
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Ok(_lock) = MutationLock::acquire(&self.path) {
            if self.verify().is_ok() {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

/// `<lease>.lock`, created exclusively around every change to an existing
/// lease file.
struct MutationLock {
    path: PathBuf,
}

impl MutationLock {
    fn acquire(lease_path: &Path) -> Result<Self, LedgerError> {
        let path = sibling_path(lease_path, "lock");
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(LedgerError::Io(format!("failed to create lease lock: {err}")));
                }
            }

            if modified_ms(&path).is_some_and(|modified| {
                modified.saturating_add(MUTATION_LOCK_STALE_MS) < now_epoch_ms()
            }) {
                warn!(path = %path.display(), "removing abandoned lease lock");
                let _ = fs::remove_file(&path);
                continue;
            }
            if started.elapsed() >= MUTATION_LOCK_WAIT {
                return Err(LedgerError::LeaseConflict {
                    holder: "lease-lock".to_string(),
                    expires_at_ms: now_epoch_ms(),
                });
            }
            thread::sleep(MUTATION_LOCK_POLL);
        }
    }
}

impl Drop for MutationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn encode(record: &LeaseRecord) -> Result<Vec<u8>, LedgerError> {
    serde_json::to_vec_pretty(record)
        .map_err(|err| LedgerError::Io(format!("failed to encode lease: {err}")))
}

fn read_lease_file(path: &Path) -> Result<LeaseFile, LedgerError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LeaseFile::Missing),
        Err(err) => return Err(LedgerError::Io(format!("failed to read lease: {err}"))),
    };
    if let Ok(record) = serde_json::from_slice::<LeaseRecord>(&bytes) {
        return Ok(LeaseFile::Held(record));
    }

    Ok(LeaseFile::Unreadable {
        modified_ms: modified_ms(path).unwrap_or(0),
    })
}

fn modified_ms(path: &Path) -> Option<i64> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}
