use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use runledger_core::segment::write_file_atomic;
use runledger_core::{format_rfc3339, now_utc, LedgerError, Watermark};
use serde::{Deserialize, Serialize};

use crate::lease::LeaseGuard;

const WATERMARK_CONTRACT_VERSION: &str = "watermark.v1";

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    contract_version: String,
    updated_at: String,
    watermark: Watermark,
}

/// Durable indexer progress, stored as `<db>.watermark.json`.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
}

impl WatermarkStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn for_database(db_path: &Path) -> Self {
        Self::new(sibling_path(db_path, "watermark.json"))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last saved watermark, or the origin when none was saved yet.
    ///
    /// # Errors
    /// Returns [`LedgerError::Corrupt`] when the file cannot be decoded.
    pub fn load(&self) -> Result<Watermark, LedgerError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Watermark::origin()),
            Err(err) => {
                return Err(LedgerError::Io(format!("failed to read watermark: {err}")));
            }
        };
        let file: WatermarkFile = serde_json::from_slice(&bytes).map_err(|err| {
            LedgerError::Corrupt(format!(
                "invalid watermark file {}: {err}",
                self.path.display()
            ))
        })?;
        if file.contract_version != WATERMARK_CONTRACT_VERSION {
            return Err(LedgerError::Corrupt(format!(
                "unsupported watermark contract {}",
                file.contract_version
            )));
        }
        Ok(file.watermark)
    }

    /// Replaces the saved watermark. Only the current lease holder may save.
    ///
    /// # Errors
    /// Returns [`LedgerError::LeaseConflict`] when `guard` no longer holds the
    /// lease, or [`LedgerError::Io`] when the write fails.
    pub fn save(&self, guard: &LeaseGuard, watermark: &Watermark) -> Result<(), LedgerError> {
        guard.verify()?;
        let file = WatermarkFile {
            contract_version: WATERMARK_CONTRACT_VERSION.to_string(),
            updated_at: format_rfc3339(now_utc())?,
            watermark: watermark.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|err| LedgerError::Io(format!("failed to encode watermark: {err}")))?;
        write_file_atomic(&self.path, &bytes)
    }
}

/// `<db file name>.<suffix>` in the database's directory.
pub(crate) fn sibling_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map_or_else(|| OsString::from("index"), ToOwned::to_owned);
    name.push(".");
    name.push(suffix);
    db_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::IndexLease;
    use runledger_core::{PartitionKey, SegmentId};
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn sibling_paths_share_the_database_directory() {
        let db = Path::new("/var/lib/runledger/index.sqlite3");
        assert_eq!(
            sibling_path(db, "lease"),
            PathBuf::from("/var/lib/runledger/index.sqlite3.lease")
        );
        assert_eq!(
            WatermarkStore::for_database(db).path(),
            Path::new("/var/lib/runledger/index.sqlite3.watermark.json")
        );
    }

    #[test]
    fn missing_file_loads_origin_and_save_requires_live_lease() {
        let dir = std::env::temp_dir().join(format!("runledger-state-{}", Ulid::new()));
        let db = dir.join("index.sqlite3");
        let store = WatermarkStore::for_database(&db);
        assert!(must(store.load()).is_origin());

        let mut watermark = Watermark::origin();
        watermark.advance(
            SegmentId::new(must(PartitionKey::parse("2026-02-07")), 1),
            420,
        );

        let lease = IndexLease::for_database(&db, "test", 60_000);
        let guard = must(lease.acquire());
        must(store.save(&guard, &watermark));
        assert_eq!(must(store.load()), watermark);
        must(guard.release());

        let stale = must(lease.acquire());
        must(fs::remove_file(lease.path()));
        assert!(matches!(
            store.save(&stale, &Watermark::origin()),
            Err(LedgerError::LeaseConflict { .. })
        ));
        assert_eq!(must(store.load()), watermark);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn garbage_file_is_reported_as_corrupt() {
        let path = std::env::temp_dir().join(format!("runledger-wm-{}.json", Ulid::new()));
        must(fs::write(&path, b"not json"));
        assert!(matches!(
            WatermarkStore::new(&path).load(),
            Err(LedgerError::Corrupt(_))
        ));
        let _ = fs::remove_file(path);
    }
}
