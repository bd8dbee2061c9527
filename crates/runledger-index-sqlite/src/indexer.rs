//! Replays the event log into the derived store.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::Transaction;
use runledger_core::{
    format_rfc3339, now_utc, Deadline, Event, LedgerConfig, LedgerError, LogLayout, LogReader,
    LoggedEvent, PartitionKey, SchemaRegistry, Watermark,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::lease::{IndexLease, LeaseGuard};
use crate::materialize::{self, Outcome};
use crate::state::WatermarkStore;
use crate::{IndexCheck, IndexStatus, PassRecord, SqliteDerivedStore};

const ERROR_SAMPLE_CAP: usize = 10;

/// Counters for one indexing pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStats {
    pub events_seen: u64,
    pub applied: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub superseded: u64,
    pub out_of_order: u64,
    pub errors: u64,
    pub resolved: u64,
    pub corrupt_records: u64,
    pub bytes_scanned: u64,
    pub error_samples: Vec<String>,
}

impl IndexStats {
    fn record(&mut self, event: &Event, outcome: &Outcome) {
        match outcome {
            Outcome::Applied {
                superseded,
                out_of_order,
            } => {
                self.applied += 1;
                if *superseded {
                    self.superseded += 1;
                    debug!(event_id = %event.event_id, key = %event.idempotency_key, "earlier duplicate superseded");
                }
                if *out_of_order {
                    self.out_of_order += 1;
                    warn!(
                        event_id = %event.event_id,
                        run_id = event.run_id.as_deref().unwrap_or(""),
                        "phase completed before its start was indexed"
                    );
                }
            }
            Outcome::Skipped => self.skipped += 1,
            Outcome::Duplicate => {
                self.duplicates += 1;
                debug!(event_id = %event.event_id, key = %event.idempotency_key, "duplicate event ignored");
            }
            Outcome::Rejected { code, message } => {
                self.errors += 1;
                if self.error_samples.len() < ERROR_SAMPLE_CAP {
                    self.error_samples
                        .push(format!("{} {code}: {message}", event.event_id));
                }
                warn!(event_id = %event.event_id, code = *code, %message, "event rejected by indexer");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    Incremental,
    Since,
    Full,
}

impl PassMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Since => "since",
            Self::Full => "full",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incremental" => Some(Self::Incremental),
            "since" => Some(Self::Since),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Result of a committed pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassReport {
    pub contract_version: String,
    pub pass_id: String,
    pub mode: PassMode,
    pub since: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub stats: IndexStats,
    pub watermark: Watermark,
}

pub struct Indexer {
    store: SqliteDerivedStore,
    reader: LogReader,
    registry: SchemaRegistry,
    watermarks: WatermarkStore,
    lease: IndexLease,
    read_only: bool,
}

impl Indexer {
    /// Opens the derived store at `db_path` for the log under `log_root`,
    /// with its watermark and lease files beside the database.
    pub fn open(log_root: &Path, db_path: &Path, config: &LedgerConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteDerivedStore::open(db_path)?;
        store.migrate()?;
        Ok(Self::with_store(store, log_root, db_path, config))
    }

    /// Opens for [`Indexer::status`] and [`Indexer::check`] without writing
    /// anything: an existing store read-only, a missing one as an empty
    /// in-memory store. Passes on the result fail.
    pub fn open_read_only(log_root: &Path, db_path: &Path, config: &LedgerConfig) -> Result<Self> {
        config.validate()?;
        let store = if db_path.exists() {
            SqliteDerivedStore::open_read_only(db_path)?
        } else {
            let store = SqliteDerivedStore::open(Path::new(":memory:"))?;
            store.migrate()?;
            store
        };
        Ok(Self {
            read_only: true,
            ..Self::with_store(store, log_root, db_path, config)
        })
    }

    fn with_store(
        store: SqliteDerivedStore,
        log_root: &Path,
        db_path: &Path,
        config: &LedgerConfig,
    ) -> Self {
        let holder = format!("pid-{}", std::process::id());
        Self::new(
            store,
            LogReader::new(LogLayout::new(log_root)),
            SchemaRegistry::builtin(),
            WatermarkStore::for_database(db_path),
            IndexLease::for_database(db_path, holder, config.lease_ttl_ms),
        )
    }

    #[must_use]
    pub fn new(
        store: SqliteDerivedStore,
        reader: LogReader,
        registry: SchemaRegistry,
        watermarks: WatermarkStore,
        lease: IndexLease,
    ) -> Self {
        Self {
            store,
            reader,
            registry,
            watermarks,
            lease,
            read_only: false,
        }
    }

    #[must_use]
    pub fn store(&self) -> &SqliteDerivedStore {
        &self.store
    }

    #[must_use]
    pub fn reader(&self) -> &LogReader {
        &self.reader
    }

    #[must_use]
    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    #[must_use]
    pub fn lease(&self) -> &IndexLease {
        &self.lease
    }

    /// Applies everything after `watermark` in one transaction and returns
    /// the new watermark. Neither the lease nor the saved watermark is
    /// touched; callers that need those use [`Indexer::run_incremental_pass`].
    pub fn rebuild_incremental(
        &mut self,
        watermark: &Watermark,
        deadline: Deadline,
    ) -> Result<(Watermark, IndexStats)> {
        self.apply(watermark, false, deadline, None)
    }

    /// Truncates the derived tables and replays the whole log in one
    /// transaction.
    pub fn rebuild_full(&mut self, deadline: Deadline) -> Result<(Watermark, IndexStats)> {
        self.apply(&Watermark::origin(), true, deadline, None)
    }

    /// Leased pass from the saved watermark, or from `since` onward when
    /// given. A `since` pass folds its cursors into the saved watermark
    /// instead of replacing it.
    pub fn run_incremental_pass(
        &mut self,
        since: Option<PartitionKey>,
        deadline: Deadline,
    ) -> Result<PassReport> {
        let mode = if since.is_some() {
            PassMode::Since
        } else {
            PassMode::Incremental
        };
        self.run_pass(mode, since, deadline)
    }

    /// Leased full rebuild. The saved watermark is replaced by the rebuild's.
    pub fn run_full_rebuild(&mut self, deadline: Deadline) -> Result<PassReport> {
        self.run_pass(PassMode::Full, None, deadline)
    }

    pub fn status(&self) -> Result<IndexStatus> {
        let watermark = self.watermarks.load()?;
        self.store
            .index_status(&self.reader, &watermark, self.current_lease())
    }

    pub fn check(&self) -> Result<IndexCheck> {
        let watermark = self.watermarks.load()?;
        self.store
            .index_check(&self.reader, &watermark, self.current_lease())
    }

    fn current_lease(&self) -> Option<crate::LeaseRecord> {
        match self.lease.read() {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable index lease");
                None
            }
        }
    }

    fn run_pass(
        &mut self,
        mode: PassMode,
        since: Option<PartitionKey>,
        deadline: Deadline,
    ) -> Result<PassReport> {
        if self.read_only {
            bail!("indexer was opened read-only");
        }
        let started_at = format_rfc3339(now_utc())?;
        let mut guard = self.lease.acquire()?;
        let persisted = self.watermarks.load()?;

        let (watermark, stats) = match (mode, since) {
            (PassMode::Full, _) => {
                self.apply(&Watermark::origin(), true, deadline, Some(&mut guard))?
            }
            (_, Some(partition)) => {
                let (scanned, stats) =
                    self.apply(&Watermark::since(partition), false, deadline, Some(&mut guard))?;
                let mut merged = persisted;
                merged.merge(&scanned);
                (merged, stats)
            }
            (_, None) => self.apply(&persisted, false, deadline, Some(&mut guard))?,
        };

        // Derived rows are committed at this point; a crash before the save
        // below only causes a replay that the idempotency ledger absorbs.
        self.watermarks.save(&guard, &watermark)?;

        let record = PassRecord {
            pass_id: Ulid::new().to_string(),
            mode,
            started_at,
            finished_at: format_rfc3339(now_utc())?,
            stats,
            watermark,
        };
        self.store.record_pass(&record)?;
        guard.release()?;

        info!(
            pass_id = %record.pass_id,
            mode = mode.as_str(),
            events_seen = record.stats.events_seen,
            applied = record.stats.applied,
            skipped = record.stats.skipped,
            duplicates = record.stats.duplicates,
            errors = record.stats.errors,
            resolved = record.stats.resolved,
            out_of_order = record.stats.out_of_order,
            "index pass committed"
        );

        Ok(PassReport {
            contract_version: "index_pass.v1".to_string(),
            pass_id: record.pass_id,
            mode,
            since: since.map(|partition| partition.to_string()),
            started_at: record.started_at,
            finished_at: record.finished_at,
            stats: record.stats,
            watermark: record.watermark,
        })
    }

    fn apply(
        &mut self,
        from: &Watermark,
        truncate_first: bool,
        deadline: Deadline,
        guard: Option<&mut LeaseGuard>,
    ) -> Result<(Watermark, IndexStats)> {
        if self.read_only {
            bail!("indexer was opened read-only");
        }
        let mut scan = self.reader.read_from(from)?;
        let mut stats = IndexStats::default();

        let registry = &self.registry;
        let tx = self.store.transaction()?;
        if truncate_first {
            materialize::truncate(&tx)?;
        }

        // One partition is held in memory at a time. Cross-partition
        // references are settled by `resolve_pending` below.
        let mut batch: Vec<LoggedEvent> = Vec::new();
        for item in scan.by_ref() {
            deadline.check("index scan")?;
            let logged = item?;
            let next_partition = batch.last().is_some_and(|last| {
                last.position.segment.partition != logged.position.segment.partition
            });
            if next_partition {
                apply_batch(&tx, registry, &mut batch, &mut stats, deadline)?;
            }
            batch.push(logged);
        }
        apply_batch(&tx, registry, &mut batch, &mut stats, deadline)?;

        let scan_stats = scan.stats();
        stats.corrupt_records = scan_stats.corrupt_records;
        stats.bytes_scanned = scan_stats.bytes_scanned;
        let cursor = scan.into_cursor();

        for (event, outcome) in materialize::resolve_pending(&tx, registry)? {
            stats.resolved += 1;
            stats.record(&event, &outcome);
        }

        deadline.check("index commit")?;
        if let Some(guard) = guard {
            guard.renew()?;
        }
        tx.commit().context("failed to commit index pass")?;

        Ok((cursor, stats))
    }
}

fn apply_batch(
    tx: &Transaction<'_>,
    registry: &SchemaRegistry,
    batch: &mut Vec<LoggedEvent>,
    stats: &mut IndexStats,
    deadline: Deadline,
) -> Result<()> {
    // Stable: equal ranks keep log order.
    batch.sort_by_key(|logged| logged.event.event_type.lifecycle_rank());
    for logged in batch.drain(..) {
        deadline.check("index apply")?;
        stats.events_seen += 1;
        let outcome = materialize::apply_event(
            tx,
            registry,
            &logged.event,
            &logged.position.segment.to_string(),
            logged.position.offset,
        )?;
        stats.record(&logged.event, &outcome);
    }
    Ok(())
}

/// Maps an indexing failure to whether another holder owns the lease.
#[must_use]
pub fn lease_conflict(err: &anyhow::Error) -> Option<(&str, i64)> {
    match err.downcast_ref::<LedgerError>() {
        Some(LedgerError::LeaseConflict {
            holder,
            expires_at_ms,
        }) => Some((holder.as_str(), *expires_at_ms)),
        _ => None,
    }
}
