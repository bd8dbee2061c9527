#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite-backed derived index over the run event log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use runledger_core::{format_rfc3339, now_utc, LogReader, Watermark};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod compat;
pub mod daemon;
pub mod indexer;
pub mod lease;
mod materialize;
pub mod state;

pub use compat::{
    select_strategy, CutoverRouter, LegacyRunStore, ReadStrategy, RunReadPort, TimeRange,
};
pub use daemon::{spawn, DaemonHandle, DaemonState, DaemonSummary, IndexDaemon, TickOutcome};
pub use indexer::{IndexStats, Indexer, PassMode, PassReport};
pub use lease::{IndexLease, LeaseGuard, LeaseRecord};
pub use state::WatermarkStore;

const INDEX_MIGRATION_VERSION: i64 = 1;
const ERROR_SAMPLE_LIMIT: usize = 25;

const SCHEMA_INDEX_V1: &str = r"
CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL,
  name TEXT,
  config_hash TEXT,
  config_json TEXT,
  schema_version INTEGER NOT NULL,
  status TEXT NOT NULL CHECK(status IN ('created', 'started', 'completed', 'failed')),
  status_rank INTEGER NOT NULL,
  status_occurred_at_ms INTEGER NOT NULL,
  status_event_id TEXT NOT NULL,
  created_at_ms INTEGER NOT NULL,
  started_at_ms INTEGER,
  host TEXT,
  pid INTEGER,
  completed_at_ms INTEGER,
  duration_ms INTEGER,
  summary_json TEXT,
  failed_at_ms INTEGER,
  error TEXT,
  failed_phase TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_created_at
  ON runs(created_at_ms, run_id);

CREATE TABLE IF NOT EXISTS phases (
  run_id TEXT NOT NULL,
  phase TEXT NOT NULL,
  ordinal INTEGER,
  started_at_ms INTEGER,
  completed_at_ms INTEGER,
  duration_ms INTEGER,
  status TEXT,
  out_of_order INTEGER NOT NULL DEFAULT 0 CHECK(out_of_order IN (0, 1)),
  PRIMARY KEY (run_id, phase)
);

CREATE TABLE IF NOT EXISTS trials (
  run_id TEXT NOT NULL,
  trial_index INTEGER NOT NULL,
  params_json TEXT NOT NULL,
  metrics_json TEXT NOT NULL,
  score REAL,
  occurred_at_ms INTEGER NOT NULL,
  PRIMARY KEY (run_id, trial_index)
);

CREATE TABLE IF NOT EXISTS artifacts (
  idempotency_key TEXT PRIMARY KEY,
  artifact_id TEXT NOT NULL,
  run_id TEXT,
  kind TEXT NOT NULL,
  uri TEXT NOT NULL,
  bytes INTEGER,
  created_at_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_run
  ON artifacts(run_id, artifact_id);

CREATE TABLE IF NOT EXISTS applied_events (
  idempotency_key TEXT PRIMARY KEY,
  event_id TEXT NOT NULL,
  event_type TEXT NOT NULL,
  occurred_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS index_errors (
  event_id TEXT PRIMARY KEY,
  idempotency_key TEXT NOT NULL,
  event_type TEXT NOT NULL,
  run_id TEXT,
  segment TEXT NOT NULL,
  byte_offset INTEGER NOT NULL,
  code TEXT NOT NULL,
  message TEXT NOT NULL,
  event_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_index_errors_code_run
  ON index_errors(code, run_id);

CREATE TABLE IF NOT EXISTS index_passes (
  pass_id TEXT PRIMARY KEY,
  mode TEXT NOT NULL CHECK(mode IN ('incremental', 'since', 'full')),
  started_at TEXT NOT NULL,
  finished_at TEXT NOT NULL,
  stats_json TEXT NOT NULL,
  watermark_json TEXT NOT NULL
);

CREATE VIEW IF NOT EXISTS v_latest_runs AS
  SELECT run_id, kind, name, config_hash, status, created_at_ms, started_at_ms,
         completed_at_ms, failed_at_ms, duration_ms, error, failed_phase, summary_json
  FROM runs;

CREATE VIEW IF NOT EXISTS v_phase_timings AS
  SELECT phases.run_id, runs.kind AS run_kind, phases.phase, phases.ordinal,
         phases.started_at_ms, phases.completed_at_ms, phases.duration_ms,
         phases.status, phases.out_of_order
  FROM phases
  JOIN runs ON runs.run_id = phases.run_id;

CREATE VIEW IF NOT EXISTS v_trial_results AS
  SELECT trials.run_id, runs.kind AS run_kind, runs.config_hash, trials.trial_index,
         trials.score, trials.params_json, trials.metrics_json, trials.occurred_at_ms
  FROM trials
  JOIN runs ON runs.run_id = trials.run_id;
";

/// Tables compared by [`SqliteDerivedStore::derived_snapshot`], with the
/// ordering that makes their dumps deterministic.
const DERIVED_TABLES: [(&str, &str); 6] = [
    ("runs", "run_id"),
    ("phases", "run_id, phase"),
    ("trials", "run_id, trial_index"),
    ("artifacts", "idempotency_key"),
    ("applied_events", "idempotency_key"),
    ("index_errors", "event_id"),
];

const RUN_COLUMNS: &str = "run_id, kind, name, config_hash, status, created_at_ms, started_at_ms,
     completed_at_ms, failed_at_ms, duration_ms, error, failed_phase, summary_json";

pub struct SqliteDerivedStore {
    conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Started,
    Completed,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub kind: String,
    pub name: Option<String>,
    pub config_hash: Option<String>,
    pub status: RunStatus,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub failed_at_ms: Option<i64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub failed_phase: Option<String>,
    pub summary: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseRecord {
    pub run_id: String,
    pub phase: String,
    pub ordinal: Option<u32>,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
    pub duration_ms: Option<u64>,
    pub status: Option<String>,
    pub out_of_order: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialRecord {
    pub run_id: String,
    pub trial_index: u64,
    pub params: Value,
    pub metrics: Value,
    pub score: Option<f64>,
    pub occurred_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactRecord {
    pub artifact_id: String,
    pub run_id: Option<String>,
    pub kind: String,
    pub uri: String,
    pub bytes: Option<u64>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexErrorRecord {
    pub event_id: String,
    pub idempotency_key: String,
    pub event_type: String,
    pub run_id: Option<String>,
    pub segment: String,
    pub offset: u64,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassRecord {
    pub pass_id: String,
    pub mode: PassMode,
    pub started_at: String,
    pub finished_at: String,
    pub stats: IndexStats,
    pub watermark: Watermark,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DerivedCounts {
    pub runs: u64,
    pub phases: u64,
    pub trials: u64,
    pub artifacts: u64,
    pub applied_events: u64,
    pub index_errors: u64,
    pub unresolved_run_references: u64,
    pub out_of_order_phases: u64,
}

/// Full dump of every derived table, ordered by primary key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedSnapshot {
    pub tables: BTreeMap<String, Vec<Vec<Value>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexStatus {
    pub contract_version: String,
    pub last_partition_indexed: Option<String>,
    pub last_sequence_no: u32,
    pub last_offset_indexed: u64,
    pub segments_total: usize,
    pub segments_tracked: usize,
    pub pending_bytes: u64,
    pub torn_tail_bytes: u64,
    pub counts: DerivedCounts,
    pub last_pass: Option<PassRecord>,
    pub lease: Option<LeaseRecord>,
    pub lease_expired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IndexIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexIssue {
    pub code: String,
    pub severity: IndexIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub status: IndexStatus,
    pub issues: Vec<IndexIssue>,
    pub error_sample: Vec<IndexErrorRecord>,
}

impl SqliteDerivedStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing store for queries only.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_INDEX_V1)
            .context("failed to apply derived index schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![INDEX_MIGRATION_VERSION, now],
            )
            .context("failed to register derived index migration")?;

        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM v_latest_runs WHERE run_id = ?1"),
                params![run_id],
                parse_run_row,
            )
            .optional()
            .with_context(|| format!("failed to load run {run_id}"))
    }

    /// Most recently created runs first.
    pub fn latest_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM v_latest_runs
             ORDER BY created_at_ms DESC, run_id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], parse_run_row)?;
        collect_rows(rows)
    }

    /// Runs created in `[from_ms, to_ms)`, oldest first.
    pub fn runs_created_between(&self, from_ms: i64, to_ms: i64) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM v_latest_runs
             WHERE created_at_ms >= ?1 AND created_at_ms < ?2
             ORDER BY created_at_ms ASC, run_id ASC"
        ))?;
        let rows = stmt.query_map(params![from_ms, to_ms], parse_run_row)?;
        collect_rows(rows)
    }

    pub fn phases(&self, run_id: &str) -> Result<Vec<PhaseRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, phase, ordinal, started_at_ms, completed_at_ms, duration_ms,
                    status, out_of_order
             FROM v_phase_timings
             WHERE run_id = ?1
             ORDER BY ordinal IS NULL, ordinal ASC, phase ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(PhaseRecord {
                run_id: row.get(0)?,
                phase: row.get(1)?,
                ordinal: optional_u32(row, 2)?,
                started_at_ms: row.get(3)?,
                completed_at_ms: row.get(4)?,
                duration_ms: optional_u64(row, 5)?,
                status: row.get(6)?,
                out_of_order: row.get::<_, i64>(7)? != 0,
            })
        })?;
        collect_rows(rows)
    }

    pub fn trials(&self, run_id: &str) -> Result<Vec<TrialRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, trial_index, params_json, metrics_json, score, occurred_at_ms
             FROM v_trial_results
             WHERE run_id = ?1
             ORDER BY trial_index ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(TrialRecord {
                run_id: row.get(0)?,
                trial_index: required_u64(row, 1)?,
                params: json_column(row, 2)?,
                metrics: json_column(row, 3)?,
                score: row.get(4)?,
                occurred_at_ms: row.get(5)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Artifacts of one run, or every artifact when `run_id` is `None`.
    pub fn artifacts(&self, run_id: Option<&str>) -> Result<Vec<ArtifactRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT artifact_id, run_id, kind, uri, bytes, created_at_ms
             FROM artifacts
             WHERE ?1 IS NULL OR run_id = ?1
             ORDER BY created_at_ms ASC, idempotency_key ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(ArtifactRecord {
                artifact_id: row.get(0)?,
                run_id: row.get(1)?,
                kind: row.get(2)?,
                uri: row.get(3)?,
                bytes: optional_u64(row, 4)?,
                created_at_ms: row.get(5)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn index_errors(&self, limit: Option<usize>) -> Result<Vec<IndexErrorRecord>> {
        let limit = limit.map_or(-1, |value| i64::try_from(value).unwrap_or(i64::MAX));
        let mut stmt = self.conn.prepare(
            "SELECT event_id, idempotency_key, event_type, run_id, segment, byte_offset, code, message
             FROM index_errors
             ORDER BY segment ASC, byte_offset ASC, event_id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(IndexErrorRecord {
                event_id: row.get(0)?,
                idempotency_key: row.get(1)?,
                event_type: row.get(2)?,
                run_id: row.get(3)?,
                segment: row.get(4)?,
                offset: required_u64(row, 5)?,
                code: row.get(6)?,
                message: row.get(7)?,
            })
        })?;
        collect_rows(rows)
    }

    /// Pass history, newest first.
    pub fn passes(&self, limit: usize) -> Result<Vec<PassRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT pass_id, mode, started_at, finished_at, stats_json, watermark_json
             FROM index_passes
             ORDER BY rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            let mode_raw: String = row.get(1)?;
            let mode = PassMode::parse(&mode_raw).ok_or_else(|| {
                conversion_error(1, format!("invalid pass mode: {mode_raw}"))
            })?;
            let stats_raw: String = row.get(4)?;
            let watermark_raw: String = row.get(5)?;
            Ok(PassRecord {
                pass_id: row.get(0)?,
                mode,
                started_at: row.get(2)?,
                finished_at: row.get(3)?,
                stats: serde_json::from_str(&stats_raw)
                    .map_err(|err| conversion_error(4, err.to_string()))?,
                watermark: serde_json::from_str(&watermark_raw)
                    .map_err(|err| conversion_error(5, err.to_string()))?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn counts(&self) -> Result<DerivedCounts> {
        Ok(DerivedCounts {
            runs: self.count("SELECT COUNT(*) FROM runs")?,
            phases: self.count("SELECT COUNT(*) FROM phases")?,
            trials: self.count("SELECT COUNT(*) FROM trials")?,
            artifacts: self.count("SELECT COUNT(*) FROM artifacts")?,
            applied_events: self.count("SELECT COUNT(*) FROM applied_events")?,
            index_errors: self.count("SELECT COUNT(*) FROM index_errors")?,
            unresolved_run_references: self
                .count("SELECT COUNT(*) FROM index_errors WHERE code = 'unknown_run'")?,
            out_of_order_phases: self.count("SELECT COUNT(*) FROM phases WHERE out_of_order = 1")?,
        })
    }

    /// Dumps every derived table. Two stores built from the same log compare
    /// equal regardless of how indexing passes were batched. Pass history is
    /// not part of the snapshot.
    pub fn derived_snapshot(&self) -> Result<DerivedSnapshot> {
        let mut tables = BTreeMap::new();
        for (table, order_by) in DERIVED_TABLES {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT * FROM {table} ORDER BY {order_by}"))
                .with_context(|| format!("failed to snapshot {table}"))?;
            let column_count = stmt.column_count();
            let rows = stmt.query_map([], |row| {
                let mut values = Vec::with_capacity(column_count);
                for index in 0..column_count {
                    values.push(sql_value_to_json(row.get_ref(index)?));
                }
                Ok(values)
            })?;
            tables.insert(table.to_string(), collect_rows(rows)?);
        }
        Ok(DerivedSnapshot { tables })
    }

    pub fn index_status(
        &self,
        reader: &LogReader,
        watermark: &Watermark,
        lease: Option<LeaseRecord>,
    ) -> Result<IndexStatus> {
        let segments = reader
            .layout()
            .list_all_segments()
            .context("failed to list log segments")?;
        let segments_tracked = segments
            .iter()
            .filter(|segment| watermark.segments().any(|(tracked, _)| tracked == **segment))
            .count();
        let backlog = reader
            .backlog(watermark)
            .context("failed to measure index lag")?;
        let lease_expired = lease
            .as_ref()
            .is_some_and(|record| record.expires_at_ms <= runledger_core::now_epoch_ms());

        Ok(IndexStatus {
            contract_version: "index_status.v1".to_string(),
            last_partition_indexed: watermark
                .last_partition_indexed()
                .map(|partition| partition.to_string()),
            last_sequence_no: watermark.last_sequence_no(),
            last_offset_indexed: watermark.last_offset_indexed(),
            segments_total: segments.len(),
            segments_tracked,
            pending_bytes: backlog.pending_bytes,
            torn_tail_bytes: backlog.torn_tail_bytes,
            counts: self.counts()?,
            last_pass: self.passes(1)?.into_iter().next(),
            lease,
            lease_expired,
        })
    }

    pub fn index_check(
        &self,
        reader: &LogReader,
        watermark: &Watermark,
        lease: Option<LeaseRecord>,
    ) -> Result<IndexCheck> {
        let status = self.index_status(reader, watermark, lease)?;
        let mut issues = Vec::new();

        if status.pending_bytes > 0 {
            issues.push(IndexIssue {
                code: "index_lag".to_string(),
                severity: IndexIssueSeverity::Error,
                message: format!(
                    "index lag detected: {} bytes of log not yet indexed",
                    status.pending_bytes
                ),
            });
        }

        if status.torn_tail_bytes > 0 {
            issues.push(IndexIssue {
                code: "torn_tail".to_string(),
                severity: IndexIssueSeverity::Warning,
                message: format!(
                    "unterminated record fragments at segment tails: {} bytes",
                    status.torn_tail_bytes
                ),
            });
        }

        let unresolved = status.counts.unresolved_run_references;
        let other_errors = status.counts.index_errors.saturating_sub(unresolved);
        if other_errors > 0 {
            issues.push(IndexIssue {
                code: "per_event_errors".to_string(),
                severity: IndexIssueSeverity::Warning,
                message: format!("events rejected during indexing: {other_errors}"),
            });
        }

        if unresolved > 0 {
            issues.push(IndexIssue {
                code: "unresolved_run_references".to_string(),
                severity: IndexIssueSeverity::Warning,
                message: format!("events waiting for an unknown run: {unresolved}"),
            });
        }

        if status.counts.out_of_order_phases > 0 {
            issues.push(IndexIssue {
                code: "out_of_order_phases".to_string(),
                severity: IndexIssueSeverity::Warning,
                message: format!(
                    "phases completed without a recorded start: {}",
                    status.counts.out_of_order_phases
                ),
            });
        }

        if let Some(pass) = &status.last_pass {
            if pass.stats.corrupt_records > 0 {
                issues.push(IndexIssue {
                    code: "corrupt_records".to_string(),
                    severity: IndexIssueSeverity::Warning,
                    message: format!(
                        "last pass skipped corrupt records: {}",
                        pass.stats.corrupt_records
                    ),
                });
            }
        }

        if status.lease_expired {
            issues.push(IndexIssue {
                code: "stale_lease".to_string(),
                severity: IndexIssueSeverity::Warning,
                message: "an expired indexing lease was left behind".to_string(),
            });
        }

        let error_sample = self.index_errors(Some(ERROR_SAMPLE_LIMIT))?;
        let healthy = !issues
            .iter()
            .any(|item| item.severity == IndexIssueSeverity::Error);

        Ok(IndexCheck {
            contract_version: "index_check.v1".to_string(),
            healthy,
            status,
            issues,
            error_sample,
        })
    }

    pub(crate) fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin index transaction")
    }

    pub(crate) fn record_pass(&self, record: &PassRecord) -> Result<()> {
        let stats_json =
            serde_json::to_string(&record.stats).context("failed to encode pass stats")?;
        let watermark_json =
            serde_json::to_string(&record.watermark).context("failed to encode watermark")?;
        self.conn
            .execute(
                "INSERT INTO index_passes(pass_id, mode, started_at, finished_at, stats_json, watermark_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.pass_id,
                    record.mode.as_str(),
                    record.started_at,
                    record.finished_at,
                    stats_json,
                    watermark_json
                ],
            )
            .context("failed to record index pass")?;
        Ok(())
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let value: i64 = self
            .conn
            .query_row(sql, [], |row| row.get(0))
            .with_context(|| format!("failed to run count query: {sql}"))?;
        u64::try_from(value).map_err(|_| anyhow!("negative count from {sql}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let status_raw: String = row.get(4)?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| conversion_error(4, format!("invalid run status: {status_raw}")))?;
    let summary_raw: Option<String> = row.get(12)?;
    let summary = summary_raw
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|err| conversion_error(12, err.to_string()))?;

    Ok(RunRecord {
        run_id: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        config_hash: row.get(3)?,
        status,
        created_at_ms: row.get(5)?,
        started_at_ms: row.get(6)?,
        completed_at_ms: row.get(7)?,
        failed_at_ms: row.get(8)?,
        duration_ms: optional_u64(row, 9)?,
        error: row.get(10)?,
        failed_phase: row.get(11)?,
        summary,
    })
}

pub(crate) fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Integer,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn required_u64(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(column)?;
    u64::try_from(value).map_err(|_| conversion_error(column, format!("negative value: {value}")))
}

fn optional_u64(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<Option<u64>> {
    let value: Option<i64> = row.get(column)?;
    value
        .map(|raw| {
            u64::try_from(raw)
                .map_err(|_| conversion_error(column, format!("negative value: {raw}")))
        })
        .transpose()
}

fn optional_u32(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<Option<u32>> {
    let value: Option<i64> = row.get(column)?;
    value
        .map(|raw| {
            u32::try_from(raw)
                .map_err(|_| conversion_error(column, format!("invalid u32 value: {raw}")))
        })
        .transpose()
}

fn json_column(row: &rusqlite::Row<'_>, column: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|err| conversion_error(column, err.to_string()))
}

fn sql_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => {
            serde_json::Number::from_f64(number).map_or(Value::Null, Value::Number)
        }
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::from(bytes.to_vec()),
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteDerivedStore {
        let store = must(SqliteDerivedStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        match conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
            params![name],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(count) => count == 1,
            Err(err) => panic!("failed to query sqlite_master: {err}"),
        }
    }

    #[test]
    fn schema_contains_tables_and_views() {
        let store = fixture_store();
        for name in [
            "runs",
            "phases",
            "trials",
            "artifacts",
            "applied_events",
            "index_errors",
            "index_passes",
            "v_latest_runs",
            "v_phase_timings",
            "v_trial_results",
        ] {
            assert!(table_exists(store.connection(), name), "missing {name}");
        }
    }

    #[test]
    fn migration_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        let versions: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to count migrations: {err}"),
        };
        assert_eq!(versions, 1);
    }

    #[test]
    fn empty_store_snapshot_lists_every_derived_table() {
        let store = fixture_store();
        let snapshot = must(store.derived_snapshot());
        assert_eq!(snapshot.tables.len(), DERIVED_TABLES.len());
        assert!(snapshot.tables.values().all(Vec::is_empty));
        assert!(!snapshot.tables.contains_key("index_passes"));
    }

    #[test]
    fn run_status_names_round_trip() {
        for status in [
            RunStatus::Created,
            RunStatus::Started,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Started.is_terminal());
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let db_path = std::env::temp_dir().join(format!("runledger-ro-{}.sqlite3", ulid::Ulid::new()));
        let store = must(SqliteDerivedStore::open(&db_path));
        must(store.migrate());
        drop(store);

        let reader = must(SqliteDerivedStore::open_read_only(&db_path));
        assert!(reader.latest_runs(10).map(|runs| runs.is_empty()).unwrap_or(false));
        let write = reader
            .connection()
            .execute("DELETE FROM runs", []);
        assert!(write.is_err());

        let _ = std::fs::remove_file(&db_path);
    }
}
