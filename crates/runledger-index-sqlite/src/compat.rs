//! Read routing between the derived index and a legacy run store during
//! migration. Nothing here writes to the legacy store.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::{collect_rows, conversion_error, RunRecord, RunStatus, SqliteDerivedStore};

/// Half-open interval `[from_ms, to_ms)` over run creation time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    pub from_ms: i64,
    pub to_ms: i64,
}

impl TimeRange {
    pub fn new(from_ms: i64, to_ms: i64) -> Result<Self> {
        if from_ms > to_ms {
            bail!("invalid time range: from {from_ms} is after to {to_ms}");
        }
        Ok(Self { from_ms, to_ms })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.from_ms >= self.to_ms
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReadStrategy {
    DerivedOnly,
    LegacyOnly,
    Split { legacy: TimeRange, derived: TimeRange },
}

/// Data created before `cutover_ms` lives in the legacy store; everything at
/// or after it is served by the derived index.
#[must_use]
pub fn select_strategy(range: TimeRange, cutover_ms: Option<i64>) -> ReadStrategy {
    let Some(cutover_ms) = cutover_ms else {
        return ReadStrategy::DerivedOnly;
    };
    if range.from_ms >= cutover_ms {
        ReadStrategy::DerivedOnly
    } else if range.to_ms <= cutover_ms {
        ReadStrategy::LegacyOnly
    } else {
        ReadStrategy::Split {
            legacy: TimeRange {
                from_ms: range.from_ms,
                to_ms: cutover_ms,
            },
            derived: TimeRange {
                from_ms: cutover_ms,
                to_ms: range.to_ms,
            },
        }
    }
}

/// Run queries shared by every store a read may be routed to.
pub trait RunReadPort {
    /// Runs created inside `range`, oldest first.
    fn runs_in_range(&self, range: TimeRange) -> Result<Vec<RunRecord>>;
    fn run(&self, run_id: &str) -> Result<Option<RunRecord>>;
}

impl RunReadPort for SqliteDerivedStore {
    fn runs_in_range(&self, range: TimeRange) -> Result<Vec<RunRecord>> {
        self.runs_created_between(range.from_ms, range.to_ms)
    }

    fn run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        SqliteDerivedStore::run(self, run_id)
    }
}

/// Pre-migration run table, opened read-only.
pub struct LegacyRunStore {
    conn: Connection,
}

const LEGACY_COLUMNS: &str = "run_id, kind, status, created_at_ms, completed_at_ms";

impl LegacyRunStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open legacy store at {}", path.display()))?;
        Ok(Self { conn })
    }
}

fn parse_legacy_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let status_raw: String = row.get(2)?;
    let status = RunStatus::parse(&status_raw)
        .ok_or_else(|| conversion_error(2, format!("invalid legacy status: {status_raw}")))?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        kind: row.get(1)?,
        name: None,
        config_hash: None,
        status,
        created_at_ms: row.get(3)?,
        started_at_ms: None,
        completed_at_ms: row.get(4)?,
        failed_at_ms: None,
        duration_ms: None,
        error: None,
        failed_phase: None,
        summary: None,
    })
}

impl RunReadPort for LegacyRunStore {
    fn runs_in_range(&self, range: TimeRange) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LEGACY_COLUMNS} FROM legacy_runs
             WHERE created_at_ms >= ?1 AND created_at_ms < ?2
             ORDER BY created_at_ms ASC, run_id ASC"
        ))?;
        let rows = stmt.query_map(params![range.from_ms, range.to_ms], parse_legacy_row)?;
        collect_rows(rows)
    }

    fn run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        self.conn
            .query_row(
                &format!("SELECT {LEGACY_COLUMNS} FROM legacy_runs WHERE run_id = ?1"),
                params![run_id],
                parse_legacy_row,
            )
            .optional()
            .with_context(|| format!("failed to load legacy run {run_id}"))
    }
}

/// Single read port that dispatches by [`select_strategy`].
pub struct CutoverRouter<L, D> {
    legacy: L,
    derived: D,
    cutover_ms: Option<i64>,
}

impl<L: RunReadPort, D: RunReadPort> CutoverRouter<L, D> {
    pub fn new(legacy: L, derived: D, cutover_ms: Option<i64>) -> Self {
        Self {
            legacy,
            derived,
            cutover_ms,
        }
    }

    #[must_use]
    pub fn strategy(&self, range: TimeRange) -> ReadStrategy {
        select_strategy(range, self.cutover_ms)
    }
}

impl<L: RunReadPort, D: RunReadPort> RunReadPort for CutoverRouter<L, D> {
    fn runs_in_range(&self, range: TimeRange) -> Result<Vec<RunRecord>> {
        match self.strategy(range) {
            ReadStrategy::DerivedOnly => self.derived.runs_in_range(range),
            ReadStrategy::LegacyOnly => self.legacy.runs_in_range(range),
            ReadStrategy::Split { legacy, derived } => {
                let mut runs = self.legacy.runs_in_range(legacy)?;
                runs.extend(self.derived.runs_in_range(derived)?);
                Ok(runs)
            }
        }
    }

    /// The derived index answers first; legacy only fills gaps.
    fn run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        if let Some(run) = self.derived.run(run_id)? {
            return Ok(Some(run));
        }
        if self.cutover_ms.is_none() {
            return Ok(None);
        }
        self.legacy.run(run_id)
    }
}
