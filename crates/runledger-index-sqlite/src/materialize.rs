//! Per-event materialization rules.
//!
//! Every rule writes only columns fully determined by its own event, and run
//! status is merged by lifecycle rank with an `(occurred_at_ms, event_id)`
//! tie-break, so the final derived state does not depend on how events were
//! batched across passes.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Transaction};
use runledger_core::{Event, EventPayload, EventType, LedgerError, SchemaRegistry};
use serde::Serialize;
use serde_json::{Map, Value};

pub(crate) const UNKNOWN_RUN: &str = "unknown_run";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Applied { superseded: bool, out_of_order: bool },
    Skipped,
    Duplicate,
    Rejected { code: &'static str, message: String },
}

enum ApplyError {
    Rejected { code: &'static str, message: String },
    Store(rusqlite::Error),
}

impl From<rusqlite::Error> for ApplyError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(value)
    }
}

fn rejected(code: &'static str, message: impl Into<String>) -> ApplyError {
    ApplyError::Rejected {
        code,
        message: message.into(),
    }
}

pub(crate) fn truncate(tx: &Transaction<'_>) -> Result<()> {
    tx.execute_batch(
        "DELETE FROM runs;
         DELETE FROM phases;
         DELETE FROM trials;
         DELETE FROM artifacts;
         DELETE FROM applied_events;
         DELETE FROM index_errors;",
    )
    .context("failed to truncate derived tables")
}

/// Applies one event behind the idempotency gate.
///
/// The first event for an idempotency key wins unless a later one carries a
/// smaller `(occurred_at_ms, event_id)`, in which case it supersedes the
/// earlier application. Rule failures roll back to a savepoint and are
/// recorded in `index_errors`; store failures abort the caller's
/// transaction.
pub(crate) fn apply_event(
    tx: &Transaction<'_>,
    registry: &SchemaRegistry,
    event: &Event,
    segment: &str,
    offset: u64,
) -> Result<Outcome> {
    let event_id = event.event_id.to_string();
    let applied: Option<(String, i64)> = tx
        .query_row(
            "SELECT event_id, occurred_at_ms FROM applied_events WHERE idempotency_key = ?1",
            params![event.idempotency_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("failed to read idempotency ledger")?;

    let superseded = match applied {
        Some((applied_id, _)) if applied_id == event_id => return Ok(Outcome::Skipped),
        Some((applied_id, applied_at_ms)) => {
            if (event.occurred_at_ms, event_id.as_str()) < (applied_at_ms, applied_id.as_str()) {
                true
            } else {
                return Ok(Outcome::Duplicate);
            }
        }
        None => false,
    };

    tx.execute_batch("SAVEPOINT apply_event")
        .context("failed to open event savepoint")?;

    match apply_rules(tx, registry, event) {
        Ok(out_of_order) => {
            tx.execute(
                "INSERT INTO applied_events(idempotency_key, event_id, event_type, occurred_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(idempotency_key) DO UPDATE SET
                   event_id = excluded.event_id,
                   event_type = excluded.event_type,
                   occurred_at_ms = excluded.occurred_at_ms",
                params![
                    event.idempotency_key,
                    event_id,
                    event.event_type.as_str(),
                    event.occurred_at_ms
                ],
            )
            .context("failed to record applied event")?;
            tx.execute(
                "DELETE FROM index_errors WHERE event_id = ?1",
                params![event_id],
            )
            .context("failed to clear resolved index error")?;
            tx.execute_batch("RELEASE SAVEPOINT apply_event")
                .context("failed to release event savepoint")?;
            Ok(Outcome::Applied {
                superseded,
                out_of_order,
            })
        }
        Err(ApplyError::Rejected { code, message }) => {
            tx.execute_batch(
                "ROLLBACK TO SAVEPOINT apply_event;
                 RELEASE SAVEPOINT apply_event;",
            )
            .context("failed to roll back event savepoint")?;
            record_error(tx, event, segment, offset, code, &message)?;
            Ok(Outcome::Rejected { code, message })
        }
        Err(ApplyError::Store(err)) => Err(anyhow::Error::new(err).context(format!(
            "failed to materialize {} {}",
            event.event_type, event.event_id
        ))),
    }
}

/// Retries events parked as `unknown_run` whose run now exists. Returns the
/// outcomes of the events that left the error table.
pub(crate) fn resolve_pending(
    tx: &Transaction<'_>,
    registry: &SchemaRegistry,
) -> Result<Vec<(Event, Outcome)>> {
    let mut stmt = tx
        .prepare(
            "SELECT event_json, segment, byte_offset
             FROM index_errors
             WHERE code = ?1 AND run_id IN (SELECT run_id FROM runs)
             ORDER BY segment ASC, byte_offset ASC, event_id ASC",
        )
        .context("failed to query pending index errors")?;
    let rows = stmt
        .query_map(params![UNKNOWN_RUN], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .context("failed to query pending index errors")?;

    let mut pending = Vec::new();
    for row in rows {
        let (event_json, segment, offset) = row?;
        let event: Event = serde_json::from_str(&event_json)
            .context("failed to decode parked event from index_errors")?;
        let offset = u64::try_from(offset).context("negative byte offset in index_errors")?;
        pending.push((event, segment, offset));
    }
    drop(stmt);

    pending.sort_by_key(|(event, _, _)| event.event_type.lifecycle_rank());

    let mut resolved = Vec::new();
    for (event, segment, offset) in pending {
        let outcome = apply_event(tx, registry, &event, &segment, offset)?;
        if matches!(outcome, Outcome::Rejected { .. }) {
            continue;
        }
        tx.execute(
            "DELETE FROM index_errors WHERE event_id = ?1",
            params![event.event_id.to_string()],
        )
        .context("failed to clear resolved index error")?;
        resolved.push((event, outcome));
    }
    Ok(resolved)
}

fn record_error(
    tx: &Transaction<'_>,
    event: &Event,
    segment: &str,
    offset: u64,
    code: &str,
    message: &str,
) -> Result<()> {
    let event_json = serde_json::to_string(event).context("failed to encode rejected event")?;
    let offset = i64::try_from(offset).context("byte offset exceeds sqlite integer range")?;
    tx.execute(
        "INSERT INTO index_errors(event_id, idempotency_key, event_type, run_id, segment, byte_offset, code, message, event_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(event_id) DO UPDATE SET
           code = excluded.code,
           message = excluded.message,
           segment = excluded.segment,
           byte_offset = excluded.byte_offset,
           event_json = excluded.event_json",
        params![
            event.event_id.to_string(),
            event.idempotency_key,
            event.event_type.as_str(),
            event.run_id,
            segment,
            offset,
            code,
            message,
            event_json
        ],
    )
    .context("failed to record index error")?;
    Ok(())
}

/// Returns whether the event left its phase flagged out of order.
fn apply_rules(
    tx: &Transaction<'_>,
    registry: &SchemaRegistry,
    event: &Event,
) -> std::result::Result<bool, ApplyError> {
    let payload = registry
        .decode(event.event_type, event.schema_version, &event.payload)
        .map_err(|err| match err {
            LedgerError::UnknownSchemaVersion { .. } => {
                rejected("unknown_schema_version", err.to_string())
            }
            other => rejected("invalid_payload", other.to_string()),
        })?;

    if let EventPayload::ArtifactCreatedV1(artifact) = &payload {
        if let Some(run_id) = event.run_id.as_deref() {
            require_run(tx, run_id)?;
        }
        tx.execute(
            "INSERT INTO artifacts(idempotency_key, artifact_id, run_id, kind, uri, bytes, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(idempotency_key) DO UPDATE SET
               artifact_id = excluded.artifact_id,
               run_id = excluded.run_id,
               kind = excluded.kind,
               uri = excluded.uri,
               bytes = excluded.bytes,
               created_at_ms = excluded.created_at_ms",
            params![
                event.idempotency_key,
                artifact.artifact_id,
                event.run_id,
                artifact.kind,
                artifact.uri,
                artifact.bytes.map(|bytes| sql_int(bytes, "bytes")).transpose()?,
                event.occurred_at_ms
            ],
        )?;
        return Ok(false);
    }

    let Some(run_id) = event.run_id.as_deref() else {
        return Err(rejected("missing_run_id", "event carries no run_id"));
    };

    match &payload {
        EventPayload::RunCreatedV1(created) => {
            upsert_run(
                tx,
                event,
                run_id,
                &RunCreation {
                    kind: &created.kind,
                    name: created.name.as_deref(),
                    config_hash: None,
                    config: created.config.as_ref(),
                },
            )?;
            Ok(false)
        }
        EventPayload::RunCreatedV2(created) => {
            upsert_run(
                tx,
                event,
                run_id,
                &RunCreation {
                    kind: &created.kind,
                    name: created.name.as_deref(),
                    config_hash: Some(&created.config_hash),
                    config: created.config.as_ref(),
                },
            )?;
            Ok(false)
        }
        EventPayload::RunStartedV1(started) => {
            require_run(tx, run_id)?;
            tx.execute(
                "UPDATE runs SET started_at_ms = ?2, host = ?3, pid = ?4 WHERE run_id = ?1",
                params![run_id, event.occurred_at_ms, started.host, started.pid],
            )?;
            merge_status(tx, run_id, event)?;
            Ok(false)
        }
        EventPayload::RunCompletedV1(completed) => {
            require_run(tx, run_id)?;
            tx.execute(
                "UPDATE runs SET completed_at_ms = ?2, duration_ms = ?3, summary_json = ?4
                 WHERE run_id = ?1",
                params![
                    run_id,
                    event.occurred_at_ms,
                    completed
                        .duration_ms
                        .map(|value| sql_int(value, "duration_ms"))
                        .transpose()?,
                    to_json(&completed.summary)?
                ],
            )?;
            merge_status(tx, run_id, event)?;
            Ok(false)
        }
        EventPayload::RunFailedV1(failed) => {
            require_run(tx, run_id)?;
            tx.execute(
                "UPDATE runs SET failed_at_ms = ?2, error = ?3, failed_phase = ?4 WHERE run_id = ?1",
                params![run_id, event.occurred_at_ms, failed.error, failed.phase],
            )?;
            merge_status(tx, run_id, event)?;
            Ok(false)
        }
        EventPayload::PhaseStartedV1(started) => {
            require_run(tx, run_id)?;
            tx.execute(
                "INSERT INTO phases(run_id, phase, ordinal, started_at_ms, out_of_order)
                 VALUES (?1, ?2, ?3, ?4, 0)
                 ON CONFLICT(run_id, phase) DO UPDATE SET
                   ordinal = excluded.ordinal,
                   started_at_ms = excluded.started_at_ms,
                   out_of_order = 0",
                params![run_id, started.phase, started.ordinal, event.occurred_at_ms],
            )?;
            Ok(false)
        }
        EventPayload::PhaseCompletedV1(completed) => {
            require_run(tx, run_id)?;
            tx.execute(
                "INSERT INTO phases(run_id, phase, completed_at_ms, duration_ms, status, out_of_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(run_id, phase) DO UPDATE SET
                   completed_at_ms = excluded.completed_at_ms,
                   duration_ms = excluded.duration_ms,
                   status = excluded.status,
                   out_of_order = CASE WHEN phases.started_at_ms IS NULL THEN 1 ELSE 0 END",
                params![
                    run_id,
                    completed.phase,
                    event.occurred_at_ms,
                    sql_int(completed.duration_ms, "duration_ms")?,
                    completed.status
                ],
            )?;
            let flagged: i64 = tx.query_row(
                "SELECT out_of_order FROM phases WHERE run_id = ?1 AND phase = ?2",
                params![run_id, completed.phase],
                |row| row.get(0),
            )?;
            Ok(flagged != 0)
        }
        EventPayload::TrialRecordedV1(trial) => {
            require_run(tx, run_id)?;
            tx.execute(
                "INSERT INTO trials(run_id, trial_index, params_json, metrics_json, score, occurred_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id, trial_index) DO UPDATE SET
                   params_json = excluded.params_json,
                   metrics_json = excluded.metrics_json,
                   score = excluded.score,
                   occurred_at_ms = excluded.occurred_at_ms",
                params![
                    run_id,
                    sql_int(trial.trial_index, "trial_index")?,
                    to_json(&trial.params)?,
                    to_json(&trial.metrics)?,
                    trial.score,
                    event.occurred_at_ms
                ],
            )?;
            Ok(false)
        }
        EventPayload::ArtifactCreatedV1(_) => Ok(false),
    }
}

struct RunCreation<'a> {
    kind: &'a str,
    name: Option<&'a str>,
    config_hash: Option<&'a str>,
    config: Option<&'a Map<String, Value>>,
}

fn upsert_run(
    tx: &Transaction<'_>,
    event: &Event,
    run_id: &str,
    creation: &RunCreation<'_>,
) -> std::result::Result<(), ApplyError> {
    let config_json = creation.config.map(to_json).transpose()?;
    tx.execute(
        "INSERT INTO runs(run_id, kind, name, config_hash, config_json, schema_version, status,
                          status_rank, status_occurred_at_ms, status_event_id, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'created', ?7, ?8, ?9, ?8)
         ON CONFLICT(run_id) DO UPDATE SET
           kind = excluded.kind,
           name = excluded.name,
           config_hash = excluded.config_hash,
           config_json = excluded.config_json,
           schema_version = excluded.schema_version,
           created_at_ms = excluded.created_at_ms",
        params![
            run_id,
            creation.kind,
            creation.name,
            creation.config_hash,
            config_json,
            event.schema_version,
            EventType::RunCreated.lifecycle_rank(),
            event.occurred_at_ms,
            event.event_id.to_string()
        ],
    )?;
    merge_status(tx, run_id, event)
}

/// Higher lifecycle rank wins; equal ranks keep the earliest
/// `(occurred_at_ms, event_id)`.
fn merge_status(
    tx: &Transaction<'_>,
    run_id: &str,
    event: &Event,
) -> std::result::Result<(), ApplyError> {
    let status = match event.event_type {
        EventType::RunCreated => "created",
        EventType::RunStarted => "started",
        EventType::RunCompleted => "completed",
        EventType::RunFailed => "failed",
        _ => return Ok(()),
    };
    tx.execute(
        "UPDATE runs SET
           status = ?2,
           status_rank = ?3,
           status_occurred_at_ms = ?4,
           status_event_id = ?5
         WHERE run_id = ?1
           AND (status_rank < ?3
                OR (status_rank = ?3
                    AND (status_occurred_at_ms > ?4
                         OR (status_occurred_at_ms = ?4 AND status_event_id > ?5))))",
        params![
            run_id,
            status,
            event.event_type.lifecycle_rank(),
            event.occurred_at_ms,
            event.event_id.to_string()
        ],
    )?;
    Ok(())
}

fn require_run(tx: &Transaction<'_>, run_id: &str) -> std::result::Result<(), ApplyError> {
    let exists = tx
        .query_row(
            "SELECT 1 FROM runs WHERE run_id = ?1",
            params![run_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if exists {
        Ok(())
    } else {
        Err(rejected(
            UNKNOWN_RUN,
            format!("run {run_id} has no run.created event"),
        ))
    }
}

fn sql_int(value: u64, field: &str) -> std::result::Result<i64, ApplyError> {
    i64::try_from(value)
        .map_err(|_| rejected("value_out_of_range", format!("{field}={value} exceeds i64")))
}

fn to_json<T: Serialize>(value: &T) -> std::result::Result<String, ApplyError> {
    serde_json::to_string(value).map_err(|err| rejected("invalid_payload", err.to_string()))
}
