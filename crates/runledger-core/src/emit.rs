//! Producer-facing helpers over [`EventWriter`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::{
    now_epoch_ms, AppendReceipt, ArtifactCreatedV1, Deadline, EventPayload, EventType,
    EventWriter, LedgerError, NewEvent, PhaseCompletedV1, PhaseStartedV1, RunCompletedV1,
    RunCreatedV2, RunFailedV1, RunStartedV1, TrialRecordedV1,
};

/// Stamps events with the current time and appends them through a shared
/// writer. Each call is bounded by the configured append timeout.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    writer: Arc<EventWriter>,
    append_timeout: Option<Duration>,
}

impl EventEmitter {
    #[must_use]
    pub fn new(writer: Arc<EventWriter>) -> Self {
        Self {
            writer,
            append_timeout: None,
        }
    }

    #[must_use]
    pub fn with_append_timeout(mut self, timeout: Duration) -> Self {
        self.append_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn writer(&self) -> &EventWriter {
        &self.writer
    }

    /// Emits an untyped payload at the latest registered version of
    /// `event_type`.
    ///
    /// # Errors
    /// Propagates validation and durability errors from
    /// [`EventWriter::append`].
    pub fn emit(
        &self,
        event_type: EventType,
        run_id: Option<&str>,
        payload: Value,
    ) -> Result<AppendReceipt, LedgerError> {
        let schema_version = self
            .writer
            .registry()
            .latest_version(event_type)
            .ok_or_else(|| LedgerError::UnknownSchemaVersion {
                event_type: event_type.as_str().to_string(),
                version: 0,
            })?;
        self.append(&NewEvent {
            event_type: event_type.as_str().to_string(),
            schema_version,
            occurred_at_ms: now_epoch_ms(),
            run_id: run_id.map(str::to_string),
            payload,
        })
    }

    /// Emits a typed payload at its own schema version.
    ///
    /// # Errors
    /// Propagates validation and durability errors from
    /// [`EventWriter::append`].
    pub fn emit_payload(
        &self,
        run_id: Option<&str>,
        payload: &EventPayload,
    ) -> Result<AppendReceipt, LedgerError> {
        self.append(&NewEvent::from_payload(run_id, now_epoch_ms(), payload)?)
    }

    /// # Errors
    /// See [`EventEmitter::emit_payload`].
    pub fn run_created(
        &self,
        run_id: &str,
        payload: RunCreatedV2,
    ) -> Result<AppendReceipt, LedgerError> {
        self.emit_payload(Some(run_id), &EventPayload::RunCreatedV2(payload))
    }

    /// # Errors
    /// See [`EventEmitter::emit_payload`].
    pub fn run_started(
        &self,
        run_id: &str,
        payload: RunStartedV1,
    ) -> Result<AppendReceipt, LedgerError> {
        self.emit_payload(Some(run_id), &EventPayload::RunStartedV1(payload))
    }

    /// # Errors
    /// See [`EventEmitter::emit_payload`].
    pub fn run_completed(
        &self,
        run_id: &str,
        payload: RunCompletedV1,
    ) -> Result<AppendReceipt, LedgerError> {
        self.emit_payload(Some(run_id), &EventPayload::RunCompletedV1(payload))
    }

    /// # Errors
    /// See [`EventEmitter::emit_payload`].
    pub fn run_failed(
        &self,
        run_id: &str,
        error: &str,
        phase: Option<&str>,
    ) -> Result<AppendReceipt, LedgerError> {
        self.emit_payload(
            Some(run_id),
            &EventPayload::RunFailedV1(RunFailedV1 {
                error: error.to_string(),
                phase: phase.map(str::to_string),
            }),
        )
    }

    /// # Errors
    /// See [`EventEmitter::emit_payload`].
    pub fn phase_started(
        &self,
        run_id: &str,
        phase: &str,
        ordinal: u32,
    ) -> Result<AppendReceipt, LedgerError> {
        self.emit_payload(
            Some(run_id),
            &EventPayload::PhaseStartedV1(PhaseStartedV1 {
                phase: phase.to_string(),
                ordinal,
            }),
        )
    }

    /// # Errors
    /// See [`EventEmitter::emit_payload`].
    pub fn phase_completed(
        &self,
        run_id: &str,
        phase: &str,
        duration_ms: u64,
    ) -> Result<AppendReceipt, LedgerError> {
        self.emit_payload(
            Some(run_id),
            &EventPayload::PhaseCompletedV1(PhaseCompletedV1 {
                phase: phase.to_string(),
                duration_ms,
                status: None,
            }),
        )
    }

    /// # Errors
    /// See [`EventEmitter::emit_payload`].
    pub fn trial_recorded(
        &self,
        run_id: &str,
        payload: TrialRecordedV1,
    ) -> Result<AppendReceipt, LedgerError> {
        self.emit_payload(Some(run_id), &EventPayload::TrialRecordedV1(payload))
    }

    /// Artifacts may be ingested without an owning run.
    ///
    /// # Errors
    /// See [`EventEmitter::emit_payload`].
    pub fn artifact_created(
        &self,
        run_id: Option<&str>,
        payload: ArtifactCreatedV1,
    ) -> Result<AppendReceipt, LedgerError> {
        self.emit_payload(run_id, &EventPayload::ArtifactCreatedV1(payload))
    }

    fn append(&self, input: &NewEvent) -> Result<AppendReceipt, LedgerError> {
        let deadline = self.append_timeout.map_or_else(Deadline::none, Deadline::after);
        self.writer.append(input, deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogLayout, LogReader, SchemaRegistry, Watermark};
    use serde_json::{json, Map};
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn emitter(label: &str) -> (std::path::PathBuf, EventEmitter) {
        let root = std::env::temp_dir().join(format!("runledger-emit-{label}-{}", Ulid::new()));
        let writer = must(EventWriter::open(
            LogLayout::new(&root),
            SchemaRegistry::builtin(),
            1024 * 1024,
        ));
        (root, EventEmitter::new(Arc::new(writer)).with_append_timeout(Duration::from_secs(5)))
    }

    #[test]
    fn typed_wrappers_write_registered_versions() {
        let (root, emitter) = emitter("typed");

        must(emitter.run_created(
            "R1",
            RunCreatedV2 {
                kind: "backtest".to_string(),
                config_hash: "sha256:abc".to_string(),
                name: None,
                config: None,
            },
        ));
        must(emitter.run_started("R1", RunStartedV1::default()));
        must(emitter.phase_started("R1", "plan", 0));
        must(emitter.phase_completed("R1", "plan", 850));
        must(emitter.trial_recorded(
            "R1",
            TrialRecordedV1 {
                trial_index: 0,
                params: Map::new(),
                metrics: Map::new(),
                score: Some(0.7),
            },
        ));
        must(emitter.artifact_created(
            None,
            ArtifactCreatedV1 {
                artifact_id: "alert-9".to_string(),
                kind: "alert".to_string(),
                uri: "file:///alerts/9.json".to_string(),
                bytes: None,
            },
        ));
        must(emitter.run_failed("R1", "optimizer diverged", Some("fit")));

        let reader = LogReader::new(LogLayout::new(&root));
        let events: Vec<_> = must(reader.read_from(&Watermark::origin()))
            .map(|item| must(item).event)
            .collect();
        let summary: Vec<(EventType, u32)> = events
            .iter()
            .map(|event| (event.event_type, event.schema_version))
            .collect();
        assert_eq!(
            summary,
            vec![
                (EventType::RunCreated, 2),
                (EventType::RunStarted, 1),
                (EventType::PhaseStarted, 1),
                (EventType::PhaseCompleted, 1),
                (EventType::TrialRecorded, 1),
                (EventType::ArtifactCreated, 1),
                (EventType::RunFailed, 1),
            ]
        );
        assert_eq!(events[5].run_id, None);

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn untyped_emit_uses_latest_version() {
        let (root, emitter) = emitter("untyped");

        let missing_hash = emitter.emit(
            EventType::RunCreated,
            Some("R1"),
            json!({ "kind": "backtest" }),
        );
        match missing_hash {
            Err(LedgerError::Validation { field, .. }) => assert_eq!(field, "config_hash"),
            other => panic!("expected validation error, got {other:?}"),
        }

        let receipt = must(emitter.emit(
            EventType::RunCreated,
            Some("R1"),
            json!({ "kind": "backtest", "config_hash": "sha256:abc" }),
        ));
        assert_eq!(receipt.idempotency_key, "R1:run.created:");

        let _ = std::fs::remove_dir_all(root);
    }
}
