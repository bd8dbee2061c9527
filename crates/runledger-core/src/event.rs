use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::watermark::LogPosition;
use crate::LedgerError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EventType {
    #[serde(rename = "run.created")]
    RunCreated,
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "phase.started")]
    PhaseStarted,
    #[serde(rename = "phase.completed")]
    PhaseCompleted,
    #[serde(rename = "trial.recorded")]
    TrialRecorded,
    #[serde(rename = "artifact.created")]
    ArtifactCreated,
}

impl EventType {
    pub const ALL: [Self; 8] = [
        Self::RunCreated,
        Self::RunStarted,
        Self::RunCompleted,
        Self::RunFailed,
        Self::PhaseStarted,
        Self::PhaseCompleted,
        Self::TrialRecorded,
        Self::ArtifactCreated,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunCreated => "run.created",
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::PhaseStarted => "phase.started",
            Self::PhaseCompleted => "phase.completed",
            Self::TrialRecorded => "trial.recorded",
            Self::ArtifactCreated => "artifact.created",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run.created" => Some(Self::RunCreated),
            "run.started" => Some(Self::RunStarted),
            "run.completed" => Some(Self::RunCompleted),
            "run.failed" => Some(Self::RunFailed),
            "phase.started" => Some(Self::PhaseStarted),
            "phase.completed" => Some(Self::PhaseCompleted),
            "trial.recorded" => Some(Self::TrialRecorded),
            "artifact.created" => Some(Self::ArtifactCreated),
            _ => None,
        }
    }

    /// Artifacts may be catalog-wide; every other event belongs to a run.
    #[must_use]
    pub fn requires_run_id(self) -> bool {
        !matches!(self, Self::ArtifactCreated)
    }

    /// Position in the expected per-run lifecycle. Events of lower rank are
    /// materialized first when a batch is reordered.
    #[must_use]
    pub fn lifecycle_rank(self) -> u8 {
        match self {
            Self::RunCreated => 0,
            Self::RunStarted => 1,
            Self::PhaseStarted => 2,
            Self::PhaseCompleted => 3,
            Self::TrialRecorded | Self::ArtifactCreated => 4,
            Self::RunCompleted | Self::RunFailed => 5,
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCreatedV1 {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
}

/// Adds the config fingerprint used to group optimizer sweeps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCreatedV2 {
    pub kind: String,
    pub config_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunStartedV1 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunCompletedV1 {
    pub summary: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunFailedV1 {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseStartedV1 {
    pub phase: String,
    pub ordinal: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseCompletedV1 {
    pub phase: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialRecordedV1 {
    pub trial_index: u64,
    pub params: Map<String, Value>,
    pub metrics: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactCreatedV1 {
    pub artifact_id: String,
    pub kind: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// Closed set of payload shapes, one variant per event type and schema
/// version.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    RunCreatedV1(RunCreatedV1),
    RunCreatedV2(RunCreatedV2),
    RunStartedV1(RunStartedV1),
    RunCompletedV1(RunCompletedV1),
    RunFailedV1(RunFailedV1),
    PhaseStartedV1(PhaseStartedV1),
    PhaseCompletedV1(PhaseCompletedV1),
    TrialRecordedV1(TrialRecordedV1),
    ArtifactCreatedV1(ArtifactCreatedV1),
}

impl EventPayload {
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunCreatedV1(_) | Self::RunCreatedV2(_) => EventType::RunCreated,
            Self::RunStartedV1(_) => EventType::RunStarted,
            Self::RunCompletedV1(_) => EventType::RunCompleted,
            Self::RunFailedV1(_) => EventType::RunFailed,
            Self::PhaseStartedV1(_) => EventType::PhaseStarted,
            Self::PhaseCompletedV1(_) => EventType::PhaseCompleted,
            Self::TrialRecordedV1(_) => EventType::TrialRecorded,
            Self::ArtifactCreatedV1(_) => EventType::ArtifactCreated,
        }
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        match self {
            Self::RunCreatedV2(_) => 2,
            _ => 1,
        }
    }

    /// Type-specific component of the idempotency key.
    #[must_use]
    pub fn discriminator(&self) -> String {
        match self {
            Self::PhaseStartedV1(payload) => payload.phase.clone(),
            Self::PhaseCompletedV1(payload) => payload.phase.clone(),
            Self::TrialRecordedV1(payload) => payload.trial_index.to_string(),
            Self::ArtifactCreatedV1(payload) => payload.artifact_id.clone(),
            Self::RunCreatedV1(_)
            | Self::RunCreatedV2(_)
            | Self::RunStartedV1(_)
            | Self::RunCompletedV1(_)
            | Self::RunFailedV1(_) => String::new(),
        }
    }

    /// Serializes the payload body as stored in the log.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the payload cannot be encoded.
    pub fn to_value(&self) -> Result<Value, LedgerError> {
        let encoded = match self {
            Self::RunCreatedV1(payload) => serde_json::to_value(payload),
            Self::RunCreatedV2(payload) => serde_json::to_value(payload),
            Self::RunStartedV1(payload) => serde_json::to_value(payload),
            Self::RunCompletedV1(payload) => serde_json::to_value(payload),
            Self::RunFailedV1(payload) => serde_json::to_value(payload),
            Self::PhaseStartedV1(payload) => serde_json::to_value(payload),
            Self::PhaseCompletedV1(payload) => serde_json::to_value(payload),
            Self::TrialRecordedV1(payload) => serde_json::to_value(payload),
            Self::ArtifactCreatedV1(payload) => serde_json::to_value(payload),
        };
        encoded.map_err(|err| {
            LedgerError::validation(self.event_type().as_str(), "payload", err.to_string())
        })
    }
}

#[must_use]
pub fn idempotency_key(run_id: Option<&str>, event_type: EventType, discriminator: &str) -> String {
    format!(
        "{}:{}:{}",
        run_id.unwrap_or("*"),
        event_type.as_str(),
        discriminator
    )
}

/// Producer-side event before it is assigned an id and written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at_ms: i64,
    pub run_id: Option<String>,
    pub payload: Value,
}

impl NewEvent {
    /// Builds an input from a typed payload.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the payload cannot be encoded.
    pub fn from_payload(
        run_id: Option<&str>,
        occurred_at_ms: i64,
        payload: &EventPayload,
    ) -> Result<Self, LedgerError> {
        Ok(Self {
            event_type: payload.event_type().as_str().to_string(),
            schema_version: payload.schema_version(),
            occurred_at_ms,
            run_id: run_id.map(str::to_string),
            payload: payload.to_value()?,
        })
    }
}

/// A validated, immutable fact as it appears in a log segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: Ulid,
    pub event_type: EventType,
    pub schema_version: u32,
    pub occurred_at_ms: i64,
    pub recorded_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub idempotency_key: String,
    pub payload: Value,
}

/// An event together with where it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEvent {
    pub position: LogPosition,
    pub event: Event,
}
