//! Append-only run event log: schema registry, segment writer, log reader and
//! watermark types shared by producers and the indexer.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

pub mod emit;
pub mod event;
pub mod reader;
pub mod schema;
pub mod segment;
pub mod watermark;
pub mod writer;

pub use emit::EventEmitter;
pub use event::{
    ArtifactCreatedV1, Event, EventPayload, EventType, LoggedEvent, NewEvent, PhaseCompletedV1,
    PhaseStartedV1, RunCompletedV1, RunCreatedV1, RunCreatedV2, RunFailedV1, RunStartedV1,
    TrialRecordedV1,
};
pub use reader::{LogBacklog, LogReader, LogScan, ScanStats};
pub use schema::{FieldKind, FieldSpec, SchemaCatalog, SchemaRegistry};
pub use segment::{LogLayout, PartitionKey, SegmentId};
pub use watermark::{LogPosition, Watermark};
pub use writer::{AppendReceipt, EventWriter};

pub const DEFAULT_ROTATION_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_LEASE_TTL_MS: u64 = 60_000;
pub const DEFAULT_DAEMON_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error for {event_type} field `{field}`: {message}")]
    Validation {
        event_type: String,
        field: String,
        message: String,
    },
    #[error("unknown schema version {version} for {event_type}")]
    UnknownSchemaVersion { event_type: String, version: u32 },
    #[error("durability error: {0}")]
    Durability(String),
    #[error("indexing lease held by {holder} until {expires_at_ms}")]
    LeaseConflict { holder: String, expires_at_ms: i64 },
    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(String),
    #[error("corrupt log data: {0}")]
    Corrupt(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("io error: {0}")]
    Io(String),
}

impl LedgerError {
    pub(crate) fn validation(
        event_type: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            event_type: event_type.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    pub(crate) fn io(context: &str, err: &std::io::Error) -> Self {
        Self::Io(format!("{context}: {err}"))
    }
}

/// Caller-supplied bound on a blocking operation. Expiry aborts before any
/// effect becomes visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    #[must_use]
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    #[must_use]
    pub fn from_timeout_ms(timeout_ms: Option<u64>) -> Self {
        timeout_ms.map_or_else(Self::none, |ms| Self::after(Duration::from_millis(ms)))
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|instant| Instant::now() >= instant)
    }

    /// Fails with [`LedgerError::DeadlineExceeded`] once the deadline passed.
    ///
    /// # Errors
    /// Returns [`LedgerError::DeadlineExceeded`] naming `operation`.
    pub fn check(&self, operation: &str) -> Result<(), LedgerError> {
        if self.is_expired() {
            return Err(LedgerError::DeadlineExceeded(operation.to_string()));
        }
        Ok(())
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub rotation_threshold_bytes: u64,
    pub lease_ttl_ms: u64,
    pub daemon_interval_secs: u64,
    pub pass_timeout_ms: Option<u64>,
    pub legacy_cutover_ms: Option<i64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rotation_threshold_bytes: DEFAULT_ROTATION_THRESHOLD_BYTES,
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            daemon_interval_secs: DEFAULT_DAEMON_INTERVAL_SECS,
            pass_timeout_ms: None,
            legacy_cutover_ms: None,
        }
    }
}

impl LedgerConfig {
    /// Validates numeric bounds.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.rotation_threshold_bytes == 0 {
            return Err(LedgerError::Configuration(
                "rotation_threshold_bytes MUST be >= 1".to_string(),
            ));
        }
        if self.lease_ttl_ms < 1_000 {
            return Err(LedgerError::Configuration(
                "lease_ttl_ms MUST be >= 1000".to_string(),
            ));
        }
        if self.daemon_interval_secs == 0 {
            return Err(LedgerError::Configuration(
                "daemon_interval_secs MUST be >= 1".to_string(),
            ));
        }
        if self.pass_timeout_ms == Some(0) {
            return Err(LedgerError::Configuration(
                "pass_timeout_ms MUST be >= 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes and validates a configuration document. Missing fields take
    /// their defaults.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, LedgerError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LedgerError::Configuration(format!("invalid configuration JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Configuration`] when parsing fails or the offset is
/// not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Configuration(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Configuration(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Configuration`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LedgerError::Configuration(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn to_epoch_ms(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000_000) as i64
}

#[must_use]
pub fn now_epoch_ms() -> i64 {
    to_epoch_ms(now_utc())
}

/// Converts milliseconds since epoch into a UTC timestamp.
///
/// # Errors
/// Returns [`LedgerError::Configuration`] when the value is outside the
/// representable calendar range.
pub fn from_epoch_ms(value: i64) -> Result<OffsetDateTime, LedgerError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000_000)
        .map_err(|err| LedgerError::Configuration(format!("timestamp {value}ms out of range: {err}")))
}
