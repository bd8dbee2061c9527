use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventPayload;
use crate::segment::write_file_atomic;
use crate::{EventType, LedgerError};

pub const SCHEMA_CATALOG_VERSION: &str = "schema_registry.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Unsigned,
    /// Unsigned and no larger than `u32::MAX`.
    #[serde(rename = "u32")]
    U32,
    Integer,
    Number,
    Bool,
    Object,
}

impl FieldKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Unsigned => "unsigned",
            Self::U32 => "u32",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Object => "object",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Unsigned => value.is_u64(),
            Self::U32 => value.as_u64().is_some_and(|raw| u32::try_from(raw).is_ok()),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    #[must_use]
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    #[must_use]
    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

pub type PayloadDecoder = fn(Value) -> Result<EventPayload, serde_json::Error>;

#[derive(Debug, Clone)]
struct SchemaEntry {
    fields: Vec<FieldSpec>,
    decoder: PayloadDecoder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaCatalogEntry {
    pub event_type: EventType,
    pub schema_version: u32,
    pub fields: Vec<FieldSpec>,
}

/// On-disk enumeration of every known `(event_type, schema_version)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaCatalog {
    pub catalog_version: String,
    pub schemas: Vec<SchemaCatalogEntry>,
}

/// Maps `(event_type, schema_version)` to the fields it declares and the
/// decoder producing its typed payload. Versions are only ever added.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entries: BTreeMap<(EventType, u32), SchemaEntry>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in run lifecycle schema, all versions.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let builtins: [(EventType, u32, Vec<FieldSpec>, PayloadDecoder); 9] = [
            (
                EventType::RunCreated,
                1,
                vec![
                    FieldSpec::required("kind", FieldKind::String),
                    FieldSpec::optional("name", FieldKind::String),
                    FieldSpec::optional("config", FieldKind::Object),
                ],
                |value| serde_json::from_value(value).map(EventPayload::RunCreatedV1),
            ),
            (
                EventType::RunCreated,
                2,
                vec![
                    FieldSpec::required("kind", FieldKind::String),
                    FieldSpec::required("config_hash", FieldKind::String),
                    FieldSpec::optional("name", FieldKind::String),
                    FieldSpec::optional("config", FieldKind::Object),
                ],
                |value| serde_json::from_value(value).map(EventPayload::RunCreatedV2),
            ),
            (
                EventType::RunStarted,
                1,
                vec![
                    FieldSpec::optional("host", FieldKind::String),
                    FieldSpec::optional("pid", FieldKind::U32),
                ],
                |value| serde_json::from_value(value).map(EventPayload::RunStartedV1),
            ),
            (
                EventType::RunCompleted,
                1,
                vec![
                    FieldSpec::required("summary", FieldKind::Object),
                    FieldSpec::optional("duration_ms", FieldKind::Unsigned),
                ],
                |value| serde_json::from_value(value).map(EventPayload::RunCompletedV1),
            ),
            (
                EventType::RunFailed,
                1,
                vec![
                    FieldSpec::required("error", FieldKind::String),
                    FieldSpec::optional("phase", FieldKind::String),
                ],
                |value| serde_json::from_value(value).map(EventPayload::RunFailedV1),
            ),
            (
                EventType::PhaseStarted,
                1,
                vec![
                    FieldSpec::required("phase", FieldKind::String),
                    FieldSpec::required("ordinal", FieldKind::U32),
                ],
                |value| serde_json::from_value(value).map(EventPayload::PhaseStartedV1),
            ),
            (
                EventType::PhaseCompleted,
                1,
                vec![
                    FieldSpec::required("phase", FieldKind::String),
                    FieldSpec::required("duration_ms", FieldKind::Unsigned),
                    FieldSpec::optional("status", FieldKind::String),
                ],
                |value| serde_json::from_value(value).map(EventPayload::PhaseCompletedV1),
            ),
            (
                EventType::TrialRecorded,
                1,
                vec![
                    FieldSpec::required("trial_index", FieldKind::Unsigned),
                    FieldSpec::required("params", FieldKind::Object),
                    FieldSpec::required("metrics", FieldKind::Object),
                    FieldSpec::optional("score", FieldKind::Number),
                ],
                |value| serde_json::from_value(value).map(EventPayload::TrialRecordedV1),
            ),
            (
                EventType::ArtifactCreated,
                1,
                vec![
                    FieldSpec::required("artifact_id", FieldKind::String),
                    FieldSpec::required("kind", FieldKind::String),
                    FieldSpec::required("uri", FieldKind::String),
                    FieldSpec::optional("bytes", FieldKind::Unsigned),
                ],
                |value| serde_json::from_value(value).map(EventPayload::ArtifactCreatedV1),
            ),
        ];

        for (event_type, version, fields, decoder) in builtins {
            registry
                .entries
                .insert((event_type, version), SchemaEntry { fields, decoder });
        }
        registry
    }

    /// Registers a new schema version.
    ///
    /// # Errors
    /// Returns [`LedgerError::Configuration`] for version 0 or when the pair
    /// is already registered with a different field list (schemas evolve
    /// only by version bump).
    pub fn register(
        &mut self,
        event_type: EventType,
        version: u32,
        fields: Vec<FieldSpec>,
        decoder: PayloadDecoder,
    ) -> Result<(), LedgerError> {
        if version == 0 {
            return Err(LedgerError::Configuration(
                "schema_version MUST be >= 1".to_string(),
            ));
        }

        if let Some(existing) = self.entries.get(&(event_type, version)) {
            if existing.fields != fields {
                return Err(LedgerError::Configuration(format!(
                    "{event_type} v{version} is already registered with a different shape"
                )));
            }
        }

        self.entries
            .insert((event_type, version), SchemaEntry { fields, decoder });
        Ok(())
    }

    #[must_use]
    pub fn latest_version(&self, event_type: EventType) -> Option<u32> {
        self.entries
            .keys()
            .filter(|(candidate, _)| *candidate == event_type)
            .map(|(_, version)| *version)
            .max()
    }

    #[must_use]
    pub fn fields(&self, event_type: EventType, version: u32) -> Option<&[FieldSpec]> {
        self.entries
            .get(&(event_type, version))
            .map(|entry| entry.fields.as_slice())
    }

    /// Checks a payload against the fields its declared version requires.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] naming the offending field, or
    /// [`LedgerError::UnknownSchemaVersion`] when the version is not
    /// registered for the type.
    pub fn validate(
        &self,
        event_type: &str,
        version: u32,
        payload: &Value,
    ) -> Result<EventType, LedgerError> {
        let Some(parsed) = EventType::parse(event_type) else {
            return Err(LedgerError::validation(
                event_type,
                "event_type",
                "unknown event type",
            ));
        };
        let entry = self.entry(parsed, version)?;
        check_fields(parsed, &entry.fields, payload)?;
        Ok(parsed)
    }

    /// Validates and decodes a stored payload into its typed variant.
    ///
    /// # Errors
    /// Same as [`SchemaRegistry::validate`], plus [`LedgerError::Validation`]
    /// on field `payload` when the typed decoder rejects the body.
    pub fn decode(
        &self,
        event_type: EventType,
        version: u32,
        payload: &Value,
    ) -> Result<EventPayload, LedgerError> {
        let entry = self.entry(event_type, version)?;
        check_fields(event_type, &entry.fields, payload)?;
        (entry.decoder)(payload.clone())
            .map_err(|err| LedgerError::validation(event_type.as_str(), "payload", err.to_string()))
    }

    #[must_use]
    pub fn catalog(&self) -> SchemaCatalog {
        SchemaCatalog {
            catalog_version: SCHEMA_CATALOG_VERSION.to_string(),
            schemas: self
                .entries
                .iter()
                .map(|((event_type, version), entry)| SchemaCatalogEntry {
                    event_type: *event_type,
                    schema_version: *version,
                    fields: entry.fields.clone(),
                })
                .collect(),
        }
    }

    /// Persists the catalog file atomically.
    ///
    /// # Errors
    /// Returns [`LedgerError::Io`] when the file cannot be written.
    pub fn write_catalog(&self, path: &Path) -> Result<(), LedgerError> {
        let body = serde_json::to_vec_pretty(&self.catalog())
            .map_err(|err| LedgerError::Io(format!("failed to encode schema catalog: {err}")))?;
        write_file_atomic(path, &body)
    }

    fn entry(&self, event_type: EventType, version: u32) -> Result<&SchemaEntry, LedgerError> {
        self.entries
            .get(&(event_type, version))
            .ok_or_else(|| LedgerError::UnknownSchemaVersion {
                event_type: event_type.as_str().to_string(),
                version,
            })
    }
}

fn check_fields(
    event_type: EventType,
    fields: &[FieldSpec],
    payload: &Value,
) -> Result<(), LedgerError> {
    let Some(object) = payload.as_object() else {
        return Err(LedgerError::validation(
            event_type.as_str(),
            "payload",
            "payload MUST be a JSON object",
        ));
    };

    for field in fields {
        match object.get(&field.name) {
            None | Some(Value::Null) if field.required => {
                return Err(LedgerError::validation(
                    event_type.as_str(),
                    &field.name,
                    "field is required",
                ));
            }
            Some(value) if !value.is_null() && !field.kind.matches(value) => {
                return Err(LedgerError::validation(
                    event_type.as_str(),
                    &field.name,
                    format!("expected {}", field.kind.as_str()),
                ));
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn missing_required_field_is_named() {
        let registry = SchemaRegistry::builtin();
        let result = registry.validate("phase.completed", 1, &json!({ "phase": "plan" }));
        match result {
            Err(LedgerError::Validation { field, .. }) => assert_eq!(field, "duration_ms"),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn wrong_field_type_is_rejected() {
        let registry = SchemaRegistry::builtin();
        let result = registry.validate(
            "phase.started",
            1,
            &json!({ "phase": "plan", "ordinal": "zero" }),
        );
        assert!(matches!(
            result,
            Err(LedgerError::Validation { ref field, .. }) if field == "ordinal"
        ));
    }

    #[test]
    fn u32_fields_reject_out_of_range_values_by_name() {
        let registry = SchemaRegistry::builtin();
        let too_large = u64::from(u32::MAX) + 1;
        assert!(matches!(
            registry.validate("phase.started", 1, &json!({ "phase": "plan", "ordinal": too_large })),
            Err(LedgerError::Validation { ref field, .. }) if field == "ordinal"
        ));
        assert!(registry
            .validate("phase.started", 1, &json!({ "phase": "plan", "ordinal": u32::MAX }))
            .is_ok());
        assert_eq!(FieldKind::U32.as_str(), "u32");
    }

    #[test]
    fn undeclared_version_is_unknown() {
        let registry = SchemaRegistry::builtin();
        let result = registry.validate("run.started", 7, &json!({}));
        assert_eq!(
            result,
            Err(LedgerError::UnknownSchemaVersion {
                event_type: "run.started".to_string(),
                version: 7,
            })
        );
    }

    #[test]
    fn old_versions_remain_decodable_after_evolution() {
        let registry = SchemaRegistry::builtin();
        assert_eq!(registry.latest_version(EventType::RunCreated), Some(2));

        let v1 = must(registry.decode(EventType::RunCreated, 1, &json!({ "kind": "backtest" })));
        assert!(matches!(v1, EventPayload::RunCreatedV1(_)));

        let v2_missing_hash = registry.validate("run.created", 2, &json!({ "kind": "backtest" }));
        assert!(v2_missing_hash.is_err());
    }

    #[test]
    fn reregistering_with_different_shape_fails() {
        let mut registry = SchemaRegistry::builtin();
        let result = registry.register(
            EventType::RunStarted,
            1,
            vec![FieldSpec::required("host", FieldKind::String)],
            |value| serde_json::from_value(value).map(EventPayload::RunStartedV1),
        );
        assert!(matches!(result, Err(LedgerError::Configuration(_))));

        must(registry.register(
            EventType::RunStarted,
            2,
            vec![FieldSpec::required("host", FieldKind::String)],
            |value| serde_json::from_value(value).map(EventPayload::RunStartedV1),
        ));
        assert_eq!(registry.latest_version(EventType::RunStarted), Some(2));
    }

    #[test]
    fn catalog_lists_every_pair() {
        let catalog = SchemaRegistry::builtin().catalog();
        assert_eq!(catalog.catalog_version, SCHEMA_CATALOG_VERSION);
        assert_eq!(catalog.schemas.len(), 9);
        assert!(catalog
            .schemas
            .iter()
            .any(|entry| entry.event_type == EventType::RunCreated && entry.schema_version == 2));
    }
}
