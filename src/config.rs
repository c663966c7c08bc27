//! Pipeline configuration codec.
//!
//! A pipeline serializes to a declarative tree of task records, each a map
//! from constructor-parameter name to either a literal value or a
//! placeholder marker. Placeholders stand for runtime objects that cannot
//! be durably persisted (engine clients, chunkers, condition predicates)
//! and must be supplied again at load time, in task-sequence order.
//!
//! Loading is explicit: a registry maps `class_id` to a factory closure.
//! There is no reflection over live object graphs.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chunk::Chunker;
use crate::engine::Engine;
use crate::task::{Condition, Task};

/// Crate version stamped into every dumped config.
pub const CONFIG_VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Load-time configuration failures. Fatal, never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is incompatible with {expected}")]
    VersionMismatch { expected: String, found: String },

    #[error("Unknown task class: {class_id}")]
    UnknownClass { class_id: String },

    #[error("Task '{task_id}' requires an override for placeholder field '{field}'")]
    MissingOverride { task_id: String, field: String },

    #[error("Task record for {class_id} is missing field '{field}'")]
    MissingField { class_id: String, field: String },

    #[error("Field '{field}' has an invalid value: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Override for field '{field}' has the wrong type, expected {expected}")]
    OverrideType { field: String, expected: String },
}

// ---------------------------------------------------------------------------
// Field values: literal vs placeholder
// ---------------------------------------------------------------------------

/// One serialized constructor parameter.
///
/// On the wire this is `{"is_placeholder": bool, "value": ...}`; a
/// placeholder's value holds the expected type tag instead of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FieldValueWire", into = "FieldValueWire")]
pub enum FieldValue {
    Literal(serde_json::Value),
    Placeholder { type_tag: String },
}

#[derive(Serialize, Deserialize)]
struct FieldValueWire {
    is_placeholder: bool,
    value: serde_json::Value,
}

impl From<FieldValueWire> for FieldValue {
    fn from(wire: FieldValueWire) -> Self {
        if wire.is_placeholder {
            FieldValue::Placeholder {
                type_tag: wire.value.as_str().unwrap_or("Unknown").to_string(),
            }
        } else {
            FieldValue::Literal(wire.value)
        }
    }
}

impl From<FieldValue> for FieldValueWire {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Literal(value) => FieldValueWire {
                is_placeholder: false,
                value,
            },
            FieldValue::Placeholder { type_tag } => FieldValueWire {
                is_placeholder: true,
                value: serde_json::Value::String(type_tag),
            },
        }
    }
}

impl FieldValue {
    /// Literal from any serializable value.
    pub fn literal<T: Serialize>(value: &T) -> Self {
        FieldValue::Literal(serde_json::to_value(value).expect("serializable literal"))
    }

    pub fn placeholder(type_tag: &str) -> Self {
        FieldValue::Placeholder {
            type_tag: type_tag.to_string(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, FieldValue::Placeholder { .. })
    }
}

// ---------------------------------------------------------------------------
// Task records
// ---------------------------------------------------------------------------

/// Serialized constructor record for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub class_id: String,
    pub version: String,
    /// BTreeMap keeps field order canonical for fingerprinting.
    pub fields: BTreeMap<String, FieldValue>,
}

impl TaskRecord {
    pub fn new(class_id: &str) -> Self {
        Self {
            class_id: class_id.to_string(),
            version: CONFIG_VERSION.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Fetch a literal field, deserialized into the requested type.
    pub fn literal<T: for<'de> Deserialize<'de>>(&self, name: &str) -> Result<T, ConfigError> {
        match self.fields.get(name) {
            None => Err(ConfigError::MissingField {
                class_id: self.class_id.clone(),
                field: name.to_string(),
            }),
            Some(FieldValue::Placeholder { .. }) => Err(ConfigError::InvalidField {
                field: name.to_string(),
                reason: "expected a literal, found a placeholder".into(),
            }),
            Some(FieldValue::Literal(value)) => {
                serde_json::from_value(value.clone()).map_err(|e| ConfigError::InvalidField {
                    field: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Content fingerprint over class id and fields.
    ///
    /// Placeholders contribute their type tag only, so a fingerprint is
    /// stable across runs that supply equivalent runtime objects.
    pub fn fingerprint(&self) -> String {
        let canonical =
            serde_json::to_string(&(&self.class_id, &self.fields)).expect("record serializes");
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{digest:x}")
    }

    /// The task id stored in this record's fields.
    pub fn task_id(&self) -> Result<String, ConfigError> {
        self.literal("task_id")
    }
}

// ---------------------------------------------------------------------------
// Pipeline config
// ---------------------------------------------------------------------------

/// Declarative, restorable form of a whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub dumped_at: DateTime<Utc>,
    pub tasks: Vec<TaskRecord>,
}

impl PipelineConfig {
    pub fn new(tasks: Vec<TaskRecord>) -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            dumped_at: Utc::now(),
            tasks,
        }
    }

    pub fn dump(&self, path: &Path) -> Result<(), ConfigError> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(file)?;
        config.check_version()?;
        Ok(config)
    }

    /// Fail fast on version drift; task constructor signatures are only
    /// guaranteed stable within a version.
    pub fn check_version(&self) -> Result<(), ConfigError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigError::VersionMismatch {
                expected: CONFIG_VERSION.to_string(),
                found: self.version.clone(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Overrides: runtime objects supplied at load time
// ---------------------------------------------------------------------------

/// A runtime object substituted for one placeholder field.
#[derive(Clone)]
pub enum OverrideValue {
    Engine(Arc<dyn Engine>),
    Chunker(Arc<dyn Chunker>),
    Condition(Condition),
}

/// Placeholder overrides for one task, keyed by field name.
#[derive(Clone, Default)]
pub struct TaskOverrides {
    values: HashMap<String, OverrideValue>,
}

impl TaskOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: OverrideValue) -> Self {
        self.values.insert(field.to_string(), value);
        self
    }

    pub fn with_engine(self, field: &str, engine: Arc<dyn Engine>) -> Self {
        self.with(field, OverrideValue::Engine(engine))
    }

    pub fn with_chunker(self, field: &str, chunker: Arc<dyn Chunker>) -> Self {
        self.with(field, OverrideValue::Chunker(chunker))
    }

    pub fn with_condition(self, field: &str, condition: Condition) -> Self {
        self.with(field, OverrideValue::Condition(condition))
    }

    fn get(&self, task_id: &str, field: &str) -> Result<&OverrideValue, ConfigError> {
        self.values
            .get(field)
            .ok_or_else(|| ConfigError::MissingOverride {
                task_id: task_id.to_string(),
                field: field.to_string(),
            })
    }

    pub fn engine(&self, task_id: &str, field: &str) -> Result<Arc<dyn Engine>, ConfigError> {
        match self.get(task_id, field)? {
            OverrideValue::Engine(engine) => Ok(Arc::clone(engine)),
            _ => Err(ConfigError::OverrideType {
                field: field.to_string(),
                expected: "Engine".into(),
            }),
        }
    }

    pub fn chunker(&self, task_id: &str, field: &str) -> Result<Arc<dyn Chunker>, ConfigError> {
        match self.get(task_id, field)? {
            OverrideValue::Chunker(chunker) => Ok(Arc::clone(chunker)),
            _ => Err(ConfigError::OverrideType {
                field: field.to_string(),
                expected: "Chunker".into(),
            }),
        }
    }

    pub fn condition(&self, task_id: &str, field: &str) -> Result<Condition, ConfigError> {
        match self.get(task_id, field)? {
            OverrideValue::Condition(condition) => Ok(Arc::clone(condition)),
            _ => Err(ConfigError::OverrideType {
                field: field.to_string(),
                expected: "Condition".into(),
            }),
        }
    }

    /// Condition override if the record marks the field as a placeholder.
    pub fn condition_if_placeholder(
        &self,
        record: &TaskRecord,
        task_id: &str,
        field: &str,
    ) -> Result<Option<Condition>, ConfigError> {
        match record.fields.get(field) {
            Some(FieldValue::Placeholder { .. }) => Ok(Some(self.condition(task_id, field)?)),
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type Factory = fn(&TaskRecord, &TaskOverrides) -> Result<Box<dyn Task>, ConfigError>;

/// Maps task class identifiers to constructor factories.
pub struct TaskRegistry {
    factories: HashMap<String, Factory>,
}

impl TaskRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every task class this crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(crate::task::Classification::CLASS_ID, |r, o| {
            Ok(Box::new(crate::task::Classification::from_record(r, o)?))
        });
        registry.register(crate::task::EntityExtraction::CLASS_ID, |r, o| {
            Ok(Box::new(crate::task::EntityExtraction::from_record(r, o)?))
        });
        registry.register(crate::task::Summarization::CLASS_ID, |r, o| {
            Ok(Box::new(crate::task::Summarization::from_record(r, o)?))
        });
        registry.register(crate::task::Translation::CLASS_ID, |r, o| {
            Ok(Box::new(crate::task::Translation::from_record(r, o)?))
        });
        registry.register(crate::task::ChunkingTask::CLASS_ID, |r, o| {
            Ok(Box::new(crate::task::ChunkingTask::from_record(r, o)?))
        });
        registry.register(crate::task::CleaningTask::CLASS_ID, |r, o| {
            Ok(Box::new(crate::task::CleaningTask::from_record(r, o)?))
        });
        registry
    }

    pub fn register(&mut self, class_id: &str, factory: Factory) {
        self.factories.insert(class_id.to_string(), factory);
    }

    pub fn build(
        &self,
        record: &TaskRecord,
        overrides: &TaskOverrides,
    ) -> Result<Box<dyn Task>, ConfigError> {
        let factory =
            self.factories
                .get(&record.class_id)
                .ok_or_else(|| ConfigError::UnknownClass {
                    class_id: record.class_id.clone(),
                })?;
        factory(record, overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_value_wire_format() {
        let literal = FieldValue::literal(&vec!["a", "b"]);
        let json = serde_json::to_value(&literal).unwrap();
        assert_eq!(json["is_placeholder"], false);
        assert_eq!(json["value"], json!(["a", "b"]));

        let placeholder = FieldValue::placeholder("Engine");
        let json = serde_json::to_value(&placeholder).unwrap();
        assert_eq!(json["is_placeholder"], true);
        assert_eq!(json["value"], "Engine");
    }

    #[test]
    fn field_value_round_trips() {
        for value in [
            FieldValue::literal(&42),
            FieldValue::placeholder("Chunker"),
        ] {
            let json = serde_json::to_string(&value).unwrap();
            let back: FieldValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn literal_getter_rejects_placeholder() {
        let record = TaskRecord::new("docsieve.Test")
            .with_field("engine", FieldValue::placeholder("Engine"));
        let err = record.literal::<String>("engine").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { .. }));
    }

    #[test]
    fn literal_getter_reports_missing_field() {
        let record = TaskRecord::new("docsieve.Test");
        let err = record.literal::<String>("task_id").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { .. }));
    }

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = TaskRecord::new("docsieve.Test")
            .with_field("task_id", FieldValue::literal(&"t1"))
            .with_field("labels", FieldValue::literal(&vec!["x"]));
        let b = TaskRecord::new("docsieve.Test")
            .with_field("labels", FieldValue::literal(&vec!["x"]))
            .with_field("task_id", FieldValue::literal(&"t1"));
        // Field insertion order does not matter.
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = TaskRecord::new("docsieve.Test")
            .with_field("task_id", FieldValue::literal(&"t1"))
            .with_field("labels", FieldValue::literal(&vec!["y"]));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let mut config = PipelineConfig::new(vec![]);
        config.version = "0.0.1-old".into();
        let err = config.check_version().unwrap_err();
        assert!(matches!(err, ConfigError::VersionMismatch { .. }));
    }

    #[test]
    fn missing_override_names_task_and_field() {
        let overrides = TaskOverrides::new();
        let err = overrides.engine("classify", "engine").unwrap_err();
        match err {
            ConfigError::MissingOverride { task_id, field } => {
                assert_eq!(task_id, "classify");
                assert_eq!(field, "engine");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn override_type_is_checked() {
        let chunker = Arc::new(crate::chunk::SlidingWindowChunker::new(100, 0));
        let overrides = TaskOverrides::new().with_chunker("engine", chunker);
        let err = overrides.engine("classify", "engine").unwrap_err();
        assert!(matches!(err, ConfigError::OverrideType { .. }));
    }

    #[test]
    fn unknown_class_is_rejected() {
        let registry = TaskRegistry::builtin();
        let record = TaskRecord::new("docsieve.DoesNotExist");
        let err = registry.build(&record, &TaskOverrides::new()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownClass { .. }));
    }

    #[test]
    fn config_dump_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");

        let config = PipelineConfig::new(vec![TaskRecord::new("docsieve.Test")
            .with_field("task_id", FieldValue::literal(&"t1"))
            .with_field("engine", FieldValue::placeholder("Engine"))]);
        config.dump(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded.version, CONFIG_VERSION);
        assert_eq!(loaded.tasks.len(), 1);
        assert!(loaded.tasks[0].fields["engine"].is_placeholder());
        assert_eq!(
            loaded.tasks[0].fields["task_id"],
            FieldValue::literal(&"t1")
        );
    }
}
