//! Typed entity extraction.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::bridge::{Bridge, BridgeError, ChunkOffset, Consolidation, FewshotExample};
use crate::cache::TaskCache;
use crate::config::{ConfigError, FieldValue, TaskOverrides, TaskRecord};
use crate::doc::{Document, Entity, ResultKind, TaskResult};
use crate::engine::{extract_json_object, Engine, EngineFamily, GenerationRequest, RawOutput};
use crate::task::{base_row, DatasetRow, PredictiveCore, PredictiveParams, Task, TaskError};

pub struct EntityExtraction {
    core: PredictiveCore,
    entity_labels: Vec<String>,
    record: TaskRecord,
}

impl EntityExtraction {
    pub const CLASS_ID: &'static str = "docsieve.EntityExtraction";

    pub fn new(
        params: PredictiveParams,
        entity_labels: Vec<String>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let record = params
            .extend_record(TaskRecord::new(Self::CLASS_ID))
            .with_field("entity_labels", FieldValue::literal(&entity_labels));
        let fingerprint = record.fingerprint();

        let instructions = params
            .prompt_instructions
            .clone()
            .unwrap_or_else(|| default_instructions(&entity_labels));
        let bridge = ExtractionBridge {
            instructions,
            schema: output_schema(&entity_labels),
            entity_labels: entity_labels.clone(),
            family: engine.family(),
        };

        Self {
            core: PredictiveCore::new(params, engine, Box::new(bridge), fingerprint),
            entity_labels,
            record,
        }
    }

    pub fn from_record(record: &TaskRecord, overrides: &TaskOverrides) -> Result<Self, ConfigError> {
        let params = PredictiveParams::from_record(record, overrides)?;
        let engine = overrides.engine(&params.task_id, "engine")?;
        Ok(Self::new(params, record.literal("entity_labels")?, engine))
    }

    pub fn entity_labels(&self) -> &[String] {
        &self.entity_labels
    }

    /// One row per document holding the extracted entities as JSON.
    pub fn to_rows(&self, docs: &[Document]) -> Vec<DatasetRow> {
        docs.iter()
            .filter_map(|doc| {
                let TaskResult::Entities { entities } = doc.results.get(self.id())? else {
                    return None;
                };
                let mut row = base_row(self.id(), doc);
                row.insert("entities".into(), json!(entities));
                Some(row)
            })
            .collect()
    }
}

impl Task for EntityExtraction {
    fn id(&self) -> &str {
        self.core.task_id()
    }

    fn result_kind(&self) -> Option<ResultKind> {
        Some(ResultKind::Entities)
    }

    fn run(&self, docs: &mut [Document], cache: &TaskCache) -> Result<(), TaskError> {
        self.core.run(docs, cache)
    }

    fn record(&self) -> TaskRecord {
        self.record.clone()
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

fn default_instructions(entity_labels: &[String]) -> String {
    format!(
        "Extract every entity of these types from the text: {}.\n\
         Respond with a JSON object {{\"entities\": [{{\"text\": \"<span>\", \"label\": \"<type>\", \
         \"score\": <confidence between 0 and 1>}}, ...]}}. Use the exact surface form from the text.",
        entity_labels.join(", ")
    )
}

fn output_schema(entity_labels: &[String]) -> Value {
    json!({
        "type": "object",
        "required": ["entities"],
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["text", "label"],
                    "properties": {
                        "text": { "type": "string" },
                        "label": { "type": "string", "enum": entity_labels },
                        "score": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
                    }
                }
            }
        }
    })
}

/// One bridge serves both families; only request placement differs.
struct ExtractionBridge {
    instructions: String,
    schema: Value,
    entity_labels: Vec<String>,
    family: EngineFamily,
}

impl Bridge for ExtractionBridge {
    fn build_request(&self, chunk_text: &str, fewshot: &[FewshotExample]) -> GenerationRequest {
        let examples = crate::bridge::render_fewshot(fewshot);
        match self.family {
            EngineFamily::Prompted => GenerationRequest {
                prompt: format!("{}{examples}\n\nText:\n{chunk_text}", self.instructions),
                system: None,
                schema: Some(self.schema.clone()),
            },
            EngineFamily::Schema => GenerationRequest {
                prompt: chunk_text.to_string(),
                system: Some(format!("{}{examples}", self.instructions)),
                schema: Some(self.schema.clone()),
            },
        }
    }

    fn parse(&self, raw: &RawOutput) -> Option<TaskResult> {
        let value = extract_json_object(&raw.text)?;
        let entities = value
            .get("entities")?
            .as_array()?
            .iter()
            .filter_map(|item| {
                let entity = Entity {
                    text: item.get("text")?.as_str()?.to_string(),
                    label: item.get("label")?.as_str()?.to_string(),
                    score: item.get("score").and_then(Value::as_f64),
                };
                // Out-of-vocabulary entity types are hallucinations; drop them.
                self.entity_labels.contains(&entity.label).then_some(entity)
            })
            .collect();
        Some(TaskResult::Entities { entities })
    }

    fn consolidate(
        &self,
        partials: &[Option<TaskResult>],
        offsets: &[ChunkOffset],
    ) -> Result<Vec<TaskResult>, BridgeError> {
        Consolidation::EntityUnion.consolidate(partials, offsets)
    }
}
