//! Machine translation into a target language.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::bridge::{Bridge, BridgeError, ChunkOffset, Consolidation, FewshotExample};
use crate::cache::TaskCache;
use crate::config::{ConfigError, FieldValue, TaskOverrides, TaskRecord};
use crate::doc::{Document, ResultKind, TaskResult, TaskState};
use crate::engine::{extract_json_object, Engine, EngineFamily, GenerationRequest, RawOutput};
use crate::task::{base_row, DatasetRow, PredictiveCore, PredictiveParams, Task, TaskError};

pub struct Translation {
    core: PredictiveCore,
    target_language: String,
    /// Replace each document's text with its translation after the run.
    /// Recomputes identity, so downstream caching keys off the new text.
    overwrite: bool,
    record: TaskRecord,
}

impl Translation {
    pub const CLASS_ID: &'static str = "docsieve.Translation";

    pub fn new(
        params: PredictiveParams,
        target_language: &str,
        overwrite: bool,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let record = params
            .extend_record(TaskRecord::new(Self::CLASS_ID))
            .with_field("target_language", FieldValue::literal(&target_language))
            .with_field("overwrite", FieldValue::literal(&overwrite));
        let fingerprint = record.fingerprint();

        let instructions = params
            .prompt_instructions
            .clone()
            .unwrap_or_else(|| default_instructions(target_language));
        let bridge = TranslationBridge {
            instructions,
            schema: output_schema(),
            family: engine.family(),
        };

        Self {
            core: PredictiveCore::new(params, engine, Box::new(bridge), fingerprint),
            target_language: target_language.to_string(),
            overwrite,
            record,
        }
    }

    pub fn from_record(record: &TaskRecord, overrides: &TaskOverrides) -> Result<Self, ConfigError> {
        let params = PredictiveParams::from_record(record, overrides)?;
        let engine = overrides.engine(&params.task_id, "engine")?;
        let target_language: String = record.literal("target_language")?;
        Ok(Self::new(
            params,
            &target_language,
            record.literal("overwrite")?,
            engine,
        ))
    }

    pub fn target_language(&self) -> &str {
        &self.target_language
    }

    pub fn to_rows(&self, docs: &[Document]) -> Vec<DatasetRow> {
        docs.iter()
            .filter_map(|doc| {
                let TaskResult::Text { text, score } = doc.results.get(self.id())? else {
                    return None;
                };
                let mut row = base_row(self.id(), doc);
                row.insert("target_language".into(), json!(self.target_language));
                row.insert("translation".into(), json!(text));
                row.insert("score".into(), json!(score));
                Some(row)
            })
            .collect()
    }
}

impl Task for Translation {
    fn id(&self) -> &str {
        self.core.task_id()
    }

    fn result_kind(&self) -> Option<ResultKind> {
        Some(ResultKind::Text)
    }

    fn run(&self, docs: &mut [Document], cache: &TaskCache) -> Result<(), TaskError> {
        self.core.run(docs, cache)?;
        if self.overwrite {
            for doc in docs.iter_mut() {
                if doc.task_state(self.id()) != Some(TaskState::Done) {
                    continue;
                }
                let Some(TaskResult::Text { text, .. }) = doc.results.get(self.id()) else {
                    continue;
                };
                if !text.is_empty() {
                    let translation = text.clone();
                    doc.set_text(&translation);
                }
            }
        }
        Ok(())
    }

    fn record(&self) -> TaskRecord {
        self.record.clone()
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

fn default_instructions(target_language: &str) -> String {
    format!(
        "Translate the text into {target_language}. Respond with a JSON object \
         {{\"translation\": \"<translated text>\", \"score\": <confidence between 0 and 1>}}."
    )
}

fn output_schema() -> Value {
    json!({
        "type": "object",
        "required": ["translation"],
        "properties": {
            "translation": { "type": "string" },
            "score": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        }
    })
}

struct TranslationBridge {
    instructions: String,
    schema: Value,
    family: EngineFamily,
}

impl Bridge for TranslationBridge {
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
        Some(TaskResult::Text {
            text: value.get("translation")?.as_str()?.to_string(),
            score: value.get("score").and_then(Value::as_f64),
        })
    }

    fn consolidate(
        &self,
        partials: &[Option<TaskResult>],
        offsets: &[ChunkOffset],
    ) -> Result<Vec<TaskResult>, BridgeError> {
        // Chunk translations concatenate in document order.
        Consolidation::TextJoin {
            separator: " ".into(),
        }
        .consolidate(partials, offsets)
    }
}
