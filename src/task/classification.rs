//! Text classification over a fixed label set.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::bridge::{Bridge, BridgeError, ChunkOffset, Consolidation, FewshotExample};
use crate::cache::TaskCache;
use crate::config::{ConfigError, FieldValue, TaskOverrides, TaskRecord};
use crate::doc::{Document, LabelScore, ResultKind, TaskResult};
use crate::engine::{extract_json_object, Engine, EngineFamily, GenerationRequest, RawOutput};
use crate::task::{base_row, DatasetRow, PredictiveCore, PredictiveParams, Task, TaskError};

/// Single-label picks one winner; multi-label scores every label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMode {
    SingleLabel,
    MultiLabel,
}

pub struct Classification {
    core: PredictiveCore,
    labels: Vec<String>,
    descriptions: BTreeMap<String, String>,
    mode: ClassificationMode,
    record: TaskRecord,
}

impl Classification {
    pub const CLASS_ID: &'static str = "docsieve.Classification";

    pub fn new(
        params: PredictiveParams,
        labels: Vec<String>,
        descriptions: BTreeMap<String, String>,
        mode: ClassificationMode,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let record = params
            .extend_record(TaskRecord::new(Self::CLASS_ID))
            .with_field("labels", FieldValue::literal(&labels))
            .with_field("descriptions", FieldValue::literal(&descriptions))
            .with_field("mode", FieldValue::literal(&mode));
        let fingerprint = record.fingerprint();

        let instructions = params
            .prompt_instructions
            .clone()
            .unwrap_or_else(|| default_instructions(mode, &labels, &descriptions));
        let schema = output_schema(mode, &labels);
        let bridge: Box<dyn Bridge> = match engine.family() {
            EngineFamily::Prompted => Box::new(PromptedClassificationBridge {
                instructions,
                schema,
                mode,
                labels: labels.clone(),
            }),
            EngineFamily::Schema => Box::new(SchemaClassificationBridge {
                instructions,
                schema,
                mode,
                labels: labels.clone(),
            }),
        };

        Self {
            core: PredictiveCore::new(params, engine, bridge, fingerprint),
            labels,
            descriptions,
            mode,
            record,
        }
    }

    pub fn from_record(record: &TaskRecord, overrides: &TaskOverrides) -> Result<Self, ConfigError> {
        let params = PredictiveParams::from_record(record, overrides)?;
        let engine = overrides.engine(&params.task_id, "engine")?;
        Ok(Self::new(
            params,
            record.literal("labels")?,
            record.literal("descriptions")?,
            record.literal("mode")?,
            engine,
        ))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Flatten results into rows: one column per label, holding its score.
    /// Documents without a result for this task are omitted.
    pub fn to_rows(&self, docs: &[Document]) -> Vec<DatasetRow> {
        docs.iter()
            .filter_map(|doc| {
                let TaskResult::Labels { labels: scores } = doc.results.get(self.id())? else {
                    return None;
                };
                let mut row = base_row(self.id(), doc);
                for ls in scores {
                    row.insert(ls.label.clone(), json!(ls.score));
                }
                Some(row)
            })
            .collect()
    }
}

impl Task for Classification {
    fn id(&self) -> &str {
        self.core.task_id()
    }

    fn result_kind(&self) -> Option<ResultKind> {
        Some(ResultKind::Labels)
    }

    fn run(&self, docs: &mut [Document], cache: &TaskCache) -> Result<(), TaskError> {
        self.core.run(docs, cache)
    }

    fn record(&self) -> TaskRecord {
        self.record.clone()
    }
}

// ---------------------------------------------------------------------------
// Prompt / schema rendering
// ---------------------------------------------------------------------------

fn default_instructions(
    mode: ClassificationMode,
    labels: &[String],
    descriptions: &BTreeMap<String, String>,
) -> String {
    let mut label_lines = String::new();
    for label in labels {
        match descriptions.get(label) {
            Some(desc) => label_lines.push_str(&format!("- {label}: {desc}\n")),
            None => label_lines.push_str(&format!("- {label}\n")),
        }
    }
    match mode {
        ClassificationMode::SingleLabel => format!(
            "Classify the text into exactly one of these labels:\n{label_lines}\
             Respond with a JSON object {{\"label\": \"<label>\", \"score\": <confidence between 0 and 1>}}."
        ),
        ClassificationMode::MultiLabel => format!(
            "Score how well each of these labels applies to the text (0 to 1):\n{label_lines}\
             Respond with a JSON object {{\"labels\": [{{\"label\": \"<label>\", \"score\": <0..1>}}, ...]}} \
             covering every label."
        ),
    }
}

fn output_schema(mode: ClassificationMode, labels: &[String]) -> Value {
    let label_score = json!({
        "type": "object",
        "required": ["label", "score"],
        "properties": {
            "label": { "type": "string", "enum": labels },
            "score": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        }
    });
    match mode {
        ClassificationMode::SingleLabel => label_score,
        ClassificationMode::MultiLabel => json!({
            "type": "object",
            "required": ["labels"],
            "properties": { "labels": { "type": "array", "items": label_score } }
        }),
    }
}

/// Shared output parsing for both bridges. Unknown labels are kept here;
/// consolidation drops anything outside the task's label set.
fn parse_label_output(value: &Value, mode: ClassificationMode) -> Option<TaskResult> {
    let to_score = |item: &Value| -> Option<LabelScore> {
        Some(LabelScore {
            label: item.get("label")?.as_str()?.to_string(),
            score: item.get("score")?.as_f64()?,
        })
    };
    let scores = match mode {
        ClassificationMode::SingleLabel => vec![to_score(value)?],
        ClassificationMode::MultiLabel => value
            .get("labels")?
            .as_array()?
            .iter()
            .filter_map(to_score)
            .collect(),
    };
    Some(TaskResult::Labels { labels: scores })
}

struct PromptedClassificationBridge {
    instructions: String,
    schema: Value,
    mode: ClassificationMode,
    labels: Vec<String>,
}

impl Bridge for PromptedClassificationBridge {
    fn build_request(&self, chunk_text: &str, fewshot: &[FewshotExample]) -> GenerationRequest {
        let examples = crate::bridge::render_fewshot(fewshot);
        GenerationRequest {
            prompt: format!("{}{examples}\n\nText:\n{chunk_text}", self.instructions),
            system: None,
            schema: Some(self.schema.clone()),
        }
    }

    fn parse(&self, raw: &RawOutput) -> Option<TaskResult> {
        parse_label_output(&extract_json_object(&raw.text)?, self.mode)
    }

    fn consolidate(
        &self,
        partials: &[Option<TaskResult>],
        offsets: &[ChunkOffset],
    ) -> Result<Vec<TaskResult>, BridgeError> {
        Consolidation::LabelScores {
            labels: self.labels.clone(),
        }
        .consolidate(partials, offsets)
    }
}

struct SchemaClassificationBridge {
    instructions: String,
    schema: Value,
    mode: ClassificationMode,
    labels: Vec<String>,
}

impl Bridge for SchemaClassificationBridge {
    fn build_request(&self, chunk_text: &str, fewshot: &[FewshotExample]) -> GenerationRequest {
        let examples = crate::bridge::render_fewshot(fewshot);
        GenerationRequest {
            prompt: chunk_text.to_string(),
            system: Some(format!("{}{examples}", self.instructions)),
            schema: Some(self.schema.clone()),
        }
    }

    fn parse(&self, raw: &RawOutput) -> Option<TaskResult> {
        parse_label_output(&extract_json_object(&raw.text)?, self.mode)
    }

    fn consolidate(
        &self,
        partials: &[Option<TaskResult>],
        offsets: &[ChunkOffset],
    ) -> Result<Vec<TaskResult>, BridgeError> {
        Consolidation::LabelScores {
            labels: self.labels.clone(),
        }
        .consolidate(partials, offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;

    fn task(engine: Arc<dyn Engine>, mode: ClassificationMode) -> Classification {
        Classification::new(
            PredictiveParams::new("topic"),
            vec!["science".into(), "sports".into()],
            BTreeMap::new(),
            mode,
            engine,
        )
    }

    #[test]
    fn multi_label_scores_every_label() {
        let engine = Arc::new(MockEngine::new(vec![
            r#"{"labels": [{"label": "science", "score": 0.9}, {"label": "sports", "score": 0.1}]}"#
                .into(),
        ]));
        let task = task(engine, ClassificationMode::MultiLabel);
        let cache = TaskCache::in_memory();

        let mut docs = vec![Document::new("quantum entanglement explained")];
        task.run(&mut docs, &cache).unwrap();

        let TaskResult::Labels { labels: scores } = &docs[0].results["topic"] else {
            panic!("expected label scores");
        };
        assert_eq!(scores[0].label, "science");
        assert!((scores[0].score - 0.9).abs() < 1e-9);
        assert_eq!(scores.len(), 2);
    }

    #[test]
    fn single_label_output_becomes_one_score() {
        let engine = Arc::new(MockEngine::new(vec![
            r#"{"label": "sports", "score": 0.8}"#.into(),
        ]));
        let task = task(engine, ClassificationMode::SingleLabel);
        let cache = TaskCache::in_memory();

        let mut docs = vec![Document::new("the match went to penalties")];
        task.run(&mut docs, &cache).unwrap();

        let TaskResult::Labels { labels: scores } = &docs[0].results["topic"] else {
            panic!("expected label scores");
        };
        assert_eq!(scores[0].label, "sports");
        // Unmentioned labels still appear with a zero score.
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[1].score, 0.0);
    }

    #[test]
    fn schema_bridge_puts_instructions_in_system() {
        let bridge = SchemaClassificationBridge {
            instructions: "Classify the text.".into(),
            schema: json!({}),
            mode: ClassificationMode::MultiLabel,
            labels: vec!["science".into()],
        };
        let request = bridge.build_request("some chunk", &[]);
        assert_eq!(request.system.as_deref(), Some("Classify the text."));
        assert_eq!(request.prompt, "some chunk");
        assert!(request.schema.is_some());
    }

    #[test]
    fn prompted_bridge_inlines_text_into_prompt() {
        let bridge = PromptedClassificationBridge {
            instructions: "Classify the text.".into(),
            schema: json!({}),
            mode: ClassificationMode::MultiLabel,
            labels: vec!["science".into()],
        };
        let request = bridge.build_request("some chunk", &[]);
        assert!(request.system.is_none());
        assert!(request.prompt.contains("Classify the text."));
        assert!(request.prompt.contains("some chunk"));
    }

    #[test]
    fn record_round_trips_through_registry_factory() {
        let engine: Arc<dyn Engine> = Arc::new(MockEngine::new(vec![]));
        let original = task(Arc::clone(&engine), ClassificationMode::MultiLabel);
        let record = original.record();

        let overrides = TaskOverrides::new().with_engine("engine", engine);
        let restored = Classification::from_record(&record, &overrides).unwrap();

        assert_eq!(restored.id(), "topic");
        assert_eq!(restored.labels(), original.labels());
        assert_eq!(restored.record().fingerprint(), record.fingerprint());
    }

    #[test]
    fn to_rows_emits_one_column_per_label() {
        let engine = Arc::new(MockEngine::new(vec![
            r#"{"labels": [{"label": "science", "score": 0.7}, {"label": "sports", "score": 0.2}]}"#
                .into(),
        ]));
        let task = task(engine, ClassificationMode::MultiLabel);
        let cache = TaskCache::in_memory();

        let mut docs = vec![Document::new("telescope time"), Document::new("no result")];
        task.run(&mut docs[..1], &cache).unwrap();

        let rows = task.to_rows(&docs);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["science"], json!(0.7));
        assert_eq!(rows[0]["text"], json!("telescope time"));
    }
}
