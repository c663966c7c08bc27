//! Abstractive summarization.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::bridge::{Bridge, BridgeError, ChunkOffset, Consolidation, FewshotExample};
use crate::cache::TaskCache;
use crate::config::{ConfigError, FieldValue, TaskOverrides, TaskRecord};
use crate::doc::{Document, ResultKind, TaskResult, TaskState};
use crate::engine::{extract_json_object, Engine, EngineFamily, GenerationRequest, RawOutput};
use crate::task::{base_row, DatasetRow, PredictiveCore, PredictiveParams, Task, TaskError};

pub struct Summarization {
    core: PredictiveCore,
    max_words: Option<usize>,
    /// Replace each document's text with its summary after the run.
    /// Recomputes identity, so downstream caching keys off the new text.
    overwrite: bool,
    record: TaskRecord,
}

impl Summarization {
    pub const CLASS_ID: &'static str = "docsieve.Summarization";

    pub fn new(
        params: PredictiveParams,
        max_words: Option<usize>,
        overwrite: bool,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let record = params
            .extend_record(TaskRecord::new(Self::CLASS_ID))
            .with_field("max_words", FieldValue::literal(&max_words))
            .with_field("overwrite", FieldValue::literal(&overwrite));
        let fingerprint = record.fingerprint();

        let instructions = params
            .prompt_instructions
            .clone()
            .unwrap_or_else(|| default_instructions(max_words));
        let bridge = SummarizationBridge {
            instructions,
            schema: output_schema(),
            family: engine.family(),
        };

        Self {
            core: PredictiveCore::new(params, engine, Box::new(bridge), fingerprint),
            max_words,
            overwrite,
            record,
        }
    }

    pub fn from_record(record: &TaskRecord, overrides: &TaskOverrides) -> Result<Self, ConfigError> {
        let params = PredictiveParams::from_record(record, overrides)?;
        let engine = overrides.engine(&params.task_id, "engine")?;
        Ok(Self::new(
            params,
            record.literal("max_words")?,
            record.literal("overwrite")?,
            engine,
        ))
    }

    pub fn max_words(&self) -> Option<usize> {
        self.max_words
    }

    pub fn to_rows(&self, docs: &[Document]) -> Vec<DatasetRow> {
        docs.iter()
            .filter_map(|doc| {
                let TaskResult::Text { text, score } = doc.results.get(self.id())? else {
                    return None;
                };
                let mut row = base_row(self.id(), doc);
                row.insert("summary".into(), json!(text));
                row.insert("score".into(), json!(score));
                Some(row)
            })
            .collect()
    }
}

impl Task for Summarization {
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
                    let summary = text.clone();
                    doc.set_text(&summary);
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

fn default_instructions(max_words: Option<usize>) -> String {
    let budget = match max_words {
        Some(n) => format!(" in at most {n} words"),
        None => String::new(),
    };
    format!(
        "Summarize the text{budget}. Respond with a JSON object \
         {{\"summary\": \"<summary>\", \"score\": <confidence between 0 and 1>}}."
    )
}

fn output_schema() -> Value {
    json!({
        "type": "object",
        "required": ["summary"],
        "properties": {
            "summary": { "type": "string" },
            "score": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        }
    })
}

struct SummarizationBridge {
    instructions: String,
    schema: Value,
    family: EngineFamily,
}

impl Bridge for SummarizationBridge {
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
            text: value.get("summary")?.as_str()?.to_string(),
            score: value.get("score").and_then(Value::as_f64),
        })
    }

    fn consolidate(
        &self,
        partials: &[Option<TaskResult>],
        offsets: &[ChunkOffset],
    ) -> Result<Vec<TaskResult>, BridgeError> {
        Consolidation::TextJoin {
            separator: " ".into(),
        }
        .consolidate(partials, offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::ChunkSpan;
    use crate::engine::MockEngine;

    #[test]
    fn writes_summary_result() {
        let engine = Arc::new(MockEngine::new(vec![
            r#"{"summary": "Short version.", "score": 0.9}"#.into(),
        ]));
        let task = Summarization::new(PredictiveParams::new("summary"), Some(20), false, engine);
        let cache = TaskCache::in_memory();

        let mut docs = vec![Document::new("A very long text about many things.")];
        task.run(&mut docs, &cache).unwrap();

        assert_eq!(
            docs[0].results["summary"],
            TaskResult::Text {
                text: "Short version.".into(),
                score: Some(0.9)
            }
        );
        // Text untouched without overwrite.
        assert_eq!(docs[0].text(), Some("A very long text about many things."));
    }

    #[test]
    fn overwrite_replaces_text_and_identity() {
        let engine = Arc::new(MockEngine::new(vec![
            r#"{"summary": "Condensed.", "score": 0.8}"#.into(),
        ]));
        let task = Summarization::new(PredictiveParams::new("summary"), None, true, engine);
        let cache = TaskCache::in_memory();

        let mut docs = vec![Document::new("Original long body of text here.")];
        let before = docs[0].identity();
        task.run(&mut docs, &cache).unwrap();

        assert_eq!(docs[0].text(), Some("Condensed."));
        assert_ne!(docs[0].identity(), before);
        assert!(docs[0].chunks().is_empty());
    }

    #[test]
    fn chunk_summaries_join_in_offset_order() {
        let engine = Arc::new(MockEngine::new(vec![
            r#"{"summary": "First part."}"#.into(),
            r#"{"summary": "Second part."}"#.into(),
        ]));
        let task = Summarization::new(PredictiveParams::new("summary"), None, false, engine);
        let cache = TaskCache::in_memory();

        let mut doc = Document::new("aaaa bbbb cccc dddd");
        doc.set_chunks(vec![ChunkSpan::new(0, 9), ChunkSpan::new(10, 19)]);
        let mut docs = vec![doc];
        task.run(&mut docs, &cache).unwrap();

        assert_eq!(
            crate::task::result_text(&docs[0].results["summary"]),
            Some("First part. Second part.")
        );
    }

    #[test]
    fn record_round_trips_through_factory() {
        let engine: Arc<dyn Engine> = Arc::new(MockEngine::new(vec![]));
        let original =
            Summarization::new(PredictiveParams::new("summary"), Some(50), true, Arc::clone(&engine));
        let record = original.record();

        let overrides = TaskOverrides::new().with_engine("engine", engine);
        let restored = Summarization::from_record(&record, &overrides).unwrap();
        assert_eq!(restored.max_words(), Some(50));
        assert_eq!(restored.record().fingerprint(), record.fingerprint());
    }
}
