//! Predictive task driver.
//!
//! `PredictiveCore` carries everything predictive tasks share: the condition
//! gate, the result cache, chunk-offset bookkeeping, batching, the engine
//! round-trip and result integration. Concrete tasks supply the bridge and
//! their own config fields.

use std::sync::Arc;

use crate::bridge::{Bridge, BridgeError, ChunkOffset, FewshotExample};
use crate::cache::TaskCache;
use crate::config::{ConfigError, FieldValue, TaskOverrides, TaskRecord};
use crate::doc::{Document, TaskMeta, TaskState};
use crate::engine::{Engine, GenerationSettings};
use crate::task::{Condition, TaskError};

// ---------------------------------------------------------------------------
// Shared constructor parameters
// ---------------------------------------------------------------------------

/// Parameters common to every predictive task.
pub struct PredictiveParams {
    pub task_id: String,
    /// Gatekeeper: documents failing this bypass engine work entirely.
    pub condition: Option<Condition>,
    /// Documents per engine batch; `None` = single unbounded batch. A
    /// document's chunks are never split across batches.
    pub batch_size: Option<usize>,
    /// Record raw engine responses in document meta.
    pub include_meta: bool,
    pub fewshot: Vec<FewshotExample>,
    pub settings: GenerationSettings,
    /// Custom prompt instructions replacing the task default.
    pub prompt_instructions: Option<String>,
}

impl PredictiveParams {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            condition: None,
            batch_size: None,
            include_meta: false,
            fewshot: Vec::new(),
            settings: GenerationSettings::default(),
            prompt_instructions: None,
        }
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn include_meta(mut self, include_meta: bool) -> Self {
        self.include_meta = include_meta;
        self
    }

    pub fn fewshot(mut self, fewshot: Vec<FewshotExample>) -> Self {
        self.fewshot = fewshot;
        self
    }

    pub fn settings(mut self, settings: GenerationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn prompt_instructions(mut self, instructions: &str) -> Self {
        self.prompt_instructions = Some(instructions.to_string());
        self
    }

    /// Add the common fields to a task record. The engine is always a
    /// placeholder; the condition becomes one only when set, so loaders
    /// know whether to demand an override.
    pub(crate) fn extend_record(&self, record: TaskRecord) -> TaskRecord {
        let condition_field = if self.condition.is_some() {
            FieldValue::placeholder("Condition")
        } else {
            FieldValue::Literal(serde_json::Value::Null)
        };
        record
            .with_field("task_id", FieldValue::literal(&self.task_id))
            .with_field("engine", FieldValue::placeholder("Engine"))
            .with_field("condition", condition_field)
            .with_field("batch_size", FieldValue::literal(&self.batch_size))
            .with_field("include_meta", FieldValue::literal(&self.include_meta))
            .with_field("fewshot", FieldValue::literal(&self.fewshot))
            .with_field("settings", FieldValue::literal(&self.settings))
            .with_field(
                "prompt_instructions",
                FieldValue::literal(&self.prompt_instructions),
            )
    }

    /// Rebuild common parameters from a record plus load-time overrides.
    pub(crate) fn from_record(
        record: &TaskRecord,
        overrides: &TaskOverrides,
    ) -> Result<Self, ConfigError> {
        let task_id: String = record.literal("task_id")?;
        let condition = overrides.condition_if_placeholder(record, &task_id, "condition")?;
        Ok(Self {
            condition,
            batch_size: record.literal("batch_size")?,
            include_meta: record.literal("include_meta")?,
            fewshot: record.literal("fewshot")?,
            settings: record.literal("settings")?,
            prompt_instructions: record.literal("prompt_instructions")?,
            task_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Shared execution core embedded in every predictive task.
pub struct PredictiveCore {
    params: PredictiveParams,
    engine: Arc<dyn Engine>,
    bridge: Box<dyn Bridge>,
    /// Fingerprint of the owning task's full config record.
    fingerprint: String,
}

impl PredictiveCore {
    pub fn new(
        params: PredictiveParams,
        engine: Arc<dyn Engine>,
        bridge: Box<dyn Bridge>,
        fingerprint: String,
    ) -> Self {
        Self {
            params,
            engine,
            bridge,
            fingerprint,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.params.task_id
    }

    pub fn params(&self) -> &PredictiveParams {
        &self.params
    }

    /// Execute over documents in place.
    ///
    /// 1. Condition gate: false ⇒ Skipped with no result entry; a predicate
    ///    error fails that document only.
    /// 2. Cache lookup by (identity, task id, fingerprint).
    /// 3. Remaining documents run in batches through the bridge and engine;
    ///    consolidation reassembles per-document results from explicit
    ///    chunk offsets, not completion order.
    pub fn run(&self, docs: &mut [Document], cache: &TaskCache) -> Result<(), TaskError> {
        let task_id = self.params.task_id.clone();
        let mut pending: Vec<usize> = Vec::new();

        for (idx, doc) in docs.iter_mut().enumerate() {
            if let Some(condition) = &self.params.condition {
                match condition(doc) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(task_id = %task_id, identity = %doc.identity(), "Condition false: skipping");
                        doc.meta
                            .insert(task_id.clone(), TaskMeta::with_state(TaskState::Skipped));
                        continue;
                    }
                    Err(message) => {
                        tracing::warn!(
                            task_id = %task_id,
                            identity = %doc.identity(),
                            error = %message,
                            "Condition predicate failed: document marked failed"
                        );
                        let mut meta = TaskMeta::with_state(TaskState::Failed);
                        meta.error = Some(message);
                        doc.meta.insert(task_id.clone(), meta);
                        continue;
                    }
                }
            }

            if doc.text().is_none() {
                return Err(TaskError::MissingText {
                    identity: doc.identity(),
                });
            }

            if let Some(hit) = cache.get(doc.identity(), &task_id, &self.fingerprint) {
                tracing::debug!(task_id = %task_id, identity = %doc.identity(), "Cache hit");
                doc.results.insert(task_id.clone(), hit);
                let mut meta = TaskMeta::with_state(TaskState::Done);
                meta.cached = true;
                doc.meta.insert(task_id.clone(), meta);
                continue;
            }

            pending.push(idx);
        }

        if pending.is_empty() {
            return Ok(());
        }

        let batch_len = self.params.batch_size.unwrap_or(pending.len()).max(1);
        for batch in pending.chunks(batch_len) {
            self.run_batch(docs, batch, cache)?;
        }
        Ok(())
    }

    /// One engine round-trip for a batch of document indices.
    fn run_batch(
        &self,
        docs: &mut [Document],
        batch: &[usize],
        cache: &TaskCache,
    ) -> Result<(), TaskError> {
        let task_id = &self.params.task_id;

        // Flatten chunks, recording each document's offset range.
        let mut offsets: Vec<ChunkOffset> = Vec::with_capacity(batch.len());
        let mut requests = Vec::new();
        for &idx in batch {
            let start = requests.len();
            for chunk_text in docs[idx].chunk_texts() {
                requests.push(self.bridge.build_request(chunk_text, &self.params.fewshot));
            }
            offsets.push(ChunkOffset::new(start, requests.len()));
        }

        tracing::info!(
            task_id = %task_id,
            documents = batch.len(),
            chunks = requests.len(),
            "Running engine batch"
        );

        let raw = self.engine.generate(&requests, &self.params.settings)?;
        let partials: Vec<_> = raw
            .iter()
            .map(|output| output.as_ref().and_then(|o| self.bridge.parse(o)))
            .collect();

        let consolidated = self.bridge.consolidate(&partials, &offsets)?;
        if consolidated.len() != batch.len() {
            return Err(TaskError::Bridge(BridgeError::ResultCountMismatch {
                expected: batch.len(),
                actual: consolidated.len(),
            }));
        }

        for ((&idx, offset), result) in batch.iter().zip(&offsets).zip(consolidated) {
            let doc = &mut docs[idx];
            let outputs = &raw[offset.start..offset.end];

            let mut meta = TaskMeta::with_state(TaskState::Done);
            meta.latency_ms = Some(outputs.iter().flatten().map(|o| o.latency_ms).sum());
            if self.params.include_meta {
                meta.raw_responses = outputs
                    .iter()
                    .map(|o| o.as_ref().map(|r| r.text.clone()).unwrap_or_default())
                    .collect();
            }

            cache.put(doc.identity(), task_id, &self.fingerprint, result.clone());
            doc.results.insert(task_id.clone(), result);
            doc.meta.insert(task_id.clone(), meta);
        }

        Ok(())
    }
}
