//! Chunking as a pipeline step.
//!
//! Wraps a [`Chunker`] so splitting happens inside the pipeline and is
//! captured in its config. Chunkers are runtime objects, so the record
//! stores a placeholder for the field.

use std::sync::Arc;

use crate::cache::TaskCache;
use crate::chunk::Chunker;
use crate::config::{ConfigError, FieldValue, TaskOverrides, TaskRecord};
use crate::doc::{Document, ResultKind, TaskMeta, TaskState};
use crate::task::{Task, TaskError};

#[derive(Debug)]
pub struct ChunkingTask {
    task_id: String,
    chunker: Arc<dyn Chunker>,
}

impl ChunkingTask {
    pub const CLASS_ID: &'static str = "docsieve.Chunking";

    pub fn new(task_id: &str, chunker: Arc<dyn Chunker>) -> Self {
        Self {
            task_id: task_id.to_string(),
            chunker,
        }
    }

    pub fn from_record(record: &TaskRecord, overrides: &TaskOverrides) -> Result<Self, ConfigError> {
        let task_id: String = record.literal("task_id")?;
        let chunker = overrides.chunker(&task_id, "chunker")?;
        Ok(Self { task_id, chunker })
    }
}

impl Task for ChunkingTask {
    fn id(&self) -> &str {
        &self.task_id
    }

    fn result_kind(&self) -> Option<ResultKind> {
        None
    }

    fn run(&self, docs: &mut [Document], _cache: &TaskCache) -> Result<(), TaskError> {
        for doc in docs.iter_mut() {
            let Some(text) = doc.text() else {
                return Err(TaskError::MissingText {
                    identity: doc.identity(),
                });
            };
            let spans = self.chunker.chunk(text);
            tracing::debug!(
                task_id = %self.task_id,
                identity = %doc.identity(),
                chunks = spans.len(),
                "Document chunked"
            );
            doc.set_chunks(spans);
            doc.meta
                .insert(self.task_id.clone(), TaskMeta::with_state(TaskState::Done));
        }
        Ok(())
    }

    fn record(&self) -> TaskRecord {
        TaskRecord::new(Self::CLASS_ID)
            .with_field("task_id", FieldValue::literal(&self.task_id))
            .with_field("chunker", FieldValue::placeholder("Chunker"))
    }
}
