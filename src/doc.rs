//! Document data model.
//!
//! A `Document` is the unit of data flowing through the pipeline. It is
//! created by the caller, mutated in place by each task, and never destroyed
//! by the pipeline: ownership stays with the caller throughout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Derive a stable document identity from content.
///
/// SHA-256 of the content, folded into a UUIDv5 so identities render as
/// compact, comparable strings. Used as the cache key component and for
/// gold-data lookup.
pub fn derive_identity(content: &str) -> Uuid {
    let digest = Sha256::digest(content.as_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &digest)
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

/// A contiguous text span of a document, in byte offsets.
///
/// Produced by a chunker when the full text exceeds a backend's input
/// budget. Offsets always fall on `char` boundaries of the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
}

impl ChunkSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// The text this span covers.
    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A single label with its score, as produced by classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
    pub label: String,
    pub score: f64,
}

/// A single extracted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub label: String,
    pub score: Option<f64>,
}

/// The kind of result a task declares it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Labels,
    Entities,
    Text,
}

/// A task's consolidated per-document result.
///
/// `results[task_id]` on a document is either absent (task skipped or not
/// yet run) or holds exactly the variant matching the task's declared
/// `ResultKind`: never a partial or mixed shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskResult {
    /// Scored labels, sorted by score descending.
    Labels { labels: Vec<LabelScore> },
    /// Deduplicated entities.
    Entities { entities: Vec<Entity> },
    /// Free text (summary, translation) with an optional confidence.
    Text { text: String, score: Option<f64> },
}

impl TaskResult {
    pub fn kind(&self) -> ResultKind {
        match self {
            TaskResult::Labels { .. } => ResultKind::Labels,
            TaskResult::Entities { .. } => ResultKind::Entities,
            TaskResult::Text { .. } => ResultKind::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-task execution metadata
// ---------------------------------------------------------------------------

/// Terminal state of a task for one document.
///
/// Pending is represented by the absence of a meta entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Condition evaluated false: engine work bypassed, no result written.
    Skipped,
    /// Task ran and wrote a result (or completed its transformation).
    Done,
    /// Task failed for this document (e.g. condition predicate errored).
    Failed,
}

/// Diagnostic metadata recorded per (document, task).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMeta {
    pub state: Option<TaskState>,
    /// Summed engine latency across this document's chunks.
    pub latency_ms: Option<u64>,
    /// Raw engine responses, one per chunk. Populated only when the task
    /// has `include_meta` set.
    pub raw_responses: Vec<String>,
    /// Whether the result was served from cache.
    pub cached: bool,
    pub error: Option<String>,
}

impl TaskMeta {
    pub fn with_state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// The unit of data flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    identity: Uuid,
    pub uri: Option<String>,
    text: Option<String>,
    /// Spans produced by the most recent chunking task. Empty means the
    /// whole text is treated as one chunk.
    chunks: Vec<ChunkSpan>,
    /// Task identifier → that task's consolidated result.
    pub results: HashMap<String, TaskResult>,
    /// Task identifier → diagnostic metadata.
    pub meta: HashMap<String, TaskMeta>,
    /// Task identifier → ground-truth annotation. Read by evaluation and
    /// dataset export only, never mutated by inference.
    pub gold: HashMap<String, TaskResult>,
}

impl Document {
    /// Create a document from raw text. Identity is derived from the text.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            identity: derive_identity(&text),
            uri: None,
            text: Some(text),
            chunks: Vec::new(),
            results: HashMap::new(),
            meta: HashMap::new(),
            gold: HashMap::new(),
        }
    }

    /// Create a document from a URI, with text unset until a parsing task
    /// supplies it. Identity is derived from the URI until then.
    pub fn from_uri(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            identity: derive_identity(&uri),
            uri: Some(uri),
            text: None,
            chunks: Vec::new(),
            results: HashMap::new(),
            meta: HashMap::new(),
            gold: HashMap::new(),
        }
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Replace the document text. Recomputes identity and clears chunk
    /// spans, since both are derived from the old text.
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.identity = derive_identity(&text);
        self.text = Some(text);
        self.chunks.clear();
    }

    pub fn chunks(&self) -> &[ChunkSpan] {
        &self.chunks
    }

    /// Replace chunk spans. Spans are replaced wholesale, never merged with
    /// spans from an earlier chunking task.
    pub fn set_chunks(&mut self, chunks: Vec<ChunkSpan>) {
        self.chunks = chunks;
    }

    /// The texts the engine will see for this document: chunk slices when
    /// chunked, otherwise the whole text as a single chunk.
    ///
    /// Returns an empty vec when text is unset.
    pub fn chunk_texts(&self) -> Vec<&str> {
        match self.text.as_deref() {
            None => Vec::new(),
            Some(text) if self.chunks.is_empty() => vec![text],
            Some(text) => self.chunks.iter().map(|c| c.slice(text)).collect(),
        }
    }

    /// Attach a ground-truth annotation for a task.
    pub fn with_gold(mut self, task_id: &str, gold: TaskResult) -> Self {
        self.gold.insert(task_id.to_string(), gold);
        self
    }

    /// Terminal state of a task for this document, if any.
    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.meta.get(task_id).and_then(|m| m.state)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
