//! docsieve: document-processing pipelines over structured generation.
//!
//! Documents flow through an ordered list of tasks. Predictive tasks talk
//! to a generation backend through a [`task::Task`]/[`bridge::Bridge`]/
//! [`engine::Engine`] stack: the bridge renders per-chunk requests and
//! parses raw output, the engine handles the wire, and consolidation
//! reassembles chunk results into one result per document. Pipelines dump
//! to restorable JSON configs and skip engine calls for unchanged inputs
//! via a content-keyed cache.

pub mod bridge;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod doc;
pub mod engine;
pub mod pipeline;
pub mod task;

pub use bridge::{Bridge, BridgeError, ChunkOffset, Consolidation, FewshotExample};
pub use cache::{CacheStore, MemoryStore, TaskCache};
pub use chunk::{Chunker, SlidingWindowChunker};
pub use config::{
    ConfigError, FieldValue, OverrideValue, PipelineConfig, TaskOverrides, TaskRecord,
    TaskRegistry,
};
pub use doc::{
    ChunkSpan, Document, Entity, LabelScore, ResultKind, TaskMeta, TaskResult, TaskState,
};
pub use engine::{
    Engine, EngineError, EngineFamily, GenerationRequest, GenerationSettings, MockEngine,
    OllamaEngine, OpenAiEngine, RawOutput,
};
pub use pipeline::{Pipeline, PipelineError};
pub use task::{
    condition, ChunkingTask, Classification, ClassificationMode, CleaningTask, Condition,
    EntityExtraction, PredictiveParams, Summarization, Task, TaskError, Translation,
};

use tracing_subscriber::EnvFilter;

/// Initialize tracing from `RUST_LOG`, defaulting to info for this crate.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docsieve=info")),
        )
        .init();
}
