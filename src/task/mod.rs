//! Tasks.
//!
//! A task is the user-facing unit of one operation. Predictive tasks own an
//! engine-backed bridge; non-predictive tasks (chunking, cleaning) are pure
//! transformations. All tasks mutate documents in place, preserve input
//! order and count, and record a terminal state per document.

pub mod chunking;
pub mod classification;
pub mod cleaning;
pub mod extraction;
pub mod predictive;
pub mod summarization;
pub mod translation;

pub use chunking::ChunkingTask;
pub use classification::{Classification, ClassificationMode};
pub use cleaning::CleaningTask;
pub use extraction::EntityExtraction;
pub use predictive::{PredictiveCore, PredictiveParams};
pub use summarization::Summarization;
pub use translation::Translation;

use std::sync::Arc;

use uuid::Uuid;

use crate::bridge::BridgeError;
use crate::cache::TaskCache;
use crate::config::TaskRecord;
use crate::doc::{Document, ResultKind, TaskResult};
use crate::engine::EngineError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Task-level failures. Carry enough context to name the failing task and
/// document in logs and pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Engine failure: {0}")]
    Engine(#[from] EngineError),

    #[error("Consolidation failure: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Document {identity} has no text: run a parsing task first")]
    MissingText { identity: Uuid },
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Gatekeeper predicate: decides per document whether a task's engine work
/// runs at all. An `Err` is fatal for that document only.
pub type Condition = Arc<dyn Fn(&Document) -> Result<bool, String> + Send + Sync>;

/// Wrap a plain closure as a `Condition`.
pub fn condition<F>(f: F) -> Condition
where
    F: Fn(&Document) -> bool + Send + Sync + 'static,
{
    Arc::new(move |doc| Ok(f(doc)))
}

// ---------------------------------------------------------------------------
// Dataset export
// ---------------------------------------------------------------------------

/// One flat row of a dataset export.
pub type DatasetRow = serde_json::Map<String, serde_json::Value>;

/// Base row shared by all exports: identity, text, and gold when present.
pub(crate) fn base_row(task_id: &str, doc: &Document) -> DatasetRow {
    let mut row = DatasetRow::new();
    row.insert(
        "identity".into(),
        serde_json::Value::String(doc.identity().to_string()),
    );
    row.insert(
        "text".into(),
        doc.text()
            .map(|t| serde_json::Value::String(t.to_string()))
            .unwrap_or(serde_json::Value::Null),
    );
    if let Some(gold) = doc.gold.get(task_id) {
        row.insert(
            "gold".into(),
            serde_json::to_value(gold).expect("result serializes"),
        );
    }
    row
}

// ---------------------------------------------------------------------------
// Task trait
// ---------------------------------------------------------------------------

/// One operation over an ordered document collection.
pub trait Task: Send + Sync {
    /// Unique identifier; keys `results`, `meta` and `gold` on documents.
    fn id(&self) -> &str;

    /// The result kind this task writes, `None` for pure transformations.
    fn result_kind(&self) -> Option<ResultKind>;

    /// Execute over documents in place. Output order and count equal the
    /// input's; each processed document gets a terminal state in `meta`.
    fn run(&self, docs: &mut [Document], cache: &TaskCache) -> Result<(), TaskError>;

    /// Serialized constructor record for this task.
    fn record(&self) -> TaskRecord;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Task").field("id", &self.id()).finish_non_exhaustive()
    }
}

/// Cast helper for result variants in dataset exports.
pub(crate) fn result_text(result: &TaskResult) -> Option<&str> {
    match result {
        TaskResult::Text { text, .. } => Some(text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_helper_wraps_plain_closures() {
        let cond = condition(|doc: &Document| doc.text().is_some());
        assert_eq!(cond(&Document::new("has text")), Ok(true));
        assert_eq!(cond(&Document::from_uri("uri://only")), Ok(false));
    }

    #[test]
    fn base_row_carries_identity_text_and_gold() {
        let doc = Document::new("row text").with_gold(
            "classify",
            TaskResult::Text {
                text: "gold".into(),
                score: None,
            },
        );
        let row = base_row("classify", &doc);
        assert_eq!(row["text"], "row text");
        assert_eq!(row["identity"], doc.identity().to_string());
        assert_eq!(row["gold"]["kind"], "text");
    }

    #[test]
    fn base_row_omits_absent_gold() {
        let row = base_row("classify", &Document::new("no gold"));
        assert!(!row.contains_key("gold"));
    }
}
