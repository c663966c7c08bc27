//! Task/engine bridges.
//!
//! A bridge is the per-task, per-engine-family translator: it renders the
//! structured-generation request for one chunk, parses raw engine output
//! into a per-chunk partial result, and consolidates a document's chunk
//! partials into one result. Tasks pick the bridge matching their engine's
//! family tag at construction time.

pub mod consolidate;

pub use consolidate::Consolidation;

use serde::{Deserialize, Serialize};

use crate::doc::TaskResult;
use crate::engine::{GenerationRequest, RawOutput};

// ---------------------------------------------------------------------------
// Chunk offsets
// ---------------------------------------------------------------------------

/// Index range within a flattened chunk-result sequence attributable to one
/// document.
///
/// Offsets across a batch are contiguous and monotonically non-decreasing;
/// `end - start` equals the number of chunks the document contributed
/// (minimum 1, even unchunked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkOffset {
    pub start: usize,
    pub end: usize,
}

impl ChunkOffset {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Check offsets against the flattened partials they index into.
///
/// Malformed offsets are an internal invariant breach, not a data condition,
/// so they error rather than degrade.
pub fn validate_offsets(offsets: &[ChunkOffset], partials_len: usize) -> Result<(), BridgeError> {
    let mut expected_start = 0;
    for (i, offset) in offsets.iter().enumerate() {
        if offset.start != expected_start || offset.end < offset.start + 1 {
            return Err(BridgeError::NonContiguousOffsets { index: i });
        }
        expected_start = offset.end;
    }
    if expected_start != partials_len {
        return Err(BridgeError::OffsetMismatch {
            expected: expected_start,
            actual: partials_len,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised during consolidation. Malformed model output never lands
/// here: `parse` degrades it to `None` per chunk.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Chunk offsets cover {expected} results but {actual} partials were provided")]
    OffsetMismatch { expected: usize, actual: usize },

    #[error("Chunk offsets are not contiguous at document index {index}")]
    NonContiguousOffsets { index: usize },

    #[error("Consolidation produced {actual} results for {expected} documents")]
    ResultCountMismatch { expected: usize, actual: usize },
}

// ---------------------------------------------------------------------------
// Few-shot examples
// ---------------------------------------------------------------------------

/// One few-shot example: input text plus the expected structured output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewshotExample {
    pub input: String,
    pub output: serde_json::Value,
}

/// Render few-shot examples as a prompt section. Empty input renders empty.
pub fn render_fewshot(examples: &[FewshotExample]) -> String {
    if examples.is_empty() {
        return String::new();
    }

    let mut out = String::from("\nExamples:\n");
    for example in examples {
        out.push_str(&format!(
            "Input: {}\nOutput: {}\n",
            example.input, example.output
        ));
    }
    out
}

// ---------------------------------------------------------------------------
// Bridge trait
// ---------------------------------------------------------------------------

/// Translator between one task's semantics and one engine family.
pub trait Bridge: Send + Sync {
    /// Render the structured-generation request for one chunk.
    /// Deterministic for identical inputs; incorporates few-shot examples.
    fn build_request(&self, chunk_text: &str, fewshot: &[FewshotExample]) -> GenerationRequest;

    /// Parse raw engine output into a per-chunk partial result.
    /// Never errors: malformed output yields `None`.
    fn parse(&self, raw: &RawOutput) -> Option<TaskResult>;

    /// Consolidate per-chunk partials into exactly one result per document
    /// offset. A document whose every partial is `None` yields the task's
    /// neutral result, never an omission.
    fn consolidate(
        &self,
        partials: &[Option<TaskResult>],
        offsets: &[ChunkOffset],
    ) -> Result<Vec<TaskResult>, BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_offsets_validate() {
        let offsets = [
            ChunkOffset::new(0, 2),
            ChunkOffset::new(2, 3),
            ChunkOffset::new(3, 7),
        ];
        assert!(validate_offsets(&offsets, 7).is_ok());
    }

    #[test]
    fn gap_in_offsets_is_rejected() {
        let offsets = [ChunkOffset::new(0, 2), ChunkOffset::new(3, 4)];
        let err = validate_offsets(&offsets, 4).unwrap_err();
        assert!(matches!(err, BridgeError::NonContiguousOffsets { index: 1 }));
    }

    #[test]
    fn empty_range_is_rejected() {
        // Every document contributes at least one chunk.
        let offsets = [ChunkOffset::new(0, 0)];
        assert!(validate_offsets(&offsets, 0).is_err());
    }

    #[test]
    fn total_must_match_partials() {
        let offsets = [ChunkOffset::new(0, 2)];
        let err = validate_offsets(&offsets, 3).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::OffsetMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn fewshot_renders_input_output_pairs() {
        let examples = vec![FewshotExample {
            input: "great product".into(),
            output: serde_json::json!({"label": "positive"}),
        }];
        let rendered = render_fewshot(&examples);
        assert!(rendered.contains("Input: great product"));
        assert!(rendered.contains("\"label\":\"positive\""));
    }

    #[test]
    fn no_fewshot_renders_empty() {
        assert_eq!(render_fewshot(&[]), "");
    }
}
