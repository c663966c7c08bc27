//! Engine adapters.
//!
//! One call contract regardless of backend: given rendered requests and
//! generation settings, return per-item structured output or a failure
//! marker. Adapters own retries for transient backend errors; malformed
//! model output is downgraded to `None` per item unless strict mode asks
//! for a hard failure. Adapters never mutate caller-owned documents.

pub mod mock;
pub mod ollama;
pub mod openai;

pub use mock::MockEngine;
pub use ollama::OllamaEngine;
pub use openai::OpenAiEngine;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised by engine adapters.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Cannot connect to backend at {0}")]
    Connection(String),

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Backend returned status {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Failed to parse backend response envelope: {0}")]
    ResponseParsing(String),

    #[error("Model output failed schema validation in strict mode: {0}")]
    MalformedOutput(String),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

/// Engine family tag, declared by each adapter.
///
/// Tasks select their bridge from this tag at construction time: never by
/// runtime type inspection of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineFamily {
    /// Backend takes a rendered prompt; output shape is requested in the
    /// prompt itself (e.g. Ollama's JSON mode).
    Prompted,
    /// Backend accepts a schema-described request (e.g. chat completions
    /// with a JSON-schema response format).
    Schema,
}

/// One structured-generation request, rendered by a bridge for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// Expected output shape as a JSON schema. When present, adapters
    /// validate output structure against it (required keys).
    pub schema: Option<Value>,
}

/// Raw per-item engine output.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub text: String,
    pub latency_ms: u64,
}

/// Generation settings shared across all requests in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    /// If true, malformed model output raises `EngineError::MalformedOutput`
    /// instead of yielding a `None` item.
    pub strict: bool,
    /// Retries for transient failures (connect/timeout) before surfacing.
    pub max_retries: u32,
    pub temperature: Option<f64>,
    /// Raw backend kwargs forwarded verbatim into the request body.
    pub extra: serde_json::Map<String, Value>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            strict: false,
            max_retries: 2,
            temperature: None,
            extra: serde_json::Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine trait
// ---------------------------------------------------------------------------

/// Uniform wrapper around one structured-generation backend.
pub trait Engine: Send + Sync {
    /// Family tag driving bridge selection.
    fn family(&self) -> EngineFamily;

    /// Generate one output per request, in request order.
    ///
    /// `None` entries mark items whose output failed validation with strict
    /// mode off. Unrecoverable backend failures abort the whole batch.
    fn generate(
        &self,
        requests: &[GenerationRequest],
        settings: &GenerationSettings,
    ) -> Result<Vec<Option<RawOutput>>, EngineError>;
}

impl std::fmt::Debug for dyn Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Engine").finish_non_exhaustive()
    }
}

/// HTTP statuses worth another attempt: rate limiting and temporary
/// backend unavailability (Ollama answers 502/503 while a model loads).
/// Everything else is treated as a hard failure.
pub(crate) fn is_transient_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

// ---------------------------------------------------------------------------
// Output validation helpers
// ---------------------------------------------------------------------------

/// Extract a JSON object from raw model text.
///
/// Tries, in order: the whole text as JSON, a ```json fenced block, and the
/// outermost brace-delimited region. Returns `None` if nothing parses.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    // Fenced block, as emitted by chat-tuned models.
    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + 7..];
        if let Some(end) = body.find("```") {
            if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(body[..end].trim()) {
                return Some(v);
            }
        }
    }

    // Outermost braces as a last resort.
    let re = fallback_object_pattern();
    if let Some(m) = re.find(trimmed) {
        if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(m.as_str()) {
            return Some(v);
        }
    }

    None
}

fn fallback_object_pattern() -> &'static regex::Regex {
    use std::sync::OnceLock;
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"(?s)\{.*\}").expect("valid regex"))
}

/// Validate raw output text against a request's expected shape.
///
/// Structural check only: the text must contain a JSON object carrying every
/// key the schema lists as `required`. Returns `Ok(false)` for invalid
/// output in lenient mode; strict mode escalates to `MalformedOutput`.
pub(crate) fn validate_output(
    text: &str,
    schema: Option<&Value>,
    strict: bool,
) -> Result<bool, EngineError> {
    let Some(schema) = schema else {
        return Ok(true);
    };

    let valid = match extract_json_object(text) {
        None => false,
        Some(Value::Object(obj)) => schema
            .get("required")
            .and_then(Value::as_array)
            .map(|required| {
                required
                    .iter()
                    .filter_map(Value::as_str)
                    .all(|key| obj.contains_key(key))
            })
            .unwrap_or(true),
        Some(_) => false,
    };

    if !valid && strict {
        let preview: String = text.chars().take(120).collect();
        return Err(EngineError::MalformedOutput(preview));
    }
    Ok(valid)
}
