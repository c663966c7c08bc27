//! Mock engine for testing: scripted responses plus call accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{
    validate_output, Engine, EngineError, EngineFamily, GenerationRequest, GenerationSettings,
    RawOutput,
};

/// Mock engine returning scripted responses in round-robin order.
///
/// Counts batch calls and individual requests so tests can assert cache
/// idempotence ("second run never reaches the engine").
pub struct MockEngine {
    family: EngineFamily,
    responses: Vec<String>,
    cursor: Mutex<usize>,
    calls: AtomicUsize,
    requests_seen: AtomicUsize,
    fail_with: Mutex<Option<String>>,
}

impl MockEngine {
    /// Prompted-family mock cycling through `responses`.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            family: EngineFamily::Prompted,
            responses,
            cursor: Mutex::new(0),
            calls: AtomicUsize::new(0),
            requests_seen: AtomicUsize::new(0),
            fail_with: Mutex::new(None),
        }
    }

    /// Same responses, declared as the Schema family.
    pub fn schema_family(mut self) -> Self {
        self.family = EngineFamily::Schema;
        self
    }

    /// Make every subsequent `generate` call fail with a backend error.
    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().expect("mock lock poisoned") = Some(message.to_string());
    }

    /// Number of `generate` batch calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total individual requests seen across all calls.
    pub fn requests_seen(&self) -> usize {
        self.requests_seen.load(Ordering::SeqCst)
    }
}

impl Engine for MockEngine {
    fn family(&self) -> EngineFamily {
        self.family
    }

    fn generate(
        &self,
        requests: &[GenerationRequest],
        settings: &GenerationSettings,
    ) -> Result<Vec<Option<RawOutput>>, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests_seen.fetch_add(requests.len(), Ordering::SeqCst);

        if let Some(message) = self.fail_with.lock().expect("mock lock poisoned").clone() {
            return Err(EngineError::Backend {
                status: 500,
                body: message,
            });
        }

        let mut cursor = self.cursor.lock().expect("mock lock poisoned");
        let mut outputs = Vec::with_capacity(requests.len());
        for request in requests {
            let text = if self.responses.is_empty() {
                String::new()
            } else {
                let text = self.responses[*cursor % self.responses.len()].clone();
                *cursor += 1;
                text
            };

            if validate_output(&text, request.schema.as_ref(), settings.strict)? {
                outputs.push(Some(RawOutput {
                    text,
                    latency_ms: 1,
                }));
            } else {
                outputs.push(None);
            }
        }

        Ok(outputs)
    }
}
