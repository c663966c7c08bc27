//! Ollama engine adapter (Prompted family).
//!
//! Drives a local Ollama instance through `/api/generate`. Requests carrying
//! a schema set `format: "json"` so the model is constrained to JSON output;
//! structure is then validated against the schema's required keys.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::{
    is_transient_status, validate_output, Engine, EngineError, EngineFamily, GenerationRequest,
    GenerationSettings, RawOutput,
};

/// Ollama HTTP client for local structured generation.
pub struct OllamaEngine {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaEngine {
    /// Create an adapter pointing at an Ollama instance.
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            timeout_secs,
        }
    }

    /// Default Ollama instance at localhost:11434 with 5-minute timeout.
    pub fn default_local(model: &str) -> Self {
        Self::new("http://localhost:11434", model, 300)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Models available on the instance.
    pub fn list_models(&self) -> Result<Vec<String>, EngineError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self.client.get(&url).send().map_err(|e| {
            if e.is_connect() {
                EngineError::Connection(self.base_url.clone())
            } else {
                EngineError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(EngineError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TagsResponse = response
            .json()
            .map_err(|e| EngineError::ResponseParsing(e.to_string()))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    fn generate_one(
        &self,
        request: &GenerationRequest,
        settings: &GenerationSettings,
    ) -> Result<String, EngineError> {
        let url = format!("{}/api/generate", self.base_url);
        let mut options = serde_json::Map::new();
        if let Some(t) = settings.temperature {
            options.insert("temperature".into(), serde_json::json!(t));
        }
        for (k, v) in &settings.extra {
            options.insert(k.clone(), v.clone());
        }

        let body = GenerateRequest {
            model: &self.model,
            prompt: &request.prompt,
            system: request.system.as_deref().unwrap_or_default(),
            format: request.schema.as_ref().map(|_| "json"),
            stream: false,
            options,
        };

        let mut last_err = None;
        for attempt in 0..=settings.max_retries {
            if attempt > 0 {
                tracing::debug!(attempt, "Ollama: retrying after transient failure");
            }

            match self.client.post(&url).json(&body).send() {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        let code = status.as_u16();
                        let body = response.text().unwrap_or_default();
                        if is_transient_status(code) {
                            last_err = Some(EngineError::Backend { status: code, body });
                            continue;
                        }
                        return Err(EngineError::Backend { status: code, body });
                    }
                    let parsed: GenerateResponse = response
                        .json()
                        .map_err(|e| EngineError::ResponseParsing(e.to_string()))?;
                    return Ok(parsed.response);
                }
                Err(e) if e.is_connect() => {
                    last_err = Some(EngineError::Connection(self.base_url.clone()));
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(EngineError::Timeout {
                        secs: self.timeout_secs,
                    });
                }
                Err(e) => return Err(EngineError::Http(e.to_string())),
            }
        }

        Err(last_err.unwrap_or_else(|| EngineError::Http("request failed".into())))
    }
}

impl Engine for OllamaEngine {
    fn family(&self) -> EngineFamily {
        EngineFamily::Prompted
    }

    fn generate(
        &self,
        requests: &[GenerationRequest],
        settings: &GenerationSettings,
    ) -> Result<Vec<Option<RawOutput>>, EngineError> {
        let mut outputs = Vec::with_capacity(requests.len());

        for request in requests {
            let started = Instant::now();
            let text = self.generate_one(request, settings)?;
            let latency_ms = started.elapsed().as_millis() as u64;

            if validate_output(&text, request.schema.as_ref(), settings.strict)? {
                outputs.push(Some(RawOutput { text, latency_ms }));
            } else {
                tracing::debug!(model = %self.model, "Ollama: discarding malformed output");
                outputs.push(None);
            }
        }

        Ok(outputs)
    }
}

/// Request body for `/api/generate`.
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    stream: bool,
    options: serde_json::Map<String, serde_json::Value>,
}

/// Response body from `/api/generate`.
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Response body from `/api/tags`.
#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}
