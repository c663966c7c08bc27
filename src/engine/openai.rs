//! OpenAI-compatible engine adapter (Schema family).
//!
//! Drives any chat-completions endpoint supporting `response_format` with a
//! JSON schema (OpenAI, vLLM, llama.cpp server). The bridge supplies the
//! schema; this adapter only carries it on the wire and validates the
//! returned message content against it.

use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    is_transient_status, validate_output, Engine, EngineError, EngineFamily, GenerationRequest,
    GenerationSettings, RawOutput,
};

/// Chat-completions client for schema-described structured generation.
pub struct OpenAiEngine {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OpenAiEngine {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>, timeout_secs: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            client,
            timeout_secs,
        }
    }

    /// Adapter for api.openai.com, reading the key from `OPENAI_API_KEY`.
    pub fn from_env(model: &str) -> Result<Self, EngineError> {
        let key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| EngineError::Auth("OPENAI_API_KEY is not set".into()))?;
        Ok(Self::new("https://api.openai.com/v1", model, Some(key), 120))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, request: &GenerationRequest, settings: &GenerationSettings) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        let obj = body.as_object_mut().expect("body is an object");

        if let Some(schema) = &request.schema {
            obj.insert(
                "response_format".into(),
                json!({
                    "type": "json_schema",
                    "json_schema": {"name": "task_output", "schema": schema, "strict": true},
                }),
            );
        }
        if let Some(t) = settings.temperature {
            obj.insert("temperature".into(), json!(t));
        }
        for (k, v) in &settings.extra {
            obj.insert(k.clone(), v.clone());
        }

        body
    }

    fn generate_one(
        &self,
        request: &GenerationRequest,
        settings: &GenerationSettings,
    ) -> Result<String, EngineError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(request, settings);

        let mut last_err = None;
        for attempt in 0..=settings.max_retries {
            if attempt > 0 {
                tracing::debug!(attempt, "OpenAI: retrying after transient failure");
            }

            let mut builder = self.client.post(&url).json(&body);
            if let Some(key) = &self.api_key {
                builder = builder.bearer_auth(key);
            }

            match builder.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        let body = response.text().unwrap_or_default();
                        return Err(EngineError::Auth(body));
                    }
                    if !status.is_success() {
                        let code = status.as_u16();
                        let body = response.text().unwrap_or_default();
                        if is_transient_status(code) {
                            last_err = Some(EngineError::Backend { status: code, body });
                            continue;
                        }
                        return Err(EngineError::Backend { status: code, body });
                    }

                    let parsed: ChatResponse = response
                        .json()
                        .map_err(|e| EngineError::ResponseParsing(e.to_string()))?;
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| {
                            EngineError::ResponseParsing("response carried no choices".into())
                        })?;
                    return Ok(content);
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

impl Engine for OpenAiEngine {
    fn family(&self) -> EngineFamily {
        EngineFamily::Schema
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
                tracing::debug!(model = %self.model, "OpenAI: discarding malformed output");
                outputs.push(None);
            }
        }

        Ok(outputs)
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}
