//! Text-generation endpoint in the Hugging Face inference style.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use roomcheck_core::config::JudgeConfig;

use crate::request::{render_prompt, ReasoningRequest};
use crate::ReasoningBackend;

pub struct HttpReasoningBackend {
    client: reqwest::Client,
    url: String,
    api_token: Option<String>,
    max_new_tokens: u32,
    temperature: f32,
    id: String,
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    inputs: &'a str,
    parameters: GenerationParameters,
}

#[derive(Serialize)]
struct GenerationParameters {
    max_new_tokens: u32,
    temperature: f32,
    return_full_text: bool,
}

impl HttpReasoningBackend {
    pub fn new(config: &JudgeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building HTTP client")?;
        let api_token = config
            .api_token
            .clone()
            .or_else(|| std::env::var("HUGGINGFACE_API_TOKEN").ok())
            .filter(|t| !t.is_empty());
        Ok(Self {
            client,
            url: format!("{}/models/{}", config.endpoint.trim_end_matches('/'), config.model),
            api_token,
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            id: format!("hf:{}", config.model),
        })
    }
}

#[async_trait]
impl ReasoningBackend for HttpReasoningBackend {
    fn backend_id(&self) -> &str { &self.id }

    async fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        let prompt = render_prompt(request);
        let body = GenerationRequest {
            inputs: &prompt,
            parameters: GenerationParameters {
                max_new_tokens: self.max_new_tokens,
                temperature: self.temperature,
                return_full_text: false,
            },
        };
        let mut call = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.api_token {
            call = call.bearer_auth(token);
        }
        let response = call.send().await.with_context(|| format!("POST {}", self.url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("{} returned {status}: {text}", self.url);
        }
        let value: Value = response.json().await.context("reasoning backend sent invalid JSON")?;
        let text = generated_text(&value)?;
        debug!(backend = %self.id, chars = text.len(), "reasoning backend answered");
        Ok(text)
    }
}

/// Pull the completion out of `[{"generated_text"}]`, `{"generated_text"}` or `{"error"}`.
pub fn generated_text(value: &Value) -> Result<String> {
    let object = match value {
        Value::Array(items) => items.first().ok_or_else(|| anyhow!("empty generation list"))?,
        other => other,
    };
    if let Some(text) = object.get("generated_text").and_then(Value::as_str) {
        return Ok(text.to_string());
    }
    if let Some(err) = object.get("error") {
        bail!("reasoning backend error: {}", err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string()));
    }
    bail!("unexpected generation response shape")
}
