//! OpenAI-compatible chat completion client.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::limiter::SharedRateLimiter;
use super::stats::CallStatsRegistry;
use crate::config::LlmConfig;
use crate::types::{Result, RuntimeError};

/// One chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub prompt: String,
    /// Overrides the client's default model when set.
    pub model: Option<String>,
    pub temperature: f32,
    /// Request a JSON-object result; the output is parsed and salvaged.
    pub json_mode: bool,
    pub system_prompt: Option<String>,
}

impl ChatRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.7,
            ..Self::default()
        }
    }

    pub fn json(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.7,
            json_mode: true,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }
}

/// Chat completion output: plain text, or a parsed object in JSON mode.
#[derive(Debug, Clone)]
pub enum ChatOutput {
    Text(String),
    Json(Value),
}

impl ChatOutput {
    pub fn into_text(self) -> Result<String> {
        match self {
            ChatOutput::Text(t) => Ok(t),
            ChatOutput::Json(v) => Ok(v.to_string()),
        }
    }

    pub fn into_json(self) -> Result<Value> {
        match self {
            ChatOutput::Json(v) => Ok(v),
            ChatOutput::Text(t) => Err(RuntimeError::ModelFormat(format!(
                "expected JSON output, got text: {}",
                crate::text::shorten_text(&t, 120)
            ))),
        }
    }
}

/// Seam for the components that issue chat calls; lets tests substitute a
/// scripted provider.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn call(&self, request: ChatRequest) -> Result<ChatOutput>;

    /// Default model used for scene annotation.
    fn annotate_model(&self) -> &str;
}

/// Chat client with retries, shared rate limiting, and JSON salvage.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    annotate_model: String,
    max_retries: u32,
    retry_delay: Duration,
    limiter: Arc<SharedRateLimiter>,
    stats: Arc<CallStatsRegistry>,
}

impl ChatClient {
    pub fn new(
        config: &LlmConfig,
        limiter: Arc<SharedRateLimiter>,
        stats: Arc<CallStatsRegistry>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RuntimeError::Internal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            annotate_model: config.annotate_model.clone(),
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            limiter,
            stats,
        })
    }

    async fn send_once(&self, request: &ChatRequest, model: &str) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "temperature": request.temperature,
        });
        if request.json_mode {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RuntimeError::Upstream(format!("chat request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Upstream(format!(
                "chat API error ({status}): {error_text}"
            )));
        }

        let resp_json: Value = response
            .json()
            .await
            .map_err(|e| RuntimeError::Upstream(format!("failed to parse chat response: {e}")))?;

        let tokens = resp_json
            .pointer("/usage/total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.stats.record_chat(model, tokens);

        resp_json
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::Upstream("no content in chat response".to_string()))
    }
}

#[async_trait]
impl ChatProvider for ChatClient {
    async fn call(&self, request: ChatRequest) -> Result<ChatOutput> {
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());

        let mut last_err: Option<RuntimeError> = None;
        for attempt in 1..=self.max_retries {
            self.limiter.acquire().await;

            match self.send_once(&request, &model).await {
                Ok(content) => {
                    if !request.json_mode {
                        return Ok(ChatOutput::Text(content));
                    }
                    match serde_json::from_str::<Value>(&content) {
                        Ok(value) if value.is_object() => return Ok(ChatOutput::Json(value)),
                        _ => {
                            tracing::warn!(attempt, model = %model, "chat output is not a JSON object");
                            if attempt == self.max_retries {
                                return extract_json(&content)
                                    .map(ChatOutput::Json)
                                    .ok_or_else(|| {
                                        RuntimeError::ModelFormat(format!(
                                            "no JSON object found in output: {}",
                                            crate::text::shorten_text(&content, 200)
                                        ))
                                    });
                            }
                            last_err = Some(RuntimeError::ModelFormat(
                                "non-JSON output".to_string(),
                            ));
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(attempt, model = %model, error = %e, "chat call failed");
                    if attempt == self.max_retries {
                        return Err(e);
                    }
                    last_err = Some(e);
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| RuntimeError::Upstream("chat call failed".to_string())))
    }

    fn annotate_model(&self) -> &str {
        &self.annotate_model
    }
}

/// Salvage a JSON object from free-form model text: a fenced ```json block
/// first, then the widest balanced object.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(fenced) = extract_fenced_json(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&fenced) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    // Greedy slice between the first `{` and the last `}`.
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    // Last resort: the first balanced object, brace-counted outside strings.
    balanced_object(&text[start..]).and_then(|s| {
        serde_json::from_str::<Value>(s)
            .ok()
            .filter(Value::is_object)
    })
}

fn extract_fenced_json(text: &str) -> Option<String> {
    let open = text.find("```json")?;
    let rest = &text[open + "```json".len()..];
    let close = rest.find("```")?;
    Some(rest[..close].trim().to_string())
}

fn balanced_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_json_block() {
        let text = "解析结果如下:\n```json\n{\"scenes\": []}\n```\n完毕。";
        let value = extract_json(text).unwrap();
        assert!(value["scenes"].is_array());
    }

    #[test]
    fn extracts_bare_object_from_prose() {
        let text = "好的,这是结果 {\"characters\": [\"许七安\"]} 请查收";
        let value = extract_json(text).unwrap();
        assert_eq!(value["characters"][0], "许七安");
    }

    #[test]
    fn balanced_scan_survives_trailing_garbage() {
        let text = "{\"a\": {\"b\": \"}\"}} extra } garbage }";
        let value = extract_json(text).unwrap();
        assert_eq!(value["a"]["b"], "}");
    }

    #[test]
    fn no_object_yields_none() {
        assert!(extract_json("no json here at all").is_none());
        assert!(extract_json("[1, 2, 3]").is_none());
    }

    #[test]
    fn json_output_conversion() {
        let out = ChatOutput::Json(serde_json::json!({"k": 1}));
        assert_eq!(out.into_json().unwrap()["k"], 1);

        let text_out = ChatOutput::Text("plain".to_string());
        assert!(text_out.into_json().is_err());
    }
}
