//! LLM adapter (`uses: llm`) for OpenAI-compatible chat completion APIs.
//!
//! Sends a single non-streaming request to `{endpoint}/chat/completions`.
//! Outputs `text`, `model` and `usage`. The API key is only exposed when
//! building the authorization header.

use std::time::Duration;

use petal_core::adapter::{Adapter, AdapterContext, AdapterError, Outputs, ResolvedStep};
use petal_types::step::{AdapterConfig, AdapterKind, LlmConfig};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use super::ADAPTER_VERSION;
use super::http::build_client;

#[derive(Debug, Clone)]
pub struct LlmAdapter {
    client: reqwest::Client,
}

impl LlmAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, PartialEq)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

fn chat_request(config: &LlmConfig) -> ChatRequest<'_> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = &config.system {
        messages.push(ChatMessage {
            role: "system",
            content: system,
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: &config.prompt,
    });
    ChatRequest {
        model: &config.model,
        messages,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    }
}

fn completions_url(endpoint: &str) -> String {
    format!("{}/chat/completions", endpoint.trim_end_matches('/'))
}

/// Map a completion body to step outputs.
fn parse_completion(body: &str, requested_model: &str) -> Result<Outputs, AdapterError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| AdapterError::Failed(format!("malformed completion response: {e}")))?;
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| AdapterError::Failed("completion response has no message content".to_string()))?;

    let mut outputs = Outputs::new();
    outputs.insert("text".to_string(), Value::String(text));
    outputs.insert(
        "model".to_string(),
        Value::String(response.model.unwrap_or_else(|| requested_model.to_string())),
    );
    outputs.insert("usage".to_string(), response.usage.unwrap_or(Value::Null));
    Ok(outputs)
}

impl Adapter for LlmAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Llm
    }

    fn version(&self) -> &str {
        ADAPTER_VERSION
    }

    async fn execute(&self, step: &ResolvedStep, ctx: &AdapterContext) -> Result<Outputs, AdapterError> {
        let AdapterConfig::Llm(config) = &step.config else {
            return Err(AdapterError::Invalid(format!("expected llm config, got {}", step.config.kind())));
        };

        let mut request = self
            .client
            .post(completions_url(&config.endpoint))
            .json(&chat_request(config));
        if let Some(key) = &config.api_key {
            let key = SecretString::from(key.clone());
            request = request.bearer_auth(key.expose_secret());
        }

        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|e| AdapterError::Failed(format!("completion request failed: {e}")))?;
            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| AdapterError::Failed(format!("failed to read completion body: {e}")))?;
            Ok::<_, AdapterError>((status, body))
        };
        let (status, body) = tokio::select! {
            result = exchange.instrument(ctx.span.clone()) => result?,
            _ = ctx.cancel.cancelled() => return Err(AdapterError::Cancelled),
        };

        if !status.is_success() {
            let tail: String = body.chars().take(200).collect();
            return Err(AdapterError::Failed(format!("completion API returned {status}: {tail}")));
        }
        let outputs = parse_completion(&body, &config.model)?;
        tracing::info!(model = %config.model, attempt = step.attempt, "llm step completed");
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> LlmConfig {
        LlmConfig {
            endpoint: "http://localhost:11434/v1/".to_string(),
            model: "llama3".to_string(),
            prompt: "Summarize".to_string(),
            system: Some("Be brief".to_string()),
            temperature: Some(0.0),
            max_tokens: None,
            api_key: None,
        }
    }

    #[test]
    fn test_request_body() {
        let c = config();
        let body = serde_json::to_value(chat_request(&c)).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "llama3",
                "messages": [
                    {"role": "system", "content": "Be brief"},
                    {"role": "user", "content": "Summarize"},
                ],
                "temperature": 0.0,
            })
        );
        assert_eq!(completions_url(&c.endpoint), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_parse_completion() {
        let body = r#"{"model":"llama3:8b","choices":[{"message":{"role":"assistant","content":"done"}}],"usage":{"total_tokens":12}}"#;
        let out = parse_completion(body, "llama3").unwrap();
        assert_eq!(out["text"], json!("done"));
        assert_eq!(out["model"], json!("llama3:8b"));
        assert_eq!(out["usage"]["total_tokens"], json!(12));
    }

    #[test]
    fn test_parse_completion_without_choices() {
        let err = parse_completion(r#"{"choices":[]}"#, "m").unwrap_err();
        assert!(matches!(err, AdapterError::Failed(_)));
        assert!(parse_completion("not json", "m").is_err());
    }
}
