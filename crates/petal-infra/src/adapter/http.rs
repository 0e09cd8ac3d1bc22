//! HTTP adapter (`uses: http`).
//!
//! One request per attempt. Outputs `status`, `headers`, `body` and, when the
//! body parses as JSON, `json`. A status of 400 or above fails the attempt.

use std::collections::BTreeMap;
use std::time::Duration;

use petal_core::adapter::{Adapter, AdapterContext, AdapterError, Outputs, ResolvedStep};
use petal_types::step::{AdapterConfig, AdapterKind, HttpConfig};
use serde_json::Value;
use tracing::Instrument;

use super::ADAPTER_VERSION;

const USER_AGENT: &str = concat!("petal/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct HttpAdapter {
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
        }
    }

    fn request(&self, config: &HttpConfig) -> Result<reqwest::RequestBuilder, AdapterError> {
        let method = reqwest::Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| AdapterError::Invalid(format!("invalid HTTP method: {}", config.method)))?;
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| AdapterError::Invalid(format!("invalid url '{}': {e}", config.url)))?;

        let mut request = self.client.request(method, url);
        for (key, value) in &config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        match (&config.json, &config.body) {
            (Some(json), _) => request = request.json(json),
            (None, Some(body)) => request = request.body(body.clone()),
            (None, None) => {}
        }
        Ok(request)
    }
}

/// Shared by the HTTP-based adapters. Falls back to a default client if the
/// configured one cannot be built.
pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build HTTP client, using defaults");
            reqwest::Client::new()
        })
}

impl Adapter for HttpAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Http
    }

    fn version(&self) -> &str {
        ADAPTER_VERSION
    }

    async fn execute(&self, step: &ResolvedStep, ctx: &AdapterContext) -> Result<Outputs, AdapterError> {
        let AdapterConfig::Http(config) = &step.config else {
            return Err(AdapterError::Invalid(format!("expected http config, got {}", step.config.kind())));
        };
        let request = self.request(config)?;

        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|e| AdapterError::Failed(format!("request to '{}' failed: {e}", config.url)))?;
            let status = response.status();
            let headers: BTreeMap<String, Value> = response
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), Value::from(v.to_str().unwrap_or("<binary>"))))
                .collect();
            let body = response
                .text()
                .await
                .map_err(|e| AdapterError::Failed(format!("failed to read response body: {e}")))?;
            Ok::<_, AdapterError>((status, headers, body))
        };

        let (status, headers, body) = tokio::select! {
            result = exchange.instrument(ctx.span.clone()) => result?,
            _ = ctx.cancel.cancelled() => return Err(AdapterError::Cancelled),
        };
        tracing::info!(url = %config.url, status = status.as_u16(), body_len = body.len(), "http step completed");

        if status.is_client_error() || status.is_server_error() {
            let tail: String = body.chars().take(200).collect();
            return Err(AdapterError::Failed(format!("{} returned {status}: {tail}", config.url)));
        }
        Ok(response_outputs(status.as_u16(), headers, body))
    }
}

fn response_outputs(status: u16, headers: BTreeMap<String, Value>, body: String) -> Outputs {
    let mut outputs = Outputs::new();
    outputs.insert("status".to_string(), Value::from(status));
    outputs.insert("headers".to_string(), Value::Object(headers.into_iter().collect()));
    if let Ok(json) = serde_json::from_str::<Value>(&body) {
        outputs.insert("json".to_string(), json);
    }
    outputs.insert("body".to_string(), Value::String(body));
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use petal_types::step::ResourceHints;
    use serde_json::json;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn step(config: Value) -> ResolvedStep {
        ResolvedStep {
            id: "fetch".to_string(),
            config: AdapterKind::Http.parse_config(&config).unwrap(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            resources: ResourceHints::default(),
            attempt: 1,
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::now_v7(),
            run_dir: PathBuf::from("."),
            env: BTreeMap::new(),
            cancel: CancellationToken::new(),
            span: tracing::Span::none(),
        }
    }

    /// Serve one canned response on a loopback port.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}/items")
    }

    #[tokio::test]
    async fn test_json_response() {
        let url = serve_once("200 OK", r#"{"count": 2}"#).await;
        let adapter = HttpAdapter::new(Duration::from_secs(5));
        let out = adapter.execute(&step(json!({"url": url})), &ctx()).await.unwrap();
        assert_eq!(out["status"], json!(200));
        assert_eq!(out["json"], json!({"count": 2}));
        assert_eq!(out["headers"]["content-type"], json!("application/json"));
    }

    #[tokio::test]
    async fn test_error_status_fails() {
        let url = serve_once("503 Service Unavailable", r#"{"error": "down"}"#).await;
        let adapter = HttpAdapter::new(Duration::from_secs(5));
        let err = adapter.execute(&step(json!({"url": url})), &ctx()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Failed(ref m) if m.contains("503")), "{err}");
    }

    #[test]
    fn test_invalid_method_and_url() {
        let adapter = HttpAdapter::new(Duration::from_secs(1));
        let bad_method = HttpConfig {
            method: "GE T".to_string(),
            url: "http://localhost/".to_string(),
            headers: BTreeMap::new(),
            body: None,
            json: None,
        };
        assert!(matches!(adapter.request(&bad_method), Err(AdapterError::Invalid(_))));
        let bad_url = HttpConfig {
            method: "post".to_string(),
            url: "not a url".to_string(),
            ..bad_method
        };
        assert!(matches!(adapter.request(&bad_url), Err(AdapterError::Invalid(_))));
    }

    #[test]
    fn test_plain_body_has_no_json_output() {
        let out = response_outputs(200, BTreeMap::new(), "hello".to_string());
        assert_eq!(out["body"], json!("hello"));
        assert!(!out.contains_key("json"));
    }
}
