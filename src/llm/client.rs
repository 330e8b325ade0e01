//! Minimal Messages API client.

use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};

/// API version header value.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Sends single-turn prompts to a hosted model.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl AnthropicClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Sends `user` with the `system` prompt and returns the text reply.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String> {
        if self.config.api_key.is_empty() {
            return Err(Error::Config("ANTHROPIC_API_KEY is not set".to_string()));
        }

        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            system,
            messages: vec![Message {
                role: "user",
                content: user,
            }],
        };

        tracing::info!(model = %self.config.model, prompt_chars = user.len(), "calling reasoning service");

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Analysis(format!(
                "reasoning service returned {}: {}",
                status,
                detail.chars().take(500).collect::<String>()
            )));
        }

        let parsed: MessagesResponse = response.json().await?;
        let text: String = parsed
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect();

        tracing::info!(
            response_chars = text.len(),
            stop_reason = parsed.stop_reason.as_deref().unwrap_or("unknown"),
            "reasoning service replied"
        );

        if text.trim().is_empty() {
            return Err(Error::Analysis(
                "reasoning service returned an empty reply".to_string(),
            ));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn fake_api(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base_url: String, key: &str) -> AnthropicClient {
        AnthropicClient::new(LlmConfig {
            api_key: key.to_string(),
            base_url,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn sends_headers_and_joins_text_blocks() {
        let app = Router::new().route(
            "/v1/messages",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                assert_eq!(headers["x-api-key"], "test-key");
                assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
                assert_eq!(body["messages"][0]["role"], "user");
                assert_eq!(body["system"], "be brief");
                Json(json!({
                    "content": [
                        {"type": "text", "text": "hello "},
                        {"type": "tool_use", "id": "x", "name": "y", "input": {}},
                        {"type": "text", "text": "world"}
                    ],
                    "stop_reason": "end_turn"
                }))
            }),
        );
        let base = fake_api(app).await;

        let reply = client(base, "test-key")
            .complete("be brief", "hi")
            .await
            .unwrap();
        assert_eq!(reply, "hello world");
    }

    #[tokio::test]
    async fn error_status_is_analysis_error() {
        let app = Router::new().route(
            "/v1/messages",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "rate limited") }),
        );
        let base = fake_api(app).await;

        let err = client(base, "test-key")
            .complete("s", "u")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "analysis_error");
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn missing_key_fails_before_sending() {
        let err = client("http://127.0.0.1:1".into(), "")
            .complete("s", "u")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
