use std::future::Future;
use std::time::Duration;

use reqwest::Client;

use super::error::AnthropicError;
use super::types::{MessagesRequest, MessagesResponse};

const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anything that can answer a Messages request. Lets the rewriter be tested
/// without a network.
pub trait MessageSender: Send + Sync {
    fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> impl Future<Output = Result<MessagesResponse, AnthropicError>> + Send;
}

pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (proxies, tests).
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self, AnthropicError> {
        if api_key.trim().is_empty() {
            return Err(AnthropicError::MissingApiKey);
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url,
        })
    }
}

impl MessageSender for AnthropicClient {
    async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(AnthropicError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if status.as_u16() == 529 {
            return Err(AnthropicError::Overloaded);
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AnthropicError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<MessagesResponse>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> MessagesRequest {
        MessagesRequest::single("claude-haiku-4-5", 256, None, "rewrite this".into())
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            AnthropicClient::new("  ".into()),
            Err(AnthropicError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn sends_key_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": "a gentle scene"}],
                "model": "claude-haiku-4-5",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 3, "output_tokens": 4}
            })))
            .mount(&server)
            .await;

        let client = AnthropicClient::with_base_url("sk-test".into(), server.uri()).unwrap();
        let resp = client.send_message(&request()).await.unwrap();
        assert_eq!(resp.text(), "a gentle scene");
    }

    #[tokio::test]
    async fn rate_limit_reads_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let client = AnthropicClient::with_base_url("sk-test".into(), server.uri()).unwrap();
        let err = client.send_message(&request()).await.unwrap_err();
        assert!(matches!(err, AnthropicError::RateLimited { retry_after_ms: 3000 }));
    }

    #[tokio::test]
    async fn overload_is_its_own_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = AnthropicClient::with_base_url("sk-test".into(), server.uri()).unwrap();
        let err = client.send_message(&request()).await.unwrap_err();
        assert!(matches!(err, AnthropicError::Overloaded));
    }

    #[tokio::test]
    async fn other_failures_keep_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid x-api-key"))
            .mount(&server)
            .await;

        let client = AnthropicClient::with_base_url("sk-bad".into(), server.uri()).unwrap();
        let err = client.send_message(&request()).await.unwrap_err();
        match err {
            AnthropicError::Api { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("invalid x-api-key"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
