use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{AgentReply, AgentRequest, WorkerAgent};
use crate::error::AgentError;

/// Worker agent reachable over HTTP, e.g. a browser extension bridge that
/// owns one tab. Every request is a JSON `POST {base_url}/agent`.
///
/// No request timeout is set: generations can run for many minutes and the
/// scheduler and watchdog own the deadlines.
pub struct HttpWorkerAgent {
    client: Client,
    base_url: String,
}

impl HttpWorkerAgent {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl WorkerAgent for HttpWorkerAgent {
    async fn send(&self, request: AgentRequest) -> Result<AgentReply, AgentError> {
        let response = self
            .client
            .post(format!("{}/agent", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(AgentError::NotReady(
                response.text().await.unwrap_or_default(),
            ));
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AgentError::Status {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.json::<AgentReply>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentOutcome, ExecuteRequest};
    use crate::state_machine::{MediaKind, Platform};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ExecuteRequest {
        ExecuteRequest {
            prompt: "neon city".into(),
            media_kind: MediaKind::Video,
            platform: Platform::new("grok"),
            settings: serde_json::json!({"aspect": "16:9"}),
            source_media_ref: Some("img-3".into()),
        }
    }

    #[tokio::test]
    async fn execute_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent"))
            .and(body_partial_json(serde_json::json!({"type": "EXECUTE", "prompt": "neon city"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "COMPLETE",
                "media_ref": "blob:abc",
                "media_kind": "video"
            })))
            .mount(&server)
            .await;

        let agent = HttpWorkerAgent::new(format!("{}/", server.uri())).unwrap();
        let outcome = agent.execute(request()).await.unwrap();
        assert_eq!(
            outcome,
            AgentOutcome::Complete {
                media_ref: "blob:abc".into(),
                media_kind: MediaKind::Video
            }
        );
    }

    #[tokio::test]
    async fn agent_error_reply_is_an_outcome_not_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "ERROR",
                "message": "This prompt violates our content policy",
                "error_code": "POLICY"
            })))
            .mount(&server)
            .await;

        let agent = HttpWorkerAgent::new(server.uri()).unwrap();
        let outcome = agent.execute(request()).await.unwrap();
        assert!(matches!(outcome, AgentOutcome::Error { error_code: Some(c), .. } if c == "POLICY"));
    }

    #[tokio::test]
    async fn ping_returns_agent_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/agent"))
            .and(body_partial_json(serde_json::json!({"type": "PING"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"type": "OK", "agent_id": "tab-7"})),
            )
            .mount(&server)
            .await;

        let agent = HttpWorkerAgent::new(server.uri()).unwrap();
        assert_eq!(agent.ping().await.unwrap(), "tab-7");
    }

    #[tokio::test]
    async fn unavailable_means_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("no tab"))
            .mount(&server)
            .await;

        let agent = HttpWorkerAgent::new(server.uri()).unwrap();
        assert!(matches!(agent.ping().await, Err(AgentError::NotReady(m)) if m == "no tab"));
    }

    #[tokio::test]
    async fn server_error_maps_to_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("crash"))
            .mount(&server)
            .await;

        let agent = HttpWorkerAgent::new(server.uri()).unwrap();
        let err = agent.execute(request()).await.unwrap_err();
        assert!(matches!(err, AgentError::Status { status: 500, .. }));
    }
}
