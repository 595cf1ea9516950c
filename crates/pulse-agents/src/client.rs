use std::time::{Duration, Instant};

use async_trait::async_trait;
use pulse_core::ids::{AgentId, SessionId};
use pulse_core::settings::AgentSettings;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("agent not found: {0}")]
    NotFound(String),
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("undecodable response: {0}")]
    Decode(String),
    /// The agent answered but reported failure.
    #[error("agent failed: {0}")]
    Rejected(String),
}

impl InvokeError {
    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 | 422 => Self::InvalidRequest(body),
            404 => Self::NotFound(body),
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::ServerError { .. } => "server_error",
            Self::Decode(_) => "decode_error",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// Body of `POST /invoke`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub message: String,
    pub agent_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl InvokeRequest {
    pub fn new(agent_id: impl Into<AgentId>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            agent_id: agent_id.into(),
            session_id: None,
        }
    }

    /// Tie the run to a session so its activity shows up on that stream.
    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}

/// A file an agent produced alongside its answer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFile {
    #[serde(default, alias = "filename")]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "content_type")]
    pub mime_type: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleOutputs {
    #[serde(default)]
    pub artifact_files: Vec<ArtifactFile>,
}

/// Response of `POST /invoke`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeOutcome {
    pub success: bool,
    #[serde(default)]
    pub response: Option<AgentResponse>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub module_outputs: Option<ModuleOutputs>,
}

impl InvokeOutcome {
    /// The agent's answer as display text: a string result verbatim, any
    /// other JSON pretty-printed.
    pub fn result_text(&self) -> Option<String> {
        match &self.response.as_ref()?.result {
            serde_json::Value::Null => None,
            serde_json::Value::String(text) => Some(text.clone()),
            other => serde_json::to_string_pretty(other).ok(),
        }
    }

    pub fn artifacts(&self) -> &[ArtifactFile] {
        self.module_outputs
            .as_ref()
            .map(|outputs| outputs.artifact_files.as_slice())
            .unwrap_or_default()
    }
}

/// One-shot request/response to a named agent.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// Succeeds only when the agent reports success.
    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome, InvokeError>;
}

/// [`AgentInvoker`] over the backend's HTTP API. Never retries.
#[derive(Clone, Debug)]
pub struct HttpAgentClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpAgentClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, InvokeError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()
            .map_err(|e| InvokeError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_settings(settings: &AgentSettings) -> Result<Self, InvokeError> {
        Self::new(
            settings.base_url.clone(),
            Duration::from_secs(settings.request_timeout_secs),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, err: reqwest::Error) -> InvokeError {
        if err.is_timeout() {
            InvokeError::Timeout(self.timeout)
        } else {
            InvokeError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentClient {
    #[instrument(
        skip_all,
        fields(agent_id = %request.agent_id, session_id = tracing::field::Empty)
    )]
    async fn invoke(&self, request: &InvokeRequest) -> Result<InvokeOutcome, InvokeError> {
        if let Some(session_id) = &request.session_id {
            tracing::Span::current().record("session_id", session_id.as_str());
        }
        let started = Instant::now();

        let resp = self
            .client
            .post(format!("{}/invoke", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            let err = InvokeError::from_status(status, body);
            warn!(status, reason = err.error_kind(), "agent invocation failed");
            return Err(err);
        }

        let body = resp.text().await.map_err(|e| self.map_send_error(e))?;
        let outcome: InvokeOutcome =
            serde_json::from_str(&body).map_err(|e| InvokeError::Decode(e.to_string()))?;

        if !outcome.success {
            let reason = outcome
                .error
                .clone()
                .unwrap_or_else(|| "agent reported failure".to_string());
            warn!(reason = %reason, "agent rejected invocation");
            return Err(InvokeError::Rejected(reason));
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            artifacts = outcome.artifacts().len(),
            "agent invocation complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpAgentClient {
        HttpAgentClient::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            InvokeError::from_status(400, "bad".into()),
            InvokeError::InvalidRequest(_)
        ));
        assert!(matches!(InvokeError::from_status(404, "gone".into()), InvokeError::NotFound(_)));
        assert!(matches!(
            InvokeError::from_status(503, "down".into()),
            InvokeError::ServerError { status: 503, .. }
        ));
        assert_eq!(InvokeError::from_status(418, "teapot".into()).error_kind(), "invalid_request");
    }

    #[test]
    fn request_wire_shape() {
        let request = InvokeRequest::new("seo-analyst", "Audit my homepage")
            .in_session(SessionId::from_raw("sess_1"));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "message": "Audit my homepage",
                "agent_id": "seo-analyst",
                "session_id": "sess_1"
            })
        );

        let bare = InvokeRequest::new("seo-analyst", "hi");
        assert!(serde_json::to_value(&bare).unwrap().get("session_id").is_none());
    }

    #[test]
    fn result_text_string_and_object() {
        let text: InvokeOutcome = serde_json::from_value(json!({
            "success": true,
            "response": {"result": "Here is your post"}
        }))
        .unwrap();
        assert_eq!(text.result_text().as_deref(), Some("Here is your post"));

        let object: InvokeOutcome = serde_json::from_value(json!({
            "success": true,
            "response": {"result": {"keywords": ["rust", "async"]}}
        }))
        .unwrap();
        let rendered = object.result_text().unwrap();
        assert!(rendered.contains("\"keywords\""));
        assert!(rendered.contains('\n'));

        let empty: InvokeOutcome = serde_json::from_value(json!({"success": true})).unwrap();
        assert!(empty.result_text().is_none());
        assert!(empty.artifacts().is_empty());
    }

    #[tokio::test]
    async fn invoke_posts_request_and_decodes_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .and(body_json(json!({
                "message": "Write a launch post",
                "agent_id": "content-writer",
                "session_id": "sess_abc"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "response": {"result": "Launch post draft"},
                "module_outputs": {"artifact_files": [
                    {"filename": "post.md", "path": "/out/post.md"}
                ]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = InvokeRequest::new("content-writer", "Write a launch post")
            .in_session(SessionId::from_raw("sess_abc"));
        let outcome = client_for(&server).invoke(&request).await.unwrap();

        assert_eq!(outcome.result_text().as_deref(), Some("Launch post draft"));
        assert_eq!(outcome.artifacts().len(), 1);
        assert_eq!(outcome.artifacts()[0].name.as_deref(), Some("post.md"));
    }

    #[tokio::test]
    async fn unsuccessful_outcome_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "model quota exhausted"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .invoke(&InvokeRequest::new("graphic-designer", "Banner"))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Rejected(ref msg) if msg == "model quota exhausted"));
    }

    #[tokio::test]
    async fn http_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .invoke(&InvokeRequest::new("seo-analyst", "Audit"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::ServerError { status: 502, ref body } if body == "bad gateway"
        ));
    }

    #[tokio::test]
    async fn garbage_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .invoke(&InvokeRequest::new("seo-analyst", "Audit"))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "decode_error");
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"success": true}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let client = HttpAgentClient::new(server.uri(), Duration::from_millis(200)).unwrap();
        let err = client
            .invoke(&InvokeRequest::new("content-writer", "Slow"))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout(d) if d == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_network_error() {
        let client = HttpAgentClient::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let err = client
            .invoke(&InvokeRequest::new("content-writer", "Hello"))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "network_error");
    }

    #[test]
    fn trailing_slash_trimmed() {
        let client = HttpAgentClient::new("http://agents.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://agents.local");
    }
}
