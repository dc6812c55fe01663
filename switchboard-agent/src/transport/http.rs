// ABOUTME: HTTP control calls plus one long-lived SSE event stream for server-hosted agents.
// ABOUTME: No automatic retries; push events carry session ids instead of request ids.

use crate::error::{AgentError, Result};
use crate::timeout::timeout_duration;
use crate::transport::sse::SseDecoder;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

/// REST + SSE transport for an agent server
#[derive(Clone)]
pub struct HttpSseTransport {
    client: reqwest::Client,
    base_url: String,
    directory: Option<String>,
    request_timeout_ms: f64,
}

impl HttpSseTransport {
    pub fn new(base_url: &str, directory: Option<String>, request_timeout_ms: f64) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(AgentError::Config(format!(
                "base_url must be an http(s) URL, got {base_url:?}"
            )));
        }
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url,
            directory,
            request_timeout_ms,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `POST /session` returning the created session object
    pub async fn create_session(&self, body: Value) -> Result<Value> {
        let response = self.post("/session", &body, true).await?;
        Ok(response.json().await?)
    }

    /// `POST /session/{id}/message`; the turn's output arrives on the event stream
    pub async fn send_message(&self, session_id: &str, body: Value) -> Result<()> {
        self.post(&format!("/session/{session_id}/message"), &body, false)
            .await?;
        Ok(())
    }

    /// `POST /session/{id}/abort`
    pub async fn abort(&self, session_id: &str) -> Result<()> {
        self.post(&format!("/session/{session_id}/abort"), &Value::Null, true)
            .await?;
        Ok(())
    }

    /// `POST /session/{id}/permissions/{permission_id}` with `once`, `always` or `reject`
    pub async fn reply_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        response: &str,
    ) -> Result<()> {
        self.post(
            &format!("/session/{session_id}/permissions/{permission_id}"),
            &serde_json::json!({ "response": response }),
            true,
        )
        .await?;
        Ok(())
    }

    /// Open `GET /event` and decode it into JSON payloads.
    ///
    /// The stream ends when the server closes the connection or a read fails.
    pub async fn open_events(&self) -> Result<BoxStream<'static, Value>> {
        let url = format!("{}/event", self.base_url);
        tracing::debug!(%url, "Subscribing to event stream");

        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(directory) = &self.directory {
            request = request.query(&[("directory", directory)]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(AgentError::Http(format!(
                "event subscription failed: {}",
                response.status()
            )));
        }

        let bytes = response.bytes_stream();
        let events = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            futures::pin_mut!(bytes);
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for payload in decoder.push(&chunk) {
                            yield payload;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Event stream read failed");
                        break;
                    }
                }
            }
            tracing::debug!("Event stream ended");
        };
        Ok(events.boxed())
    }

    async fn post(&self, path: &str, body: &Value, timed: bool) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url);
        if let Some(directory) = &self.directory {
            request = request.query(&[("directory", directory)]);
        }
        if !body.is_null() {
            request = request.json(body);
        }
        if timed {
            if let Some(limit) = timeout_duration(self.request_timeout_ms) {
                request = request.timeout(limit);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Http(format!("POST {path} returned {status}: {body}")));
        }
        Ok(response)
    }
}
