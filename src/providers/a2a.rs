//! Agent-to-agent client over JSON-RPC 2.0.
//!
//! The remote agent exposes `task_create` and `task_get`; a response is
//! produced by creating a task from the latest message and polling it until
//! it completes or fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSettings;
use crate::llm_client::{GenerateRequest, LlmClient, ProviderError, ProviderResponse};
use crate::message::{ContentPart, Message};
use crate::poll::{PollStatus, poll_until};

const TASK_TITLE: &str = "Generate response";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl From<RpcError> for ProviderError {
    fn from(err: RpcError) -> Self {
        let message = match err.data {
            Some(data) if !data.is_null() => format!("{} ({data})", err.message),
            _ => err.message,
        };
        ProviderError::Backend {
            code: Some(err.code),
            message,
        }
    }
}

/// JSON-RPC task client.
#[derive(Debug, Clone)]
pub struct A2aClient {
    http_client: reqwest::Client,
    endpoint: String,
    poll_interval: Duration,
    next_id: Arc<AtomicU64>,
}

impl A2aClient {
    pub fn new(endpoint: impl Into<String>, poll_interval: Duration) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::Configuration(e.to_string()))?;
        Ok(Self {
            http_client,
            endpoint: endpoint.into(),
            poll_interval,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Build from resolved settings; `endpoint` falls back to `base_url`.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| settings.base_url.clone());
        Self::new(endpoint, settings.poll_interval)
    }

    /// One JSON-RPC round trip, abandoned as soon as `cancel` fires.
    async fn call(
        &self,
        method: &str,
        params: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ProviderError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };

        let exchange = async {
            let response = self
                .http_client
                .post(&self.endpoint)
                .json(&request)
                .send()
                .await?;
            let status = response.status();
            let body = response.bytes().await?;
            if !status.is_success() {
                return Err(ProviderError::Transport(format!(
                    "HTTP {status}: {}",
                    String::from_utf8_lossy(&body).trim()
                )));
            }
            Ok::<_, ProviderError>(body)
        };

        let body = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            body = exchange => body?,
        };

        let response: RpcResponse = serde_json::from_slice(&body).map_err(|e| {
            ProviderError::Protocol(format!("failed to decode jsonrpc response: {e}"))
        })?;
        if let Some(error) = response.error {
            return Err(error.into());
        }
        response
            .result
            .ok_or_else(|| ProviderError::Protocol(format!("{method} response has no result")))
    }

    async fn task_status(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PollStatus<String>, ProviderError> {
        let task = self
            .call("task_get", json!({ "task_id": task_id }), cancel)
            .await?;
        let Some(status) = task.get("status").and_then(Value::as_str) else {
            return Err(ProviderError::Protocol(format!(
                "unexpected status in task: {task}"
            )));
        };
        match status {
            "completed" => first_artifact_content(&task).map(PollStatus::Ready),
            "failed" => Err(ProviderError::backend(format!("task failed: {task}"))),
            other => {
                tracing::trace!(task_id, status = other, "task still running");
                Ok(PollStatus::Pending)
            }
        }
    }
}

fn first_artifact_content(task: &Value) -> Result<String, ProviderError> {
    let artifact = task
        .get("artifacts")
        .and_then(Value::as_array)
        .and_then(|artifacts| artifacts.first())
        .ok_or_else(|| ProviderError::Protocol(format!("no artifacts in completed task: {task}")))?;
    artifact
        .get("content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ProviderError::Protocol(format!("unexpected content format in artifact: {artifact}"))
        })
}

/// First text part of the last message.
fn task_description(messages: &[Message]) -> Option<String> {
    let last = messages.last()?;
    Some(
        last.parts
            .iter()
            .find_map(|part| match part {
                ContentPart::Text { text } => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_default(),
    )
}

#[async_trait]
impl LlmClient for A2aClient {
    fn provider_name(&self) -> &'static str {
        "a2a"
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        let description = task_description(&request.messages).ok_or_else(|| {
            ProviderError::Configuration("no messages to generate from".to_string())
        })?;

        let created = self
            .call(
                "task_create",
                json!({ "title": TASK_TITLE, "description": description }),
                &cancel,
            )
            .await?;
        let task_id = created
            .as_str()
            .ok_or_else(|| {
                ProviderError::Protocol(format!("unexpected result from task_create: {created}"))
            })?
            .to_string();
        tracing::debug!(task_id = %task_id, "a2a task created");

        let content = poll_until(self.poll_interval, &cancel, || {
            self.task_status(&task_id, &cancel)
        })
        .await?;
        Ok(ProviderResponse::text(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_uses_first_text_part_of_last_message() {
        let mut last = Message::user("s", "second");
        last.parts.insert(
            0,
            ContentPart::Attachment {
                path: "a.png".to_string(),
                mime_type: "image/png".to_string(),
            },
        );
        let messages = vec![Message::user("s", "first"), last];
        assert_eq!(task_description(&messages).as_deref(), Some("second"));
        assert_eq!(task_description(&[]), None);
    }

    #[test]
    fn rpc_error_becomes_backend_error() {
        let err: ProviderError = RpcError {
            code: -32000,
            message: "agent busy".to_string(),
            data: Some(json!({"retry": false})),
        }
        .into();
        assert_eq!(
            err,
            ProviderError::Backend {
                code: Some(-32000),
                message: "agent busy ({\"retry\":false})".to_string(),
            }
        );
    }

    #[test]
    fn completed_task_without_string_content_is_a_protocol_error() {
        let task = json!({"status": "completed", "artifacts": [{"content": 42}]});
        assert!(matches!(
            first_artifact_content(&task),
            Err(ProviderError::Protocol(_))
        ));
        let task = json!({"status": "completed", "artifacts": []});
        assert!(matches!(
            first_artifact_content(&task),
            Err(ProviderError::Protocol(_))
        ));
    }
}
