//! Scripted provider for tests and offline runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::llm_client::{
    GenerateRequest, LlmClient, ProviderError, ProviderEvent, ProviderEventStream,
    ProviderResponse,
};
use crate::message::{Role, TokenUsage, ToolCall};

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum MockReply {
    Response(ProviderResponse),
    Error(ProviderError),
}

#[derive(Default)]
struct MockState {
    script: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<GenerateRequest>>,
}

/// Replays queued replies in order, then echoes the last user message.
#[derive(Clone, Default)]
pub struct MockClient {
    state: Arc<MockState>,
    delay: Duration,
}

impl std::fmt::Debug for MockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClient")
            .field("delay", &self.delay)
            .field("queued", &lock(&self.state.script).len())
            .finish()
    }
}

impl MockClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long before answering; cancellation cuts the wait short.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push(&self, reply: MockReply) -> &Self {
        lock(&self.state.script).push_back(reply);
        self
    }

    pub fn push_text(&self, text: &str) -> &Self {
        self.push(MockReply::Response(ProviderResponse::text(text)))
    }

    pub fn push_tool_call(&self, id: &str, name: &str, input: Value) -> &Self {
        self.push(MockReply::Response(ProviderResponse::text("").with_tool_calls(
            vec![ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
        )))
    }

    pub fn push_error(&self, error: ProviderError) -> &Self {
        self.push(MockReply::Error(error))
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<GenerateRequest> {
        lock(&self.state.requests).clone()
    }

    fn next_reply(&self, request: &GenerateRequest) -> MockReply {
        if let Some(reply) = lock(&self.state.script).pop_front() {
            return reply;
        }
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.text())
            .unwrap_or_default();
        let input_words: usize = request
            .messages
            .iter()
            .map(|message| message.text().split_whitespace().count())
            .sum();
        let output_words = last_user.split_whitespace().count();
        MockReply::Response(ProviderResponse::text(last_user).with_usage(TokenUsage::new(
            input_words as u64,
            output_words as u64,
        )))
    }
}

#[async_trait]
impl LlmClient for MockClient {
    fn provider_name(&self) -> &'static str {
        "__mock"
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        lock(&self.state.requests).push(request.clone());
        if !self.delay.is_zero() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                () = tokio::time::sleep(self.delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        match self.next_reply(&request) {
            MockReply::Response(response) => Ok(response),
            MockReply::Error(err) => Err(err),
        }
    }

    /// Streams content word by word, then completes.
    fn stream(&self, request: GenerateRequest, cancel: CancellationToken) -> ProviderEventStream
    where
        Self: Clone + Sized + 'static,
    {
        let client = self.clone();
        Box::pin(async_stream::stream! {
            let response = match client.generate(request, cancel).await {
                Ok(response) => response,
                Err(err) => {
                    yield ProviderEvent::Error(err);
                    return;
                }
            };
            for word in response.content.split_inclusive(' ') {
                yield ProviderEvent::ContentDelta(word.to_string());
            }
            for call in &response.tool_calls {
                yield ProviderEvent::ToolCallStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                };
            }
            yield ProviderEvent::Complete(response);
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::models::Model;
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;

    fn request(text: &str) -> GenerateRequest {
        GenerateRequest {
            model: Model::mock(),
            system_prompt: None,
            messages: vec![Message::user("s", text)],
            tools: Vec::new(),
            max_tokens: 100,
        }
    }

    #[tokio::test]
    async fn replays_script_then_echoes() {
        let client = MockClient::new();
        client
            .push_text("scripted")
            .push_error(ProviderError::Transport("reset".to_string()));

        let first = client
            .generate(request("hi"), CancellationToken::new())
            .await
            .expect("first");
        assert_eq!(first.content, "scripted");
        assert!(
            client
                .generate(request("hi"), CancellationToken::new())
                .await
                .is_err()
        );
        let echo = client
            .generate(request("hello there"), CancellationToken::new())
            .await
            .expect("echo");
        assert_eq!(echo.content, "hello there");
        assert_eq!(echo.usage, TokenUsage::new(2, 2));
        assert_eq!(client.requests().len(), 3);
    }

    #[tokio::test]
    async fn delay_honors_cancellation() {
        let client = MockClient::new().with_delay(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.generate(request("hi"), cancel).await;
        assert_eq!(result, Err(ProviderError::Cancelled));
    }

    #[tokio::test]
    async fn stream_emits_word_deltas_then_complete() {
        let client = MockClient::new();
        client.push_text("hello big world");
        let events: Vec<ProviderEvent> = client
            .stream(request("x"), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(
            events[..3].to_vec(),
            vec![
                ProviderEvent::ContentDelta("hello ".to_string()),
                ProviderEvent::ContentDelta("big ".to_string()),
                ProviderEvent::ContentDelta("world".to_string()),
            ]
        );
        assert!(matches!(events.last(), Some(ProviderEvent::Complete(_))));
    }
}
