//! Concrete provider families behind the [`LlmClient`] contract.

pub mod a2a;
pub mod mock;
pub mod openai;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::llm_client::{
    GenerateRequest, LlmClient, ProviderError, ProviderEventStream, ProviderResponse,
};
use crate::models::{Model, ModelProvider};

pub use a2a::A2aClient;
pub use mock::{MockClient, MockReply};
pub use openai::OpenAiClient;

/// Closed set of provider families, selected by the model's provider.
#[derive(Debug, Clone)]
pub enum ProviderClient {
    A2a(A2aClient),
    OpenAi(OpenAiClient),
    Mock(MockClient),
}

impl ProviderClient {
    /// Build the client that serves `model` with the configured settings.
    pub fn for_model(model: &Model, config: &Config) -> Result<Self, ProviderError> {
        let settings = config.provider(model.provider);
        if settings.disabled {
            return Err(ProviderError::Configuration(format!(
                "provider '{}' is disabled",
                model.provider
            )));
        }
        match model.provider {
            ModelProvider::A2a => Ok(Self::A2a(A2aClient::from_settings(&settings)?)),
            ModelProvider::DeepSeek
            | ModelProvider::Groq
            | ModelProvider::Ollama
            | ModelProvider::OpenAi
            | ModelProvider::OpenRouter => Ok(Self::OpenAi(OpenAiClient::new(&settings)?)),
            ModelProvider::Mock => Ok(Self::Mock(MockClient::new())),
        }
    }
}

impl From<MockClient> for ProviderClient {
    fn from(client: MockClient) -> Self {
        Self::Mock(client)
    }
}

impl From<A2aClient> for ProviderClient {
    fn from(client: A2aClient) -> Self {
        Self::A2a(client)
    }
}

#[async_trait]
impl LlmClient for ProviderClient {
    fn provider_name(&self) -> &'static str {
        match self {
            Self::A2a(client) => client.provider_name(),
            Self::OpenAi(client) => client.provider_name(),
            Self::Mock(client) => client.provider_name(),
        }
    }

    async fn generate(
        &self,
        request: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderResponse, ProviderError> {
        match self {
            Self::A2a(client) => client.generate(request, cancel).await,
            Self::OpenAi(client) => client.generate(request, cancel).await,
            Self::Mock(client) => client.generate(request, cancel).await,
        }
    }

    fn stream(&self, request: GenerateRequest, cancel: CancellationToken) -> ProviderEventStream
    where
        Self: Clone + Sized + 'static,
    {
        match self {
            Self::A2a(client) => client.stream(request, cancel),
            Self::OpenAi(client) => client.stream(request, cancel),
            Self::Mock(client) => client.stream(request, cancel),
        }
    }
}
