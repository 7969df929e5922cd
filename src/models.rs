//! Static model catalog and provider families.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONTEXT_WINDOW_TOKENS: u32 = 128_000;
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

pub const A2A_GENERIC: &str = "a2a.generic";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";
pub const GPT_4O: &str = "gpt-4o";
pub const GPT_4O_MINI: &str = "gpt-4o-mini";
pub const OLLAMA_LLAMA3: &str = "ollama.llama3";
pub const OPENROUTER_CLAUDE_37_SONNET: &str = "openrouter.claude-3.7-sonnet";
pub const GROQ_LLAMA_33_70B: &str = "groq.llama-3.3-70b";
pub const MOCK_MODEL: &str = "__mock";

/// Backend family a model is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    A2a,
    DeepSeek,
    Groq,
    Ollama,
    OpenAi,
    OpenRouter,
    #[serde(rename = "__mock")]
    Mock,
}

impl ModelProvider {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A2a => "a2a",
            Self::DeepSeek => "deepseek",
            Self::Groq => "groq",
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Mock => "__mock",
        }
    }

    /// Parse a provider identifier as written in config files.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "a2a" => Some(Self::A2a),
            "deepseek" => Some(Self::DeepSeek),
            "groq" => Some(Self::Groq),
            "ollama" => Some(Self::Ollama),
            "openai" => Some(Self::OpenAi),
            "openrouter" => Some(Self::OpenRouter),
            "__mock" | "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    /// UI ordering rank; lower is more popular.
    #[must_use]
    pub fn popularity(self) -> u32 {
        match self {
            Self::Ollama => 1,
            Self::OpenAi => 4,
            Self::Groq => 6,
            Self::OpenRouter => 7,
            Self::A2a => 11,
            Self::DeepSeek => 12,
            Self::Mock => u32::MAX,
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable model descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub provider: ModelProvider,
    /// Model string sent to the backend.
    pub api_model: String,
    pub cost_per_1m_in: f64,
    pub cost_per_1m_out: f64,
    pub cost_per_1m_in_cached: f64,
    pub cost_per_1m_out_cached: f64,
    pub context_window: u32,
    pub default_max_tokens: u32,
    pub can_reason: bool,
    pub supports_attachments: bool,
}

impl Model {
    fn new(id: &str, name: &str, provider: ModelProvider, api_model: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            provider,
            api_model: api_model.to_string(),
            cost_per_1m_in: 0.0,
            cost_per_1m_out: 0.0,
            cost_per_1m_in_cached: 0.0,
            cost_per_1m_out_cached: 0.0,
            context_window: DEFAULT_CONTEXT_WINDOW_TOKENS,
            default_max_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            can_reason: false,
            supports_attachments: false,
        }
    }

    fn costs(mut self, input: f64, output: f64, input_cached: f64, output_cached: f64) -> Self {
        self.cost_per_1m_in = input;
        self.cost_per_1m_out = output;
        self.cost_per_1m_in_cached = input_cached;
        self.cost_per_1m_out_cached = output_cached;
        self
    }

    fn window(mut self, context_window: u32, default_max_tokens: u32) -> Self {
        self.context_window = context_window;
        self.default_max_tokens = default_max_tokens;
        self
    }

    fn reasoning(mut self) -> Self {
        self.can_reason = true;
        self
    }

    fn attachments(mut self) -> Self {
        self.supports_attachments = true;
        self
    }

    /// A zero-cost model on the mock family, for tests and offline runs.
    #[must_use]
    pub fn mock() -> Self {
        Self::new(MOCK_MODEL, "Mock", ModelProvider::Mock, MOCK_MODEL).window(64_000, 1024)
    }
}

fn builtin_models() -> Vec<Model> {
    vec![
        Model::new(A2A_GENERIC, "A2A Generic", ModelProvider::A2a, A2A_GENERIC),
        Model::new(DEEPSEEK_CHAT, "DeepSeek Chat", ModelProvider::DeepSeek, "deepseek-chat")
            .costs(0.27, 1.10, 0.07, 0.0)
            .window(128_000, 8192),
        Model::new(
            DEEPSEEK_REASONER,
            "DeepSeek Reasoner",
            ModelProvider::DeepSeek,
            "deepseek-reasoner",
        )
        .costs(0.55, 2.19, 0.14, 0.0)
        .window(128_000, 8192)
        .reasoning(),
        Model::new(GPT_4O, "GPT 4o", ModelProvider::OpenAi, "gpt-4o")
            .costs(2.50, 10.0, 1.25, 0.0)
            .window(128_000, 4096)
            .attachments(),
        Model::new(GPT_4O_MINI, "GPT 4o mini", ModelProvider::OpenAi, "gpt-4o-mini")
            .costs(0.15, 0.60, 0.075, 0.0)
            .window(128_000, 4096)
            .attachments(),
        Model::new(OLLAMA_LLAMA3, "Ollama Llama 3", ModelProvider::Ollama, "llama3")
            .window(8192, 2048),
        Model::new(
            OPENROUTER_CLAUDE_37_SONNET,
            "OpenRouter: Claude 3.7 Sonnet",
            ModelProvider::OpenRouter,
            "anthropic/claude-3.7-sonnet",
        )
        .costs(3.0, 15.0, 0.30, 3.75)
        .window(200_000, 8192)
        .reasoning()
        .attachments(),
        Model::new(
            GROQ_LLAMA_33_70B,
            "Groq: Llama 3.3 70B",
            ModelProvider::Groq,
            "llama-3.3-70b-versatile",
        )
        .costs(0.59, 0.79, 0.0, 0.0)
        .window(128_000, 4096),
        Model::mock(),
    ]
}

/// Lookup table of known models keyed by identifier.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, Model>,
}

impl ModelRegistry {
    /// Registry containing the built-in catalog.
    #[must_use]
    pub fn builtin() -> &'static ModelRegistry {
        static REGISTRY: OnceLock<ModelRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| ModelRegistry::with_models(builtin_models()))
    }

    #[must_use]
    pub fn with_models(models: impl IntoIterator<Item = Model>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|model| (model.id.clone(), model))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Model> {
        self.models.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.models.contains_key(id)
    }

    /// All models ordered by provider popularity, then display name.
    #[must_use]
    pub fn list(&self) -> Vec<&Model> {
        let mut models: Vec<&Model> = self.models.values().collect();
        models.sort_by(|a, b| {
            a.provider
                .popularity()
                .cmp(&b.provider.popularity())
                .then_with(|| a.name.cmp(&b.name))
        });
        models
    }

    #[must_use]
    pub fn for_provider(&self, provider: ModelProvider) -> Vec<&Model> {
        self.list()
            .into_iter()
            .filter(|model| model.provider == provider)
            .collect()
    }
}
