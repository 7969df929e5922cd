//! Configuration loading and defaults for codeloop.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{
    A2A_GENERIC, DEEPSEEK_CHAT, GPT_4O, GROQ_LLAMA_33_70B, ModelProvider, ModelRegistry,
    OPENROUTER_CLAUDE_37_SONNET,
};

pub const DEFAULT_MAX_STEPS: u32 = 100;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Agent roles that each carry their own active model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Coder,
    Summarizer,
}

impl AgentRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coder => "coder",
            Self::Summarizer => "summarizer",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "coder" => Some(Self::Coder),
            "summarizer" => Some(Self::Summarizer),
            _ => None,
        }
    }
}

// === Types ===

/// Per-role model settings as written in config files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

/// Per-family provider settings as written in config files.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// JSON-RPC endpoint for task-based families.
    pub endpoint: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub disabled: Option<bool>,
}

/// Resolved provider settings with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub family: ModelProvider,
    pub api_key: Option<String>,
    pub base_url: String,
    pub endpoint: Option<String>,
    pub poll_interval: Duration,
    pub disabled: bool,
}

/// Resolved model choice for one agent role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub model: String,
    pub max_tokens: Option<u32>,
}

/// Loaded configuration. Fields stay optional; accessors apply defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub working_dir: Option<String>,
    pub data_dir: Option<String>,
    pub auto_compact: Option<bool>,
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(flatten)]
    base: Config,
    profiles: Option<HashMap<String, Config>>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    pub fn load(path: Option<PathBuf>, profile: Option<&str>) -> Result<Self> {
        let path = path.or_else(default_config_path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                Self::from_toml(&contents, profile)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            _ => Config::default(),
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document, applying the named profile on top of the base.
    pub fn from_toml(contents: &str, profile: Option<&str>) -> Result<Self> {
        let parsed: ConfigFile = toml::from_str(contents)?;
        apply_profile(parsed, profile)
    }

    /// Reject unknown roles, families and models, and zero-valued limits.
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == Some(0) {
            anyhow::bail!("max_steps must be at least 1");
        }
        for (role, agent) in &self.agents {
            if AgentRole::parse(role).is_none() {
                anyhow::bail!("Unknown agent role '{role}': expected coder or summarizer.");
            }
            if let Some(model) = agent.model.as_deref()
                && !ModelRegistry::builtin().contains(model)
            {
                anyhow::bail!("Unknown model '{model}' for agent '{role}'.");
            }
        }
        for (family, provider) in &self.providers {
            if ModelProvider::parse(family).is_none() {
                anyhow::bail!("Unknown provider '{family}'.");
            }
            if let Some(key) = provider.api_key.as_deref()
                && key.trim().is_empty()
            {
                anyhow::bail!("providers.{family}.api_key cannot be empty string");
            }
            if provider.poll_interval_ms == Some(0) {
                anyhow::bail!("providers.{family}.poll_interval_ms must be positive");
            }
        }
        Ok(())
    }

    /// Workspace root for tools.
    #[must_use]
    pub fn working_dir(&self) -> PathBuf {
        self.working_dir
            .as_deref()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Directory holding persisted sessions.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .as_deref()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".codeloop")))
            .unwrap_or_else(|| PathBuf::from(".codeloop"))
    }

    #[must_use]
    pub fn auto_compact(&self) -> bool {
        self.auto_compact.unwrap_or(true)
    }

    #[must_use]
    pub fn max_steps(&self) -> u32 {
        self.max_steps.unwrap_or(DEFAULT_MAX_STEPS).max(1)
    }

    /// Model and token limit for a role. The summarizer falls back to the
    /// coder's model when unset.
    #[must_use]
    pub fn agent(&self, role: AgentRole) -> AgentSettings {
        let configured = self.agents.get(role.as_str());
        let model = configured
            .and_then(|agent| agent.model.clone())
            .or_else(|| match role {
                AgentRole::Coder => None,
                AgentRole::Summarizer => Some(self.agent(AgentRole::Coder).model),
            })
            .unwrap_or_else(|| self.default_model().to_string());
        AgentSettings {
            model,
            max_tokens: configured.and_then(|agent| agent.max_tokens),
        }
    }

    /// Settings for one provider family with default endpoints applied.
    #[must_use]
    pub fn provider(&self, family: ModelProvider) -> ProviderSettings {
        let configured = self.providers.get(family.as_str());
        ProviderSettings {
            family,
            api_key: configured.and_then(|p| p.api_key.clone()),
            base_url: configured
                .and_then(|p| p.base_url.clone())
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| default_base_url(family).to_string()),
            endpoint: configured.and_then(|p| p.endpoint.clone()),
            poll_interval: Duration::from_millis(
                configured
                    .and_then(|p| p.poll_interval_ms)
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            disabled: configured.and_then(|p| p.disabled).unwrap_or(false),
        }
    }

    /// Poll interval for the A2A family.
    #[must_use]
    pub fn a2a_poll_interval(&self) -> Duration {
        self.provider(ModelProvider::A2a).poll_interval
    }

    /// First model whose provider is usable, in a fixed preference order.
    fn default_model(&self) -> &'static str {
        let usable = |family: ModelProvider| {
            let settings = self.provider(family);
            !settings.disabled && (settings.api_key.is_some() || settings.endpoint.is_some())
        };
        [
            (ModelProvider::A2a, A2A_GENERIC),
            (ModelProvider::DeepSeek, DEEPSEEK_CHAT),
            (ModelProvider::OpenAi, GPT_4O),
            (ModelProvider::OpenRouter, OPENROUTER_CLAUDE_37_SONNET),
            (ModelProvider::Groq, GROQ_LLAMA_33_70B),
        ]
        .into_iter()
        .find(|(family, _)| usable(*family))
        .map_or(DEEPSEEK_CHAT, |(_, model)| model)
    }
}

// === Defaults ===

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".codeloop").join("config.toml"))
}

fn default_base_url(family: ModelProvider) -> &'static str {
    match family {
        ModelProvider::DeepSeek => "https://api.deepseek.com",
        ModelProvider::OpenAi => "https://api.openai.com",
        ModelProvider::OpenRouter => "https://openrouter.ai/api",
        ModelProvider::Groq => "https://api.groq.com/openai",
        ModelProvider::Ollama => "http://localhost:11434",
        ModelProvider::A2a => "http://localhost:8080",
        ModelProvider::Mock => "",
    }
}

// === Environment Overrides ===

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let key_vars = [
        ("DEEPSEEK_API_KEY", ModelProvider::DeepSeek),
        ("OPENAI_API_KEY", ModelProvider::OpenAi),
        ("OPENROUTER_API_KEY", ModelProvider::OpenRouter),
        ("GROQ_API_KEY", ModelProvider::Groq),
    ];
    for (var, family) in key_vars {
        if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
            config
                .providers
                .entry(family.as_str().to_string())
                .or_default()
                .api_key = Some(value);
        }
    }
    if let Some(value) = lookup("A2A_ENDPOINT").filter(|v| !v.trim().is_empty()) {
        config
            .providers
            .entry(ModelProvider::A2a.as_str().to_string())
            .or_default()
            .endpoint = Some(value);
    }
    if let Some(value) = lookup("CODELOOP_MODEL").filter(|v| !v.trim().is_empty()) {
        config
            .agents
            .entry(AgentRole::Coder.as_str().to_string())
            .or_default()
            .model = Some(value);
    }
}

fn apply_profile(config: ConfigFile, profile: Option<&str>) -> Result<Config> {
    let Some(profile_name) = profile else {
        return Ok(config.base);
    };
    let profiles = config.profiles.as_ref();
    match profiles.and_then(|profiles| profiles.get(profile_name)) {
        Some(override_cfg) => Ok(merge_config(config.base, override_cfg.clone())),
        None => {
            let available = profiles
                .map(|profiles| {
                    let mut keys = profiles.keys().cloned().collect::<Vec<_>>();
                    keys.sort();
                    if keys.is_empty() {
                        "none".to_string()
                    } else {
                        keys.join(", ")
                    }
                })
                .unwrap_or_else(|| "none".to_string());
            anyhow::bail!("Profile '{profile_name}' not found. Available profiles: {available}")
        }
    }
}

fn merge_config(base: Config, override_cfg: Config) -> Config {
    let mut agents = base.agents;
    agents.extend(override_cfg.agents);
    let mut providers = base.providers;
    providers.extend(override_cfg.providers);
    Config {
        working_dir: override_cfg.working_dir.or(base.working_dir),
        data_dir: override_cfg.data_dir.or(base.data_dir),
        auto_compact: override_cfg.auto_compact.or(base.auto_compact),
        max_steps: override_cfg.max_steps.or(base.max_steps),
        agents,
        providers,
    }
}

/// Create the parent directory of `path` if needed.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}
