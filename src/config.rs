//! Configuration structures and loading logic for the agent.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_PORT: u16 = 9010;
const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
const DEFAULT_CACHE_SNAPSHOT: &str = "med_data/prefetched-fhir-task1.json";

/// Server configuration section
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    // Optional name for the agent card, defaults to agent_id if not set
    pub agent_name: Option<String>,
}

/// LLM configuration section.
///
/// Two OpenAI-compatible backends are supported; the Nebius key is checked
/// first and the OpenAI key is the fallback. Unset model names fall back
/// to each backend's default identifier.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct LlmConfig {
    pub nebius_api_key: Option<String>,
    pub nebius_model: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_model: Option<String>,
}

/// Local snapshot used when the live FHIR server is unreachable
#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_snapshot")]
    pub snapshot_path: String,
}

/// Top-level configuration for the agent
#[derive(Clone, Debug, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,

    // Path to the config file (for reference)
    #[serde(skip)]
    pub config_file_path: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_agent_id() -> String {
    format!("medrec-{}", Uuid::new_v4())
}

fn default_cache_snapshot() -> String {
    DEFAULT_CACHE_SNAPSHOT.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            agent_id: default_agent_id(),
            agent_name: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_cache_snapshot(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            llm: LlmConfig::default(),
            cache: CacheConfig::default(),
            config_file_path: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file, then apply environment
    /// variable overrides for unset credential fields.
    #[tracing::instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        debug!("Loading configuration from file.");
        let config_str = fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow!("Failed to read config file: {}", e))?;

        let mut config: AgentConfig = toml::from_str(&config_str)
            .map_err(|e| anyhow!("Failed to parse config file: {}", e))?;

        config.apply_env_overrides();
        config.config_file_path = Some(path.as_ref().display().to_string());

        debug!("Configuration loaded successfully from file.");
        Ok(config)
    }

    /// Fill unset credential fields from the environment. API keys are
    /// never logged.
    pub fn apply_env_overrides(&mut self) {
        if self.llm.nebius_api_key.is_none() {
            if let Ok(key) = std::env::var("NEBIUS_API_KEY") {
                info!("Using Nebius API key from environment variable.");
                self.llm.nebius_api_key = Some(key);
            }
        }
        if self.llm.nebius_model.is_none() {
            if let Ok(model) = std::env::var("NEBIUS_MODEL_NAME") {
                self.llm.nebius_model = Some(model);
            }
        }
        if self.llm.openai_api_key.is_none() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                info!("Using OpenAI API key from environment variable.");
                self.llm.openai_api_key = Some(key);
            }
        }
    }

    /// Display name for the agent card.
    pub fn display_name(&self) -> &str {
        self.server
            .agent_name
            .as_deref()
            .unwrap_or(&self.server.agent_id)
    }
}
