use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Gates verbosity of logging (SPEC_FULL.md §6: `SERVER_ENVIRONMENT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerEnvironment {
    #[default]
    Development,
    Production,
}

impl std::str::FromStr for ServerEnvironment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(ServerEnvironment::Development),
            "production" | "prod" => Ok(ServerEnvironment::Production),
            other => Err(format!("unknown server environment: {other}")),
        }
    }
}

/// Connection details for the transit keystore (SPEC_FULL.md §4.A, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitConfig {
    #[serde(default = "default_vault_url")]
    pub vault_url: String,
    /// Read from `VAULT_TOKEN`; if absent, the client falls back to the token files
    /// listed in `token_file_paths`.
    pub vault_token: Option<String>,
    #[serde(default = "default_token_file_paths")]
    pub token_file_paths: Vec<String>,
    #[serde(default = "default_secret_cache_ttl_secs")]
    pub secret_cache_ttl_secs: u64,
    #[serde(default = "default_token_revalidate_secs")]
    pub token_revalidate_secs: u64,
}

fn default_vault_url() -> String {
    "http://vault:8200".to_string()
}

fn default_token_file_paths() -> Vec<String> {
    vec!["/vault-data/api.token".to_string(), "/tmp/vault-token".to_string()]
}

fn default_secret_cache_ttl_secs() -> u64 {
    60
}

fn default_token_revalidate_secs() -> u64 {
    300
}

impl Default for TransitConfig {
    fn default() -> Self {
        Self {
            vault_url: default_vault_url(),
            vault_token: None,
            token_file_paths: default_token_file_paths(),
            secret_cache_ttl_secs: default_secret_cache_ttl_secs(),
            token_revalidate_secs: default_token_revalidate_secs(),
        }
    }
}

/// One OpenAI-compatible vendor entry an operator can add without a new adapter impl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatEntry {
    pub id: String,
    pub base_url: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    pub default_model: String,
    /// Name of the secret (fetched via the transit client) holding the API key.
    pub api_key_secret: String,
}

fn default_chat_path() -> String {
    "/v1/chat/completions".to_string()
}

/// Provider timeouts and retry policy (SPEC_FULL.md §4.B, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai_compat: Vec<OpenAiCompatEntry>,
    #[serde(default = "default_chat_timeout_secs")]
    pub chat_timeout_secs: u64,
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    #[serde(default = "default_transient_max_attempts")]
    pub transient_max_attempts: u32,
    #[serde(default = "default_transient_backoff_cap_secs")]
    pub transient_backoff_cap_secs: u64,
}

fn default_chat_timeout_secs() -> u64 {
    120
}

fn default_stream_timeout_secs() -> u64 {
    180
}

fn default_transient_max_attempts() -> u32 {
    3
}

fn default_transient_backoff_cap_secs() -> u64 {
    15
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai_compat: Vec::new(),
            chat_timeout_secs: default_chat_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            transient_max_attempts: default_transient_max_attempts(),
            transient_backoff_cap_secs: default_transient_backoff_cap_secs(),
        }
    }
}

/// Pipeline-wide knobs (SPEC_FULL.md §4.D/F/G/H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Open question in SPEC_FULL.md §9: kept configurable rather than hardcoded.
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: usize,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default = "default_preprocess_timeout_secs")]
    pub preprocess_timeout_secs: u64,
    #[serde(default = "default_main_stream_timeout_secs")]
    pub main_stream_timeout_secs: u64,
    #[serde(default = "default_postprocess_timeout_secs")]
    pub postprocess_timeout_secs: u64,
    #[serde(default = "default_task_wall_clock_secs")]
    pub task_wall_clock_secs: u64,
}

fn default_history_token_budget() -> usize {
    120_000
}

fn default_max_tool_rounds() -> u32 {
    4
}

fn default_preprocess_timeout_secs() -> u64 {
    30
}

fn default_main_stream_timeout_secs() -> u64 {
    180
}

fn default_postprocess_timeout_secs() -> u64 {
    30
}

fn default_task_wall_clock_secs() -> u64 {
    480
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_token_budget: default_history_token_budget(),
            max_tool_rounds: default_max_tool_rounds(),
            preprocess_timeout_secs: default_preprocess_timeout_secs(),
            main_stream_timeout_secs: default_main_stream_timeout_secs(),
            postprocess_timeout_secs: default_postprocess_timeout_secs(),
            task_wall_clock_secs: default_task_wall_clock_secs(),
        }
    }
}

/// Skill registry/dispatcher knobs (SPEC_FULL.md §4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default = "default_manifest_root")]
    pub manifest_root: String,
    #[serde(default = "default_skill_timeout_secs")]
    pub default_skill_timeout_secs: u64,
    #[serde(default = "default_inline_concurrency")]
    pub inline_concurrency: usize,
    #[serde(default = "default_queued_deadline_secs")]
    pub queued_deadline_secs: u64,
}

fn default_manifest_root() -> String {
    "apps".to_string()
}

fn default_skill_timeout_secs() -> u64 {
    60
}

fn default_inline_concurrency() -> usize {
    4
}

fn default_queued_deadline_secs() -> u64 {
    120
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            manifest_root: default_manifest_root(),
            default_skill_timeout_secs: default_skill_timeout_secs(),
            inline_concurrency: default_inline_concurrency(),
            queued_deadline_secs: default_queued_deadline_secs(),
        }
    }
}

/// Root configuration tree, loaded from a TOML file with `OPENMATES_`-prefixed env
/// overrides, mirroring the teacher's figment setup (`skynet-core/src/config.rs`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OpenMatesConfig {
    #[serde(default)]
    pub environment: ServerEnvironment,
    #[serde(default)]
    pub transit: TransitConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
}

impl OpenMatesConfig {
    /// Load from an optional TOML file plus `OPENMATES_`-prefixed environment
    /// variables (`OPENMATES_TRANSIT_VAULT_URL`, etc.), falling back to defaults
    /// when neither is present.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("openmates.toml").nested());

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path).nested());
        }

        figment = figment.merge(Env::prefixed("OPENMATES_").split("_"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| CoreError::Config(format!("failed to load configuration: {e}")))?;

        if config.transit.vault_token.is_none() {
            if let Ok(token) = std::env::var("VAULT_TOKEN") {
                config.transit.vault_token = Some(token);
            }
        }
        if let Ok(url) = std::env::var("VAULT_URL") {
            config.transit.vault_url = url;
        }
        if let Ok(env) = std::env::var("SERVER_ENVIRONMENT") {
            config.environment = env
                .parse()
                .map_err(|e: String| CoreError::Config(e))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OpenMatesConfig::default();
        assert_eq!(config.pipeline.max_tool_rounds, 4);
        assert_eq!(config.pipeline.history_token_budget, 120_000);
        assert_eq!(config.providers.transient_max_attempts, 3);
    }

    #[test]
    fn server_environment_parses_case_insensitively() {
        assert_eq!("Production".parse::<ServerEnvironment>().unwrap(), ServerEnvironment::Production);
        assert_eq!("dev".parse::<ServerEnvironment>().unwrap(), ServerEnvironment::Development);
        assert!("bogus".parse::<ServerEnvironment>().is_err());
    }
}
