use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Runtime constants — part of the wire/scheduling contract
pub const DEFAULT_PORT: u16 = 18920;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10; // drop rooms that never configure
pub const LLM_TIMEOUT_SECS: u64 = 120;
pub const TOOL_TIMEOUT_SECS: u64 = 30;
pub const TTS_TIMEOUT_SECS: u64 = 30;
pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024; // 256 KB hard cap per frame

/// Top-level config (parlance.toml + PARLANCE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ParlanceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub asr: AsrConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub actor: ActorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Explicit CORS allow-list. A literal "*" entry is rejected at load
    /// time when `cors_credentials` is set.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub cors_credentials: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_bind(),
            port: default_port(),
            cors_origins: Vec::new(),
            cors_credentials: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Streaming chat backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    #[serde(default = "default_asr_url")]
    pub url: String,
    #[serde(default = "default_asr_model")]
    pub model: String,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            url: default_asr_url(),
            model: default_asr_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_url")]
    pub url: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            model: default_tts_model(),
            voice: default_tts_voice(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
        }
    }
}

/// Replay buffer sizing. `floor_warn` is the remaining-headroom level at
/// which the actor logs that old envelopes are about to be evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default = "default_replay_capacity")]
    pub capacity: usize,
    #[serde(default = "default_floor_warn")]
    pub floor_warn: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: default_replay_capacity(),
            floor_warn: default_floor_warn(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_seconds: u64,
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            idle_ttl_seconds: default_idle_ttl(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.parlance/parlance.db", home)
}
fn default_llm_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_llm_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_temperature() -> f32 {
    1.0
}
fn default_asr_url() -> String {
    "http://localhost:9000".to_string()
}
fn default_asr_model() -> String {
    "whisper-small".to_string()
}
fn default_tts_url() -> String {
    "http://localhost:9100".to_string()
}
fn default_tts_model() -> String {
    "kokoro".to_string()
}
fn default_tts_voice() -> String {
    "af_heart".to_string()
}
fn default_embedding_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_replay_capacity() -> usize {
    256
}
fn default_floor_warn() -> usize {
    64
}
fn default_idle_ttl() -> u64 {
    300
}
fn default_inbox_capacity() -> usize {
    256
}

impl ParlanceConfig {
    /// Load config from a TOML file with PARLANCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.parlance/parlance.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ParlanceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PARLANCE_").split("_"))
            .extract()
            .map_err(|e| crate::error::ParlanceError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be served safely.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.server.cors_credentials && self.server.cors_origins.iter().any(|o| o == "*") {
            return Err(crate::error::ParlanceError::Config(
                "wildcard CORS origin is forbidden when credentials are enabled".to_string(),
            ));
        }
        if self.replay.capacity == 0 {
            return Err(crate::error::ParlanceError::Config(
                "replay.capacity must be at least 1".to_string(),
            ));
        }
        if self.actor.inbox_capacity == 0 {
            return Err(crate::error::ParlanceError::Config(
                "actor.inbox_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.parlance/parlance.toml", home)
}
