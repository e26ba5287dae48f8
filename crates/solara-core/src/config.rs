use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_DEBOUNCE_MS: u64 = 10_000;
pub const DEFAULT_MAX_BUFFERED_MESSAGES: usize = 10;
pub const DEFAULT_IDEMPOTENCY_CAPACITY: usize = 10_000;
pub const MAX_WEBHOOK_BODY_BYTES: usize = 256 * 1024;

/// Top-level config (solara.toml + SOLARA_* env overrides).
///
/// Nested keys are separated by a double underscore in the environment, e.g.
/// `SOLARA_BUFFER__TIMEOUT_MS=3000`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolaraConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file backing conversation identities. `None` keeps identities
    /// in process memory (single-instance deployments and local testing).
    #[serde(default = "default_db_path")]
    pub path: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Consolidation buffer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// When false, every message is processed on arrival with no debounce.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Quiet period after the last message before a batch is flushed.
    #[serde(default = "default_debounce_ms")]
    pub timeout_ms: u64,
    /// Flush immediately once this many messages are pending for one key.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: DEFAULT_DEBOUNCE_MS,
            max_messages: DEFAULT_MAX_BUFFERED_MESSAGES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Maximum number of message ids remembered for redelivery detection.
    #[serde(default = "default_idempotency_capacity")]
    pub capacity: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_IDEMPOTENCY_CAPACITY,
        }
    }
}

/// Retry schedule for conversation identity resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Pacing knobs for splitting a reply into several timed messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkConfig {
    #[serde(default = "default_max_words")]
    pub max_words_per_chunk: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars_per_chunk: usize,
    /// Probability (0.0–1.0) that two adjacent short chunks are sent together.
    #[serde(default = "default_join_probability")]
    pub join_probability: f64,
    /// Simulated typing speed used to derive the pause before each chunk.
    #[serde(default = "default_typing_wpm")]
    pub typing_wpm: u32,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms_chunk")]
    pub max_delay_ms: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_words_per_chunk: default_max_words(),
            max_chars_per_chunk: default_max_chars(),
            join_probability: default_join_probability(),
            typing_wpm: default_typing_wpm(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms_chunk(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressConfig {
    #[serde(default)]
    pub chunking: ChunkConfig,
    /// Sent when the downstream processing stage fails, so the user is not
    /// left without an answer.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkConfig::default(),
            fallback_reply: default_fallback_reply(),
        }
    }
}

/// User-issued commands intercepted before buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Messages whose trimmed, lowercased text equals one of these discard the
    /// conversation's pending buffer.
    #[serde(default = "default_reset_commands")]
    pub reset: Vec<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            reset: default_reset_commands(),
        }
    }
}

/// Where consolidated batches are posted for processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub url: Option<String>,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

/// Where outbound chunks are posted for delivery. Unset = log only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

/// Authentication mode for an incoming webhook source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookAuthMode {
    /// HMAC-SHA256 over the raw request body (`X-Hub-Signature-256: sha256=<hex>`).
    HmacSha256,
    /// Static bearer token in the Authorization header.
    BearerToken,
    /// No authentication; use only for internal/trusted networks.
    None,
}

/// Configuration for a single webhook source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSourceConfig {
    /// Identifier used in the route, e.g. "whatsapp" → POST /webhooks/whatsapp.
    pub name: String,
    /// HMAC signing secret or bearer token value.
    pub secret: Option<String>,
    pub auth_mode: WebhookAuthMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhooksConfig {
    /// When false the /webhooks/{source} route returns 404.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<WebhookSourceConfig>,
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> Option<String> {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Some(format!("{}/.solara/solara.db", home))
}
fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}
fn default_max_messages() -> usize {
    DEFAULT_MAX_BUFFERED_MESSAGES
}
fn default_idempotency_capacity() -> usize {
    DEFAULT_IDEMPOTENCY_CAPACITY
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    2_000
}
fn default_max_words() -> usize {
    40
}
fn default_max_chars() -> usize {
    280
}
fn default_join_probability() -> f64 {
    0.35
}
fn default_typing_wpm() -> u32 {
    200
}
fn default_min_delay_ms() -> u64 {
    800
}
fn default_max_delay_ms_chunk() -> u64 {
    4_000
}
fn default_fallback_reply() -> String {
    "Desculpe, tive um problema para processar sua mensagem. Pode repetir em instantes?"
        .to_string()
}
fn default_reset_commands() -> Vec<String> {
    vec!["/reset".to_string(), "#reset".to_string()]
}
fn default_dispatch_timeout_ms() -> u64 {
    60_000
}

impl SolaraConfig {
    /// Load config from a TOML file with SOLARA_* env var overrides.
    ///
    /// Uses the explicit path when given, else `~/.solara/solara.toml`.
    /// A missing file is not an error; defaults and env vars still apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: SolaraConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SOLARA_").split("__"))
            .extract()
            .map_err(|e| crate::error::SolaraError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline misbehave at runtime.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::SolaraError;

        if self.buffer.max_messages == 0 {
            return Err(SolaraError::Config(
                "buffer.max_messages must be at least 1".to_string(),
            ));
        }
        if self.buffer.enabled && self.buffer.timeout_ms == 0 {
            return Err(SolaraError::Config(
                "buffer.timeout_ms must be positive while buffering is enabled".to_string(),
            ));
        }
        if self.dispatch.timeout_ms == 0 {
            return Err(SolaraError::Config(
                "dispatch.timeout_ms must be positive".to_string(),
            ));
        }
        if self.idempotency.capacity == 0 {
            return Err(SolaraError::Config(
                "idempotency.capacity must be at least 1".to_string(),
            ));
        }
        if self.identity.max_attempts == 0 {
            return Err(SolaraError::Config(
                "identity.max_attempts must be at least 1".to_string(),
            ));
        }
        let chunking = &self.egress.chunking;
        if !(0.0..=1.0).contains(&chunking.join_probability) {
            return Err(SolaraError::Config(format!(
                "egress.chunking.join_probability must be within 0..=1, got {}",
                chunking.join_probability
            )));
        }
        if chunking.max_words_per_chunk == 0 || chunking.max_chars_per_chunk == 0 {
            return Err(SolaraError::Config(
                "egress.chunking limits must be positive".to_string(),
            ));
        }
        if chunking.min_delay_ms > chunking.max_delay_ms {
            return Err(SolaraError::Config(
                "egress.chunking.min_delay_ms exceeds max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.solara/solara.toml", home)
}
