use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use solara_core::config::IdentityConfig;

/// Durable identity of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationIdentity {
    pub conversation_id: String,
    pub lead_id: String,
    pub conversation_key: String,
    /// True only for the caller whose insert created the record.
    pub is_newly_created: bool,
    pub created_at: DateTime<Utc>,
}

impl ConversationIdentity {
    /// Fresh ids for a key that has never been seen.
    pub fn new_for(conversation_key: &str) -> Self {
        Self {
            conversation_id: uuid::Uuid::now_v7().to_string(),
            lead_id: uuid::Uuid::now_v7().to_string(),
            conversation_key: conversation_key.to_string(),
            is_newly_created: true,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn existing(mut self) -> Self {
        self.is_newly_created = false;
        self
    }
}

/// Retry schedule applied to transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries including the first (minimum 1).
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): doubles from
    /// `base_delay_ms`, capped at `max_delay_ms`, without jitter.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&IdentityConfig::default())
    }
}

impl From<&IdentityConfig> for RetryPolicy {
    fn from(cfg: &IdentityConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay_ms: cfg.base_delay_ms,
            max_delay_ms: cfg.max_delay_ms,
        }
    }
}
