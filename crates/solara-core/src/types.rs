use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content type of an inbound message as normalised by the webhook gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Document,
}

impl MessageKind {
    pub fn is_media(&self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Text => write!(f, "text"),
            MessageKind::Image => write!(f, "image"),
            MessageKind::Audio => write!(f, "audio"),
            MessageKind::Document => write!(f, "document"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "audio" => Ok(MessageKind::Audio),
            "document" => Ok(MessageKind::Document),
            other => Err(format!("unknown message kind: {}", other)),
        }
    }
}

/// A single inbound chat message, normalised before it reaches the pipeline.
///
/// `id` is assigned by the gateway per delivery attempt; a redelivery of the
/// same event carries the same id. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    /// Sender address (phone number for WhatsApp-style gateways).
    pub conversation_key: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub media_ref: Option<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Plain text message received now. Mostly useful in tests and tooling.
    pub fn text(
        id: impl Into<String>,
        conversation_key: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_key: conversation_key.into(),
            kind: MessageKind::Text,
            text: text.into(),
            media_ref: None,
            received_at: Utc::now(),
        }
    }

    /// Attach a media reference and switch the kind accordingly.
    pub fn with_media(mut self, kind: MessageKind, media_ref: impl Into<String>) -> Self {
        self.kind = kind;
        self.media_ref = Some(media_ref.into());
        self
    }
}
