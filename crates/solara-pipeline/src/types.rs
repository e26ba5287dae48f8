use serde::{Deserialize, Serialize};
use solara_core::types::InboundMessage;
use solara_identity::ConversationIdentity;

/// Everything the dispatcher needs to answer one burst of messages.
#[derive(Debug, Clone, Serialize)]
pub struct ConsolidatedBatch {
    pub identity: ConversationIdentity,
    /// In arrival order.
    pub messages: Vec<InboundMessage>,
    /// Message texts joined by newlines; media without a caption shows up as
    /// a `[kind]` marker.
    pub combined_text: String,
}

impl ConsolidatedBatch {
    pub fn new(identity: ConversationIdentity, messages: Vec<InboundMessage>) -> Self {
        let combined_text = messages
            .iter()
            .filter_map(render)
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            identity,
            messages,
            combined_text,
        }
    }

    pub fn key(&self) -> &str {
        &self.identity.conversation_key
    }
}

fn render(msg: &InboundMessage) -> Option<String> {
    let text = msg.text.trim();
    match (msg.kind.is_media(), text.is_empty()) {
        (false, true) => None,
        (false, false) => Some(text.to_string()),
        (true, true) => Some(format!("[{}]", msg.kind)),
        (true, false) => Some(format!("[{}] {}", msg.kind, text)),
    }
}

/// Dispatcher output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReply {
    /// Empty means the dispatcher chose not to answer.
    pub reply_text: String,
    #[serde(default)]
    pub hints: DeliveryHints,
}

impl DispatchReply {
    pub fn text(reply_text: impl Into<String>) -> Self {
        Self {
            reply_text: reply_text.into(),
            hints: DeliveryHints::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryHints {
    /// `false` sends the reply as a single message, e.g. for a formatted
    /// quote that must not be broken up.
    #[serde(default = "split_default")]
    pub split: bool,
}

fn split_default() -> bool {
    true
}

impl Default for DeliveryHints {
    fn default() -> Self {
        Self { split: true }
    }
}

/// Summary of one processed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessedBatch {
    pub conversation_id: String,
    pub is_new_conversation: bool,
    pub batch_size: usize,
    pub chunks_sent: usize,
    pub used_fallback: bool,
}

/// What `Pipeline::ingest` did with a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Redelivery of an id already seen; dropped.
    Duplicate,
    /// Queued; the batch will be processed when the key goes quiet.
    Buffered,
    /// Buffering is disabled and the message was processed on arrival.
    Processed(ProcessedBatch),
    /// A reset command discarded the conversation's pending messages.
    Reset { discarded: usize },
}
