use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use solara_buffer::{
    BufferStatus, ConsolidationBuffer, FlushHandler, FlushOutcome, HandlerError, IdempotencyCache,
    Requeue,
};
use solara_core::config::{BufferConfig, ChunkConfig, SolaraConfig};
use solara_core::types::InboundMessage;
use solara_egress::{chunk, ChunkedReply, ResponseSanitizer};
use solara_identity::{
    ConversationIdentity, IdentityError, IdentityResolver, IdentityStore, RetryPolicy,
};
use tracing::{error, info, instrument, warn};

use crate::delivery::{deliver_paced, ChunkSink};
use crate::dispatch::Dispatcher;
use crate::error::{PipelineError, Result};
use crate::types::{ConsolidatedBatch, DeliveryHints, IngestOutcome, ProcessedBatch};

/// Construction-time settings, usually derived from [`SolaraConfig`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub buffer: BufferConfig,
    pub idempotency_capacity: usize,
    pub retry: RetryPolicy,
    pub chunking: ChunkConfig,
    pub fallback_reply: String,
    /// Compared against the trimmed, lowercased message text.
    pub reset_commands: Vec<String>,
}

impl From<&SolaraConfig> for PipelineConfig {
    fn from(cfg: &SolaraConfig) -> Self {
        Self {
            buffer: cfg.buffer.clone(),
            idempotency_capacity: cfg.idempotency.capacity,
            retry: RetryPolicy::from(&cfg.identity),
            chunking: cfg.egress.chunking.clone(),
            fallback_reply: cfg.egress.fallback_reply.clone(),
            reset_commands: cfg.commands.reset.clone(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&SolaraConfig::default())
    }
}

/// The message pipeline. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Pipeline {
    dedup: Arc<IdempotencyCache>,
    buffer: ConsolidationBuffer,
    processor: Arc<BatchProcessor>,
    reset_commands: Arc<Vec<String>>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn IdentityStore>,
        dispatcher: Arc<dyn Dispatcher>,
        sink: Arc<dyn ChunkSink>,
    ) -> Self {
        let processor = Arc::new(BatchProcessor {
            resolver: IdentityResolver::new(store, config.retry),
            dispatcher,
            sink,
            sanitizer: ResponseSanitizer::new(),
            chunking: config.chunking,
            fallback_reply: config.fallback_reply,
        });
        let buffer = ConsolidationBuffer::new(config.buffer, processor.clone());
        let reset_commands = config
            .reset_commands
            .iter()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect();

        Self {
            dedup: Arc::new(IdempotencyCache::new(config.idempotency_capacity)),
            buffer,
            processor,
            reset_commands: Arc::new(reset_commands),
        }
    }

    /// Entry point for every inbound message.
    ///
    /// Order: reject redeliveries, intercept reset commands, then buffer. When
    /// buffering is disabled the message is processed before this returns; if
    /// that fails with a retryable error the id is forgotten so the sender's
    /// retry of the same message is accepted.
    pub async fn ingest(&self, message: InboundMessage) -> Result<IngestOutcome> {
        if message.id.trim().is_empty() {
            return Err(PipelineError::InvalidMessage("missing message id".to_string()));
        }
        if message.conversation_key.trim().is_empty() {
            return Err(PipelineError::InvalidMessage(
                "missing conversation key".to_string(),
            ));
        }

        if !self.dedup.accept(&message.id) {
            info!(id = %message.id, key = %message.conversation_key, "duplicate delivery skipped");
            return Ok(IngestOutcome::Duplicate);
        }

        let key = message.conversation_key.clone();

        if self.is_reset_command(&message) {
            let discarded = self.buffer.clear(&key);
            info!(key = %key, discarded, "reset command received");
            return Ok(IngestOutcome::Reset { discarded });
        }

        if !self.buffer.is_enabled() {
            let id = message.id.clone();
            return match self.processor.process(&key, vec![message]).await {
                Ok(report) => Ok(IngestOutcome::Processed(report)),
                Err(e) => {
                    if e.is_retryable() {
                        self.dedup.forget(&id);
                    }
                    Err(e)
                }
            };
        }

        self.buffer.add(&key, message);
        Ok(IngestOutcome::Buffered)
    }

    fn is_reset_command(&self, message: &InboundMessage) -> bool {
        if message.kind.is_media() {
            return false;
        }
        let text = message.text.trim().to_lowercase();
        self.reset_commands.iter().any(|c| *c == text)
    }

    /// Process `key`'s pending messages now instead of waiting for the timer.
    pub async fn force_flush(&self, key: &str) -> Result<FlushOutcome> {
        Ok(self.buffer.flush(key).await?)
    }

    /// Drop `key`'s pending messages without processing them.
    pub fn clear_buffer(&self, key: &str) -> usize {
        self.buffer.clear(key)
    }

    pub fn buffer_status(&self, key: &str) -> BufferStatus {
        self.buffer.status(key)
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.buffer.active_keys()
    }

    /// Flush everything still buffered and wait up to `grace` for in-flight
    /// batches. Returns how many messages were flushed.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let keys = self.buffer.active_keys().len();
        info!(keys, "draining consolidation buffers");
        let flushed = self.buffer.flush_all(grace).await;
        info!(flushed, "consolidation buffers drained");
        flushed
    }
}

/// Turns a batch into delivered chunks. Registered as the buffer's handler
/// and also called directly when buffering is disabled.
struct BatchProcessor {
    resolver: IdentityResolver,
    dispatcher: Arc<dyn Dispatcher>,
    sink: Arc<dyn ChunkSink>,
    sanitizer: ResponseSanitizer,
    chunking: ChunkConfig,
    fallback_reply: String,
}

impl BatchProcessor {
    async fn process(&self, key: &str, messages: Vec<InboundMessage>) -> Result<ProcessedBatch> {
        let identity = self.identify(key, &messages).await?;
        self.respond(key, identity, messages).await
    }

    async fn identify(
        &self,
        key: &str,
        messages: &[InboundMessage],
    ) -> std::result::Result<ConversationIdentity, IdentityError> {
        self.resolver.get_or_create(key).await.inspect_err(|e| {
            let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            error!(key, error = %e, message_ids = ?ids, "cannot resolve conversation identity");
        })
    }

    #[instrument(skip_all, fields(key = %key, batch_size = messages.len()))]
    async fn respond(
        &self,
        key: &str,
        identity: ConversationIdentity,
        messages: Vec<InboundMessage>,
    ) -> Result<ProcessedBatch> {
        let batch_size = messages.len();
        let conversation_id = identity.conversation_id.clone();
        let is_new_conversation = identity.is_newly_created;
        let batch = ConsolidatedBatch::new(identity, messages);

        let (raw_reply, hints, mut used_fallback) = match self.dispatcher.dispatch(&batch).await {
            Ok(reply) => (reply.reply_text, reply.hints, false),
            Err(e) => {
                warn!(error = %e, "dispatch failed, sending fallback reply");
                (self.fallback_reply.clone(), DeliveryHints::default(), true)
            }
        };

        let mut text = self.scrub(key, &raw_reply);
        if text.is_empty() && !raw_reply.trim().is_empty() && !used_fallback {
            warn!("reply was entirely internal output, sending fallback reply");
            text = self.scrub(key, &self.fallback_reply);
            used_fallback = true;
        }

        let reply = if hints.split {
            chunk(&text, &self.chunking)
        } else {
            ChunkedReply::single(&text)
        };

        let chunks_sent = deliver_paced(self.sink.as_ref(), key, &reply)
            .await
            .map_err(|(sent, source)| {
                warn!(sent, total = reply.total_chunks, error = %source, "delivery interrupted");
                PipelineError::Delivery {
                    key: key.to_string(),
                    sent,
                    source,
                }
            })?;

        info!(chunks_sent, used_fallback, "batch processed");
        Ok(ProcessedBatch {
            conversation_id,
            is_new_conversation,
            batch_size,
            chunks_sent,
            used_fallback,
        })
    }

    /// Mandatory on every outbound path, fallback included.
    fn scrub(&self, key: &str, text: &str) -> String {
        let report = self.sanitizer.analyze(text);
        if report.has_leakage {
            warn!(
                key,
                match_count = report.match_count,
                leakage_score = report.leakage_score,
                categories = ?report.categories,
                "internal output removed from reply"
            );
        }
        self.sanitizer.sanitize(text)
    }
}

#[async_trait]
impl FlushHandler for BatchProcessor {
    async fn on_flush(
        &self,
        key: &str,
        batch: Vec<InboundMessage>,
    ) -> std::result::Result<(), HandlerError> {
        // The batch stays buffered until the store is reachable again.
        let identity = match self.identify(key, &batch).await {
            Ok(identity) => identity,
            Err(e) => return Err(Box::new(Requeue::new(batch, e.to_string()))),
        };
        self.respond(key, identity, batch).await?;
        Ok(())
    }
}
