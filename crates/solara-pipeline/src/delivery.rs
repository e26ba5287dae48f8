use std::time::Duration;

use async_trait::async_trait;
use solara_egress::{ChunkedReply, OutboundChunk};
use tracing::debug;

use crate::error::DeliveryError;

/// Outbound side of a channel: sends one chunk to a conversation.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send_chunk(&self, key: &str, chunk: &OutboundChunk) -> Result<(), DeliveryError>;
}

/// Send every chunk in order, sleeping each chunk's `delay_ms` first.
///
/// Stops at the first failed send. On error returns how many chunks were
/// delivered before it alongside the error.
pub async fn deliver_paced(
    sink: &dyn ChunkSink,
    key: &str,
    reply: &ChunkedReply,
) -> Result<usize, (usize, DeliveryError)> {
    let mut sent = 0;
    for chunk in reply.iter() {
        if chunk.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(chunk.delay_ms)).await;
        }
        sink.send_chunk(key, chunk).await.map_err(|e| (sent, e))?;
        sent += 1;
        debug!(key, index = sent, total = reply.total_chunks, "chunk delivered");
    }
    Ok(sent)
}
