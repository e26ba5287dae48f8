//! HTTP implementations of the pipeline's outbound seams.
//!
//! `HttpDispatcher` hands each consolidated batch to the service that writes
//! the reply; `HttpChunkSink` hands each chunk to the messaging gateway.
//! Either can be left unconfigured, in which case the batch gets the fallback
//! reply and chunks are only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use solara_core::SolaraConfig;
use solara_egress::OutboundChunk;
use solara_pipeline::{
    ChunkSink, ConsolidatedBatch, DeliveryError, DispatchError, DispatchReply, Dispatcher,
};
use tracing::{debug, info, warn};

/// Per-chunk send timeout.
const SEND_TIMEOUT_MS: u64 = 15_000;

pub struct HttpDispatcher {
    client: reqwest::Client,
    url: String,
    timeout_ms: u64,
}

impl HttpDispatcher {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            client,
            url: url.into(),
            timeout_ms,
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, batch: &ConsolidatedBatch) -> Result<DispatchReply, DispatchError> {
        debug!(
            key = %batch.key(),
            batch_size = batch.messages.len(),
            url = %self.url,
            "dispatching batch"
        );

        let resp = self
            .client
            .post(&self.url)
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(batch)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout { ms: self.timeout_ms }
                } else {
                    DispatchError::Request(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Request(format!("HTTP {}: {}", status, body)));
        }

        resp.json::<DispatchReply>()
            .await
            .map_err(|e| DispatchError::InvalidReply(e.to_string()))
    }
}

/// Used when `dispatch.url` is unset: every batch gets the fallback reply.
pub struct UnconfiguredDispatcher;

#[async_trait]
impl Dispatcher for UnconfiguredDispatcher {
    async fn dispatch(&self, _batch: &ConsolidatedBatch) -> Result<DispatchReply, DispatchError> {
        Err(DispatchError::NotConfigured)
    }
}

pub struct HttpChunkSink {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpChunkSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl ChunkSink for HttpChunkSink {
    async fn send_chunk(&self, key: &str, chunk: &OutboundChunk) -> Result<(), DeliveryError> {
        let mut req = self
            .client
            .post(&self.url)
            .timeout(Duration::from_millis(SEND_TIMEOUT_MS))
            .json(&json!({ "to": key, "text": chunk.text }));
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout {
                    ms: SEND_TIMEOUT_MS,
                }
            } else {
                DeliveryError::SendFailed(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::SendFailed(format!(
                "HTTP {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Used when `delivery.url` is unset.
pub struct LogSink;

#[async_trait]
impl ChunkSink for LogSink {
    async fn send_chunk(&self, key: &str, chunk: &OutboundChunk) -> Result<(), DeliveryError> {
        info!(
            key,
            words = chunk.word_count,
            chars = chunk.char_count,
            text = %chunk.text,
            "outbound chunk (no delivery url configured)"
        );
        Ok(())
    }
}

pub fn build_dispatcher(config: &SolaraConfig, client: &reqwest::Client) -> Arc<dyn Dispatcher> {
    match config.dispatch.url {
        Some(ref url) => {
            info!(url = %url, timeout_ms = config.dispatch.timeout_ms, "HTTP dispatcher enabled");
            Arc::new(HttpDispatcher::new(
                client.clone(),
                url.clone(),
                config.dispatch.timeout_ms,
            ))
        }
        None => {
            warn!("dispatch.url not set, every batch will receive the fallback reply");
            Arc::new(UnconfiguredDispatcher)
        }
    }
}

pub fn build_sink(config: &SolaraConfig, client: &reqwest::Client) -> Arc<dyn ChunkSink> {
    match config.delivery.url {
        Some(ref url) => {
            info!(url = %url, "HTTP delivery enabled");
            Arc::new(HttpChunkSink::new(
                client.clone(),
                url.clone(),
                config.delivery.token.clone(),
            ))
        }
        None => {
            info!("delivery.url not set, outbound chunks are logged only");
            Arc::new(LogSink)
        }
    }
}
