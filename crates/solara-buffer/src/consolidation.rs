//! Debounce-based consolidation of bursts of inbound messages.
//!
//! Chat users often split one thought over several quick messages ("Oi",
//! "queria saber sobre energia solar", "quanto custa?"). Each conversation key
//! gets its own pending list and debounce timer; the batch is flushed to the
//! [`FlushHandler`] once the key has been quiet for `timeout_ms`, or at once
//! when `max_messages` are pending.
//!
//! Locking rules:
//! - state lives in a `DashMap`, so keys in different shards never contend;
//! - every read-modify-write of a key's entry happens inside one synchronous
//!   guard scope, never across an `.await`;
//! - the handler always runs in its own task with no guard held, so `add` for
//!   the same key keeps working and starts the next batch.
//!
//! The debounce resets on every arrival. A sender who keeps typing faster than
//! the window is never flushed by the timer alone, only by `max_messages`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use solara_core::config::BufferConfig;
use solara_core::types::InboundMessage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BufferError, Result};
use crate::handler::{FlushHandler, Requeue};
use crate::types::{BufferStatus, FlushOutcome};

/// Poll interval while `flush_all` waits for in-flight flushes to finish.
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Live debounce timer for one key. Dropping the handle does not stop the
/// timer; `cancel` does.
struct TimerHandle {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct BufferState {
    pending: Vec<InboundMessage>,
    timer: Option<TimerHandle>,
    flushing: bool,
}

impl BufferState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel.cancel();
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.flushing && self.timer.is_none()
    }

    /// Claim the pending batch for a flush: cancels the timer, marks the key
    /// as flushing and leaves an empty list behind. `None` when a flush is
    /// already running or there is nothing to send.
    fn take_for_flush(&mut self) -> Option<Vec<InboundMessage>> {
        if self.flushing || self.pending.is_empty() {
            return None;
        }
        self.cancel_timer();
        self.flushing = true;
        Some(std::mem::take(&mut self.pending))
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Timer,
    SizeLimit,
    Forced,
}

/// Per-conversation accumulator with a reset-on-arrival debounce timer.
///
/// Cheap to clone; clones share the same state and handler.
#[derive(Clone)]
pub struct ConsolidationBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    config: BufferConfig,
    handler: Arc<dyn FlushHandler>,
    states: DashMap<String, BufferState>,
    next_timer_id: AtomicU64,
}

impl ConsolidationBuffer {
    pub fn new(config: BufferConfig, handler: Arc<dyn FlushHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                states: DashMap::new(),
                next_timer_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.enabled
    }

    /// Append `message` to `key`'s pending batch and restart its debounce
    /// timer.
    ///
    /// Returns `false` without touching any state when buffering is disabled;
    /// the caller must then process the message itself. When the append makes
    /// the batch reach `max_messages`, the batch is claimed before this call
    /// returns and the handler runs in a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add(&self, key: &str, message: InboundMessage) -> bool {
        if !self.inner.config.enabled {
            return false;
        }

        let claimed = {
            let mut state = self.inner.states.entry(key.to_string()).or_default();
            state.pending.push(message);
            state.cancel_timer();

            if state.pending.len() >= self.inner.config.max_messages {
                debug!(key, size = state.pending.len(), "buffer reached max_messages");
                // While a flush is in flight this yields None; the in-flight
                // flush picks the batch up when it completes.
                state.take_for_flush()
            } else {
                state.timer = Some(self.inner.arm_timer(key));
                None
            }
        };

        if let Some(batch) = claimed {
            drop(self.inner.spawn_flush(key.to_string(), batch, Trigger::SizeLimit));
        }
        true
    }

    /// Cancel `key`'s timer and flush whatever is pending right now.
    ///
    /// A no-op returning [`FlushOutcome::AlreadyFlushing`] if a flush for the
    /// key is already running. The handler runs to completion even if the
    /// returned future is dropped.
    pub async fn flush(&self, key: &str) -> Result<FlushOutcome> {
        let claimed = {
            let Some(mut state) = self.inner.states.get_mut(key) else {
                return Ok(FlushOutcome::Empty);
            };
            if state.flushing {
                debug!(key, "flush requested while another is in flight");
                return Ok(FlushOutcome::AlreadyFlushing);
            }
            state.take_for_flush()
        };

        let Some(batch) = claimed else {
            self.inner.remove_if_idle(key);
            return Ok(FlushOutcome::Empty);
        };

        let batch_size = batch.len();
        match self
            .inner
            .spawn_flush(key.to_string(), batch, Trigger::Forced)
            .await
        {
            Ok(result) => result.map(FlushOutcome::Flushed),
            Err(join_err) => Err(BufferError::Handler {
                key: key.to_string(),
                batch_size,
                reason: format!("flush task aborted: {join_err}"),
            }),
        }
    }

    /// Cancel `key`'s timer and discard its pending messages without calling
    /// the handler. Returns how many messages were dropped.
    ///
    /// An in-flight flush is not interrupted; it completes normally.
    pub fn clear(&self, key: &str) -> usize {
        let discarded = {
            let Some(mut state) = self.inner.states.get_mut(key) else {
                return 0;
            };
            state.cancel_timer();
            let n = state.pending.len();
            state.pending.clear();
            n
        };
        self.inner.remove_if_idle(key);
        info!(key, discarded, "buffer cleared");
        discarded
    }

    /// Snapshot of `key`'s buffer. Unknown keys report an empty status.
    pub fn status(&self, key: &str) -> BufferStatus {
        self.inner
            .states
            .get(key)
            .map(|state| BufferStatus {
                buffer_size: state.pending.len(),
                has_active_timer: state.timer.is_some(),
                is_flushing: state.flushing,
            })
            .unwrap_or_default()
    }

    /// Keys that currently hold buffer state (pending, timed or flushing).
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .states
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Flush every key until nothing is pending or flushing, giving up after
    /// `grace`.
    ///
    /// Used on shutdown. Messages that arrive behind an in-flight flush are
    /// picked up by a later pass. Returns the number of messages handed to the
    /// handler by this call; handler failures are logged, not returned.
    pub async fn flush_all(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        let mut flushed = 0;
        loop {
            for key in self.active_keys() {
                match self.flush(&key).await {
                    Ok(FlushOutcome::Flushed(n)) => flushed += n,
                    Ok(_) => {}
                    Err(e) => warn!(key = %key, error = %e, "flush during drain failed"),
                }
            }

            let (remaining, in_flight) =
                self.inner
                    .states
                    .iter()
                    .fold((0, 0), |(pending, flushing), entry| {
                        (pending + entry.pending.len(), flushing + usize::from(entry.flushing))
                    });
            if remaining == 0 && in_flight == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining,
                    in_flight,
                    "buffer drain grace period elapsed before buffers emptied"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        flushed
    }
}

impl Inner {
    /// Start a debounce timer for `key`. The caller stores the handle in the
    /// key's state while still holding the entry guard.
    fn arm_timer(self: &Arc<Self>, key: &str) -> TimerHandle {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(self);
        let key = key.to_string();
        let timeout = Duration::from_millis(self.config.timeout_ms);

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => inner.on_timer(key, id).await,
            }
        });

        TimerHandle { id, cancel }
    }

    async fn on_timer(self: Arc<Self>, key: String, timer_id: u64) {
        let claimed = {
            let Some(mut state) = self.states.get_mut(&key) else {
                return;
            };
            // A newer timer replaced this one between expiry and now.
            if !matches!(&state.timer, Some(t) if t.id == timer_id) {
                return;
            }
            state.timer = None;
            state.take_for_flush()
        };

        match claimed {
            // Errors are already logged inside run_flush.
            Some(batch) => {
                let _ = self.run_flush(key, batch, Trigger::Timer).await;
            }
            None => self.remove_if_idle(&key),
        }
    }

    fn spawn_flush(
        self: &Arc<Self>,
        key: String,
        batch: Vec<InboundMessage>,
        trigger: Trigger,
    ) -> JoinHandle<Result<usize>> {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_flush(key, batch, trigger).await })
    }

    async fn run_flush(
        self: Arc<Self>,
        key: String,
        batch: Vec<InboundMessage>,
        trigger: Trigger,
    ) -> Result<usize> {
        let batch_size = batch.len();
        debug!(key = %key, batch_size, ?trigger, "flushing buffer");

        // Resets the flushing flag even if the handler panics.
        let mut guard = FlushGuard {
            inner: Arc::clone(&self),
            key: key.clone(),
            requeued: None,
        };
        let result = self.handler.on_flush(&key, batch).await;

        let result = result.map_err(|e| match e.downcast::<Requeue>() {
            Ok(requeue) => {
                let Requeue { batch, reason } = *requeue;
                guard.requeued = Some(batch);
                BufferError::Requeued {
                    key: key.clone(),
                    batch_size,
                    reason,
                }
            }
            Err(e) => BufferError::Handler {
                key: key.clone(),
                batch_size,
                reason: e.to_string(),
            },
        });
        drop(guard);

        match &result {
            Ok(()) => info!(key = %key, batch_size, ?trigger, "buffer flushed"),
            Err(BufferError::Requeued { reason, .. }) => {
                warn!(key = %key, batch_size, ?trigger, reason = %reason, "batch requeued for retry")
            }
            Err(e) => warn!(key = %key, batch_size, ?trigger, error = %e, "flush handler failed"),
        }
        result.map(|()| batch_size)
    }

    /// Bookkeeping after a flush, successful or not: clear `flushing`, then
    /// drop the entry if nothing new arrived, or schedule the next batch.
    ///
    /// A requeued batch goes back in front of newer arrivals and always waits
    /// for the timer, so an outage is not retried in a tight loop.
    fn finish_flush(self: &Arc<Self>, key: &str, requeued: Option<Vec<InboundMessage>>) {
        if let Some(batch) = requeued {
            let mut state = self.states.entry(key.to_string()).or_default();
            state.flushing = false;
            state.pending.splice(0..0, batch);
            if state.timer.is_none() {
                state.timer = Some(self.arm_timer(key));
            }
            return;
        }

        let follow_up = {
            let Some(mut state) = self.states.get_mut(key) else {
                return;
            };
            state.flushing = false;

            if state.pending.is_empty() {
                None
            } else if state.pending.len() >= self.config.max_messages {
                state.take_for_flush()
            } else {
                if state.timer.is_none() {
                    state.timer = Some(self.arm_timer(key));
                }
                None
            }
        };

        match follow_up {
            Some(batch) => drop(self.spawn_flush(key.to_string(), batch, Trigger::SizeLimit)),
            None => self.remove_if_idle(key),
        }
    }

    fn remove_if_idle(&self, key: &str) {
        self.states.remove_if(key, |_, state| state.is_idle());
    }
}

struct FlushGuard {
    inner: Arc<Inner>,
    key: String,
    requeued: Option<Vec<InboundMessage>>,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        let requeued = self.requeued.take();
        self.inner.finish_flush(&self.key, requeued);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::{sleep, timeout};

    type Flushed = (String, Vec<InboundMessage>);

    struct Recorder {
        tx: mpsc::UnboundedSender<Flushed>,
        delay: Duration,
    }

    #[async_trait]
    impl FlushHandler for Recorder {
        async fn on_flush(&self, key: &str, batch: Vec<InboundMessage>) -> std::result::Result<(), HandlerError> {
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let _ = self.tx.send((key.to_string(), batch));
            Ok(())
        }
    }

    fn recorder(delay_ms: u64) -> (Arc<dyn FlushHandler>, mpsc::UnboundedReceiver<Flushed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                tx,
                delay: Duration::from_millis(delay_ms),
            }),
            rx,
        )
    }

    fn config(timeout_ms: u64, max_messages: usize) -> BufferConfig {
        BufferConfig {
            enabled: true,
            timeout_ms,
            max_messages,
        }
    }

    fn msg(id: &str, key: &str, text: &str) -> InboundMessage {
        InboundMessage::text(id, key, text)
    }

    fn texts(batch: &[InboundMessage]) -> Vec<&str> {
        batch.iter().map(|m| m.text.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_flushes_once_in_order() {
        let (handler, mut rx) = recorder(0);
        let buffer = ConsolidationBuffer::new(config(1_000, 100), handler);
        let key = "5511999999999";

        assert!(buffer.add(key, msg("1", key, "Oi")));
        sleep(Duration::from_millis(300)).await;
        assert!(buffer.add(key, msg("2", key, "queria saber sobre energia solar")));
        sleep(Duration::from_millis(300)).await;
        assert!(buffer.add(key, msg("3", key, "quanto custa?")));

        sleep(Duration::from_millis(900)).await;
        assert!(rx.try_recv().is_err(), "flushed before the quiet period ended");
        assert_eq!(buffer.status(key).buffer_size, 3);
        assert!(buffer.status(key).has_active_timer);

        let (flushed_key, batch) = timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("flush did not happen after the window")
            .unwrap();
        assert_eq!(flushed_key, key);
        assert_eq!(
            texts(&batch),
            vec!["Oi", "queria saber sobre energia solar", "quanto custa?"]
        );

        sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err(), "handler invoked more than once");
        assert_eq!(buffer.status(key), BufferStatus::default());
        assert!(buffer.active_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn max_messages_flushes_immediately() {
        let (handler, mut rx) = recorder(0);
        let buffer = ConsolidationBuffer::new(config(60_000, 5), handler);

        for i in 0..5 {
            assert!(buffer.add("K", msg(&i.to_string(), "K", &format!("m{i}"))));
        }
        let status = buffer.status("K");
        assert_eq!(status.buffer_size, 0);
        assert!(!status.has_active_timer);

        let (_, batch) = timeout(Duration::from_millis(10), rx.recv())
            .await
            .expect("size-limit flush should not wait for the timer")
            .unwrap();
        assert_eq!(texts(&batch), vec!["m0", "m1", "m2", "m3", "m4"]);

        // A fresh buffer accepts the next message for the same key.
        sleep(Duration::from_millis(1)).await;
        assert!(buffer.add("K", msg("5", "K", "m5")));
        assert_eq!(buffer.status("K").buffer_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_stream_is_only_flushed_by_size_limit() {
        let (handler, mut rx) = recorder(0);
        let buffer = ConsolidationBuffer::new(config(1_000, 25), handler);

        // One message every 500ms for 10s: the 1s window never goes quiet.
        for i in 0..20 {
            buffer.add("K", msg(&i.to_string(), "K", "typing"));
            sleep(Duration::from_millis(500)).await;
            assert!(rx.try_recv().is_err(), "timer flushed mid-stream at {i}");
        }
        assert_eq!(buffer.status("K").buffer_size, 20);

        // Five more reach the size limit without any quiet period.
        for i in 20..25 {
            buffer.add("K", msg(&i.to_string(), "K", "typing"));
            sleep(Duration::from_millis(500)).await;
        }
        let (_, batch) = rx.try_recv().expect("size limit should have flushed");
        assert_eq!(batch.len(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_buffer_rejects_messages() {
        let (handler, mut rx) = recorder(0);
        let mut cfg = config(1_000, 10);
        cfg.enabled = false;
        let buffer = ConsolidationBuffer::new(cfg, handler);

        assert!(!buffer.is_enabled());
        assert!(!buffer.add("K", msg("1", "K", "Oi")));
        assert_eq!(buffer.status("K"), BufferStatus::default());
        sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn force_flush_cancels_timer() {
        let (handler, mut rx) = recorder(0);
        let buffer = ConsolidationBuffer::new(config(1_000, 10), handler);

        buffer.add("K", msg("1", "K", "a"));
        buffer.add("K", msg("2", "K", "b"));
        let outcome = buffer.flush("K").await.unwrap();
        assert_eq!(outcome, FlushOutcome::Flushed(2));
        assert_eq!(buffer.status("K"), BufferStatus::default());

        let (_, batch) = rx.try_recv().unwrap();
        assert_eq!(texts(&batch), vec!["a", "b"]);

        sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err(), "cancelled timer still fired");
    }

    #[tokio::test(start_paused = true)]
    async fn force_flush_of_unknown_key_is_empty() {
        let (handler, _rx) = recorder(0);
        let buffer = ConsolidationBuffer::new(config(1_000, 10), handler);
        assert_eq!(buffer.flush("nobody").await.unwrap(), FlushOutcome::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn force_flush_during_timer_flush_is_noop() {
        let (handler, mut rx) = recorder(500);
        let buffer = ConsolidationBuffer::new(config(100, 10), handler);

        buffer.add("K", msg("1", "K", "a"));
        sleep(Duration::from_millis(150)).await;
        assert!(buffer.status("K").is_flushing);

        assert_eq!(buffer.flush("K").await.unwrap(), FlushOutcome::AlreadyFlushing);

        let (_, batch) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(texts(&batch), vec!["a"]);
        sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err(), "same batch flushed twice");
    }

    #[tokio::test(start_paused = true)]
    async fn arrivals_during_flush_start_next_batch() {
        let (handler, mut rx) = recorder(1_000);
        let buffer = ConsolidationBuffer::new(config(100, 10), handler);

        buffer.add("K", msg("1", "K", "first"));
        sleep(Duration::from_millis(150)).await;
        assert!(buffer.status("K").is_flushing);

        // Not blocked by the running handler.
        buffer.add("K", msg("2", "K", "second"));
        buffer.add("K", msg("3", "K", "third"));
        let status = buffer.status("K");
        assert_eq!(status.buffer_size, 2);
        assert!(status.is_flushing);

        let (_, first) = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(texts(&first), vec!["first"]);
        let (_, second) = timeout(Duration::from_secs(3), rx.recv()).await.unwrap().unwrap();
        assert_eq!(texts(&second), vec!["second", "third"]);

        sleep(Duration::from_millis(10)).await;
        assert!(buffer.active_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn size_limit_reached_during_flush_flushes_after_completion() {
        let (handler, mut rx) = recorder(1_000);
        let buffer = ConsolidationBuffer::new(config(60_000, 2), handler);

        buffer.add("K", msg("1", "K", "a"));
        buffer.add("K", msg("2", "K", "b"));
        sleep(Duration::from_millis(10)).await;
        assert!(buffer.status("K").is_flushing);

        buffer.add("K", msg("3", "K", "c"));
        buffer.add("K", msg("4", "K", "d"));
        assert_eq!(buffer.status("K").buffer_size, 2);

        let (_, first) = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(texts(&first), vec!["a", "b"]);
        let (_, second) = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(texts(&second), vec!["c", "d"]);
    }

    struct Failing {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FlushHandler for Failing {
        async fn on_flush(&self, _key: &str, _batch: Vec<InboundMessage>) -> std::result::Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("dispatcher unavailable".into())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_still_cleans_up() {
        let handler = Arc::new(Failing {
            calls: AtomicUsize::new(0),
        });
        let buffer = ConsolidationBuffer::new(config(1_000, 10), handler.clone());

        buffer.add("K", msg("1", "K", "a"));
        let err = buffer.flush("K").await.unwrap_err();
        let BufferError::Handler {
            key,
            batch_size,
            reason,
        } = err
        else {
            panic!("expected a handler error, got {err:?}");
        };
        assert_eq!(key, "K");
        assert_eq!(batch_size, 1);
        assert!(reason.contains("dispatcher unavailable"));
        assert_eq!(buffer.status("K"), BufferStatus::default());

        // The key is not stuck behind the failed flush.
        buffer.add("K", msg("2", "K", "b"));
        sleep(Duration::from_millis(1_100)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(buffer.active_keys().is_empty());
    }

    struct Panicking;

    #[async_trait]
    impl FlushHandler for Panicking {
        async fn on_flush(&self, _key: &str, _batch: Vec<InboundMessage>) -> std::result::Result<(), HandlerError> {
            panic!("handler bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handler_panic_does_not_wedge_key() {
        let buffer = ConsolidationBuffer::new(config(1_000, 10), Arc::new(Panicking));

        buffer.add("K", msg("1", "K", "a"));
        assert!(buffer.flush("K").await.is_err());
        let status = buffer.status("K");
        assert!(!status.is_flushing);
        assert_eq!(status.buffer_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_discards_without_calling_handler() {
        let (handler, mut rx) = recorder(0);
        let buffer = ConsolidationBuffer::new(config(1_000, 10), handler);

        for i in 0..3 {
            buffer.add("K", msg(&i.to_string(), "K", "x"));
        }
        assert_eq!(buffer.clear("K"), 3);
        assert_eq!(buffer.status("K"), BufferStatus::default());
        assert_eq!(buffer.clear("K"), 0);

        sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
    }

    struct Gated {
        gate: Arc<Notify>,
        tx: mpsc::UnboundedSender<Flushed>,
    }

    #[async_trait]
    impl FlushHandler for Gated {
        async fn on_flush(&self, key: &str, batch: Vec<InboundMessage>) -> std::result::Result<(), HandlerError> {
            if key == "slow" {
                self.gate.notified().await;
            }
            let _ = self.tx.send((key.to_string(), batch));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn keys_do_not_block_each_other() {
        let gate = Arc::new(Notify::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let buffer = ConsolidationBuffer::new(
            config(100, 10),
            Arc::new(Gated {
                gate: gate.clone(),
                tx,
            }),
        );

        buffer.add("slow", msg("1", "slow", "a"));
        buffer.add("fast", msg("2", "fast", "b"));

        let (key, _) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(key, "fast");
        assert!(buffer.status("slow").is_flushing);

        gate.notify_one();
        let (key, _) = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(key, "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_drains_every_key() {
        let (handler, mut rx) = recorder(0);
        let buffer = ConsolidationBuffer::new(config(60_000, 10), handler);

        buffer.add("a", msg("1", "a", "x"));
        buffer.add("a", msg("2", "a", "y"));
        buffer.add("b", msg("3", "b", "z"));

        assert_eq!(buffer.flush_all(Duration::from_secs(1)).await, 3);
        assert!(buffer.active_keys().is_empty());

        let mut keys = vec![rx.try_recv().unwrap().0, rx.try_recv().unwrap().0];
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    /// Hands the first batch back, then records every later one.
    struct RequeueOnce {
        calls: AtomicUsize,
        tx: mpsc::UnboundedSender<Flushed>,
    }

    #[async_trait]
    impl FlushHandler for RequeueOnce {
        async fn on_flush(&self, key: &str, batch: Vec<InboundMessage>) -> std::result::Result<(), HandlerError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Box::new(Requeue::new(batch, "identity store unavailable")));
            }
            let _ = self.tx.send((key.to_string(), batch));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_batch_is_retried_ahead_of_new_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(RequeueOnce {
            calls: AtomicUsize::new(0),
            tx,
        });
        let buffer = ConsolidationBuffer::new(config(1_000, 10), handler.clone());

        buffer.add("K", msg("1", "K", "Oi"));
        sleep(Duration::from_millis(1_050)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());

        let status = buffer.status("K");
        assert_eq!(status.buffer_size, 1);
        assert!(status.has_active_timer);
        assert!(!status.is_flushing);

        buffer.add("K", msg("2", "K", "alguém aí?"));
        let (_, batch) = timeout(Duration::from_millis(1_100), rx.recv()).await.unwrap().unwrap();
        assert_eq!(texts(&batch), vec!["Oi", "alguém aí?"]);

        sleep(Duration::from_millis(10)).await;
        assert!(buffer.active_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forced_flush_reports_requeue() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = Arc::new(RequeueOnce {
            calls: AtomicUsize::new(0),
            tx,
        });
        let buffer = ConsolidationBuffer::new(config(60_000, 10), handler);

        buffer.add("K", msg("1", "K", "Oi"));
        let err = buffer.flush("K").await.unwrap_err();
        assert!(matches!(err, BufferError::Requeued { batch_size: 1, .. }), "{err:?}");
        assert_eq!(buffer.status("K").buffer_size, 1);

        assert_eq!(buffer.flush("K").await.unwrap(), FlushOutcome::Flushed(1));
        assert!(buffer.active_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_drains_messages_queued_behind_running_flush() {
        let (handler, mut rx) = recorder(500);
        let buffer = ConsolidationBuffer::new(config(60_000, 10), handler);

        buffer.add("K", msg("1", "K", "Oi"));
        let running = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.flush("K").await })
        };
        sleep(Duration::from_millis(10)).await;
        assert!(buffer.status("K").is_flushing);

        buffer.add("K", msg("2", "K", "tudo bem?"));
        assert_eq!(buffer.flush_all(Duration::from_secs(5)).await, 1);
        assert_eq!(running.await.unwrap().unwrap(), FlushOutcome::Flushed(1));

        assert_eq!(texts(&rx.try_recv().unwrap().1), vec!["Oi"]);
        assert_eq!(texts(&rx.try_recv().unwrap().1), vec!["tudo bem?"]);
        assert_eq!(buffer.status("K"), BufferStatus::default());
        assert!(buffer.active_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_gives_up_after_grace() {
        let gate = Arc::new(Notify::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let buffer = ConsolidationBuffer::new(
            config(60_000, 10),
            Arc::new(Gated {
                gate: gate.clone(),
                tx,
            }),
        );

        buffer.add("slow", msg("1", "slow", "a"));
        let running = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.flush("slow").await })
        };
        sleep(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        assert_eq!(buffer.flush_all(Duration::from_secs(2)).await, 0);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(buffer.status("slow").is_flushing);

        gate.notify_one();
        assert_eq!(running.await.unwrap().unwrap(), FlushOutcome::Flushed(1));
    }
}
