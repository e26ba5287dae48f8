use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::{IdentityError, Result, StoreError};
use crate::store::IdentityStore;
use crate::types::{ConversationIdentity, RetryPolicy};

/// Fraction of each backoff delay added as random jitter (10%).
const JITTER_FRACTION: f64 = 0.10;

/// Create-or-fetch front end over an [`IdentityStore`].
pub struct IdentityResolver {
    store: Arc<dyn IdentityStore>,
    policy: RetryPolicy,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn IdentityStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Return the identity for `key`, creating it on first contact.
    ///
    /// Losing a creation race is not an error: the winner's record is read
    /// back and returned with `is_newly_created = false`. Any other store
    /// failure retries the whole find/insert sequence with exponential backoff
    /// and ±10% jitter, up to `max_attempts` tries.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_or_create(&self, key: &str) -> Result<ConversationIdentity> {
        let max = self.policy.max_attempts.max(1);

        for attempt in 1..=max {
            match self.try_once(key).await {
                Ok(identity) => {
                    if identity.is_newly_created {
                        info!(conversation_id = %identity.conversation_id, "new conversation created");
                    }
                    return Ok(identity);
                }
                Err(e) if attempt == max => {
                    warn!(attempt, error = %e, "identity store still failing, giving up");
                    return Err(IdentityError::Unavailable {
                        key: key.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay_ms = with_jitter(self.policy.delay_for(attempt));
                    warn!(
                        attempt,
                        max,
                        error = %e,
                        retry_after_ms = delay_ms,
                        "identity store failed, retrying with backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }

        // max >= 1, so the loop always returns.
        unreachable!("retry loop exited without returning")
    }

    async fn try_once(&self, key: &str) -> std::result::Result<ConversationIdentity, StoreError> {
        if let Some(existing) = self.store.find(key).await? {
            return Ok(existing);
        }

        match self.store.insert_new(key).await {
            Ok(created) => Ok(created),
            Err(StoreError::Conflict { .. }) => {
                debug!("lost creation race, reading winner's record");
                match self.store.find(key).await? {
                    Some(winner) => Ok(winner),
                    // Conflict but nothing visible yet: treat as transient.
                    None => Err(StoreError::Unavailable(
                        "conflicting record not yet visible".to_string(),
                    )),
                }
            }
            Err(e) => Err(e),
        }
    }
}

fn with_jitter(base_ms: u64) -> u64 {
    let span = ((base_ms as f64) * JITTER_FRACTION) as u64;
    if span == 0 {
        return base_ms;
    }
    let offset = fastrand::u64(0..=span * 2);
    (base_ms + offset).saturating_sub(span)
}
