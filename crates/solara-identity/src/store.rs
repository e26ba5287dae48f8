use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::ConversationIdentity;

/// Persistence seam for conversation identities.
///
/// Implementations must make `insert_new` atomic: of any number of concurrent
/// inserts for one key (in this process or another), exactly one succeeds and
/// the rest get [`StoreError::Conflict`].
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find(&self, key: &str) -> Result<Option<ConversationIdentity>, StoreError>;

    /// Create the lead and conversation for `key`. Fails with `Conflict` if a
    /// record already exists.
    async fn insert_new(&self, key: &str) -> Result<ConversationIdentity, StoreError>;
}
