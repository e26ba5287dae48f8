use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::store::IdentityStore;
use crate::types::ConversationIdentity;

/// Process-local identity store for tests and database-less runs.
///
/// The DashMap entry API gives the same insert-fail-on-duplicate guarantee as
/// a unique constraint, but only within this process.
#[derive(Default)]
pub struct MemoryIdentityStore {
    records: DashMap<String, ConversationIdentity>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find(&self, key: &str) -> Result<Option<ConversationIdentity>, StoreError> {
        Ok(self.records.get(key).map(|r| r.clone().existing()))
    }

    async fn insert_new(&self, key: &str) -> Result<ConversationIdentity, StoreError> {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(_) => Err(StoreError::Conflict {
                key: key.to_string(),
            }),
            Entry::Vacant(slot) => {
                let identity = ConversationIdentity::new_for(key);
                slot.insert(identity.clone());
                Ok(identity)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_insert_conflicts() {
        let store = MemoryIdentityStore::new();
        let first = store.insert_new("k").await.unwrap();
        assert!(matches!(
            store.insert_new("k").await,
            Err(StoreError::Conflict { .. })
        ));
        let found = store.find("k").await.unwrap().unwrap();
        assert_eq!(found.conversation_id, first.conversation_id);
        assert!(!found.is_newly_created);
        assert_eq!(store.len(), 1);
    }
}
