use std::path::Path;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use tracing::{debug, instrument};

use crate::db::init_db;
use crate::error::StoreError;
use crate::store::IdentityStore;
use crate::types::ConversationIdentity;

/// How long a writer waits on another connection's lock before giving up
/// with `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// SQLite-backed identity store.
///
/// Several processes may open the same file; the `UNIQUE(conversation_key)`
/// constraint arbitrates between them.
pub struct SqliteIdentityStore {
    db: Mutex<Connection>,
}

impl SqliteIdentityStore {
    /// Open (or create) the database file and initialise the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("create db dir: {e}")))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout={BUSY_TIMEOUT_MS};"
        ))?;
        Self::new(conn)
    }

    /// Wrap an already-open connection, creating the tables if needed.
    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Number of conversation rows. Used by operational tooling and tests.
    pub fn conversation_count(&self) -> Result<u64, StoreError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let n: i64 = db
            .query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))
            .map_err(|e| classify(e, "*"))?;
        Ok(n as u64)
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    #[instrument(skip(self))]
    async fn find(&self, key: &str) -> Result<Option<ConversationIdentity>, StoreError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        match db.query_row(
            "SELECT id, lead_id, conversation_key, created_at
             FROM conversations WHERE conversation_key = ?1",
            params![key],
            row_to_identity,
        ) {
            Ok(identity) => Ok(Some(identity)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(classify(e, key)),
        }
    }

    #[instrument(skip(self))]
    async fn insert_new(&self, key: &str) -> Result<ConversationIdentity, StoreError> {
        let identity = ConversationIdentity::new_for(key);
        let created_at = identity.created_at.to_rfc3339();

        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        // IMMEDIATE takes the write lock up front so the busy handler applies
        // instead of failing on a read-to-write upgrade.
        let tx = db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| classify(e, key))?;
        tx.execute(
            "INSERT INTO leads (id, conversation_key, created_at) VALUES (?1, ?2, ?3)",
            params![identity.lead_id, key, created_at],
        )
        .map_err(|e| classify(e, key))?;
        tx.execute(
            "INSERT INTO conversations (id, lead_id, conversation_key, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![identity.conversation_id, identity.lead_id, key, created_at],
        )
        .map_err(|e| classify(e, key))?;
        tx.commit().map_err(|e| classify(e, key))?;

        debug!(conversation_id = %identity.conversation_id, "conversation created");
        Ok(identity)
    }
}

/// Map SQLite failures onto the store taxonomy.
fn classify(e: rusqlite::Error, key: &str) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::Conflict {
            key: key.to_string(),
        },
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Database(e),
    }
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationIdentity> {
    let created_at: String = row.get(3)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?;
    Ok(ConversationIdentity {
        conversation_id: row.get(0)?,
        lead_id: row.get(1)?,
        conversation_key: row.get(2)?,
        is_newly_created: false,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_find() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        assert!(store.find("5511").await.unwrap().is_none());

        let created = store.insert_new("5511").await.unwrap();
        assert!(created.is_newly_created);

        let found = store.find("5511").await.unwrap().unwrap();
        assert!(!found.is_newly_created);
        assert_eq!(found.conversation_id, created.conversation_id);
        assert_eq!(found.lead_id, created.lead_id);
        assert_eq!(found.created_at.timestamp(), created.created_at.timestamp());
    }

    #[tokio::test]
    async fn duplicate_insert_is_conflict_and_rolls_back_lead() {
        let store = SqliteIdentityStore::open_in_memory().unwrap();
        store.insert_new("5511").await.unwrap();

        let err = store.insert_new("5511").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { ref key } if key == "5511"));

        let db = store.db.lock().unwrap();
        let leads: i64 = db
            .query_row("SELECT COUNT(*) FROM leads", [], |r| r.get(0))
            .unwrap();
        assert_eq!(leads, 1, "losing insert left an orphan lead");
        drop(db);
        assert_eq!(store.conversation_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("solara.db");

        let id = {
            let store = SqliteIdentityStore::open(&path).unwrap();
            store.insert_new("5511").await.unwrap().conversation_id
        };
        let store = SqliteIdentityStore::open(&path).unwrap();
        assert_eq!(store.find("5511").await.unwrap().unwrap().conversation_id, id);
    }
}
