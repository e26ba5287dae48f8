//! solara-identity: maps a conversation key (e.g. a phone number) to a
//! durable lead + conversation record, creating it on first contact.
//!
//! Creation is race-safe across tasks and across processes: the store's unique
//! constraint on `conversation_key` decides the winner, and the
//! [`IdentityResolver`] turns a lost race into a read of the winner's record.

pub mod db;
pub mod error;
pub mod memory;
pub mod resolver;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::{IdentityError, StoreError};
pub use memory::MemoryIdentityStore;
pub use resolver::IdentityResolver;
pub use sqlite::SqliteIdentityStore;
pub use store::IdentityStore;
pub use types::{ConversationIdentity, RetryPolicy};
