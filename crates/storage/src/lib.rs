use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod error;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use error::{ErrorKind, StorageError, StorageResult};
pub use ids::{MessageId, UserId};
pub use sqlite::SqliteStorage;
pub use types::{
    MessageRecord, NewMessage, NewUser, ReadReceipt, UnreadMessage, UserRecord,
};

/// Durable log of direct messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn send(&self, input: NewMessage) -> StorageResult<MessageRecord>;
    /// Every message between `user_a` and `user_b`, ascending by `(timestamp, id)`.
    async fn history(&self, user_a: UserId, user_b: UserId) -> StorageResult<Vec<MessageRecord>>;
    async fn get_message(&self, message_id: MessageId) -> StorageResult<Option<MessageRecord>>;
    async fn mark_read(&self, viewer: UserId, counterpart: UserId) -> StorageResult<ReadReceipt>;
    async fn unread_messages(&self, viewer: UserId) -> StorageResult<Vec<UnreadMessage>>;
    async fn unread_counts(&self, viewer: UserId) -> StorageResult<HashMap<UserId, u64>>;
    /// Latest message timestamp per counterpart, in either direction.
    async fn last_contacts(&self, viewer: UserId)
    -> StorageResult<HashMap<UserId, DateTime<Utc>>>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, input: NewUser) -> StorageResult<UserRecord>;
    async fn get_user(&self, user_id: UserId) -> StorageResult<Option<UserRecord>>;
    async fn list_users(&self) -> StorageResult<Vec<UserRecord>>;
}

pub trait Storage: MessageStore + UserStore {}

impl<T> Storage for T where T: MessageStore + UserStore {}
