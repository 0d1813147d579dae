use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_storage::{
    MessageId, MessageRecord, MessageStore, NewMessage, ReadReceipt, SqliteStorage,
    UnreadMessage, UserId,
};

use crate::channel::EventHub;
use crate::config::ChatConfig;
use crate::error::{ChatResult, StorageResultExt};

/// Message store front door: every successful write is published exactly once
/// on the live event channel.
pub struct MessageService<S> {
    store: Arc<S>,
    hub: EventHub,
}

impl<S> Clone for MessageService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            hub: self.hub.clone(),
        }
    }
}

impl MessageService<SqliteStorage> {
    /// Opens the configured database behind a hub sized from the same config.
    pub async fn open(config: &ChatConfig) -> ChatResult<Self> {
        let store = SqliteStorage::open(&config.database_path)
            .await
            .chat_context("service-open-store")?;
        tracing::info!(
            database = store.database_url(),
            channel_capacity = config.channel_capacity,
            "message service opened"
        );
        Ok(Self::new(Arc::new(store), EventHub::from_config(config)))
    }
}

impl<S> MessageService<S>
where
    S: MessageStore + 'static,
{
    pub fn new(store: Arc<S>, hub: EventHub) -> Self {
        Self { store, hub }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub async fn send(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
        content: &str,
        reply_to: Option<MessageId>,
    ) -> ChatResult<MessageRecord> {
        let message = self
            .store
            .send(NewMessage {
                sender_id,
                receiver_id,
                content: content.to_string(),
                reply_to,
            })
            .await
            .chat_context("service-send")?;

        tracing::debug!(
            message_id = %message.id,
            sender = %sender_id,
            receiver = %receiver_id,
            reply_to = ?reply_to,
            "message stored"
        );
        self.hub.publish(message.clone());
        Ok(message)
    }

    pub async fn history(&self, user_a: UserId, user_b: UserId) -> ChatResult<Vec<MessageRecord>> {
        self.store
            .history(user_a, user_b)
            .await
            .chat_context("service-history")
    }

    pub async fn mark_read(&self, viewer: UserId, counterpart: UserId) -> ChatResult<ReadReceipt> {
        let receipt = self
            .store
            .mark_read(viewer, counterpart)
            .await
            .chat_context("service-mark-read")?;
        if receipt.marked > 0 {
            tracing::debug!(%viewer, %counterpart, marked = receipt.marked, "conversation marked read");
        }
        Ok(receipt)
    }

    pub async fn unread_messages(&self, viewer: UserId) -> ChatResult<Vec<UnreadMessage>> {
        self.store
            .unread_messages(viewer)
            .await
            .chat_context("service-unread-messages")
    }

    pub async fn last_contacts(
        &self,
        viewer: UserId,
    ) -> ChatResult<HashMap<UserId, DateTime<Utc>>> {
        self.store
            .last_contacts(viewer)
            .await
            .chat_context("service-last-contacts")
    }
}
