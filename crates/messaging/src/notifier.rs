use std::sync::Arc;

use async_trait::async_trait;
use parley_storage::{MessageId, MessageRecord, UserId, UserStore};
use snafu::OptionExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ChatResult, NotFoundSnafu, StorageResultExt};

pub const GENERIC_ALERT_TEXT: &str = "New message received";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayName {
    pub name: String,
    pub handle: String,
}

/// Presentation lookup for user ids.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn resolve_display_name(&self, user_id: UserId) -> ChatResult<DisplayName>;
}

#[async_trait]
impl<S> UserDirectory for S
where
    S: UserStore + ?Sized,
{
    async fn resolve_display_name(&self, user_id: UserId) -> ChatResult<DisplayName> {
        let user = self
            .get_user(user_id)
            .await
            .chat_context("directory-resolve-display-name")?
            .context(NotFoundSnafu {
                stage: "directory-resolve-display-name",
                entity: "user",
                id: user_id.to_string(),
            })?;
        Ok(DisplayName {
            name: user.full_name,
            handle: user.username,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub sender_id: UserId,
    pub message_id: MessageId,
    pub text: String,
}

/// Where transient alerts are surfaced.
pub trait AlertSink: Send + Sync {
    fn deliver(&self, alert: Alert);
}

impl AlertSink for mpsc::UnboundedSender<Alert> {
    fn deliver(&self, alert: Alert) {
        if self.send(alert).is_err() {
            tracing::debug!("alert receiver dropped");
        }
    }
}

pub fn alert_text(name: Option<&DisplayName>) -> String {
    match name {
        Some(name) if !name.name.trim().is_empty() => {
            format!("New message from {}", name.name.trim())
        }
        _ => GENERIC_ALERT_TEXT.to_string(),
    }
}

/// Decides whether an incoming message warrants an alert and dispatches it
/// without blocking the caller.
#[derive(Clone)]
pub struct Notifier {
    viewer: UserId,
    directory: Arc<dyn UserDirectory>,
    sink: Arc<dyn AlertSink>,
    enabled: bool,
}

impl Notifier {
    pub fn new(viewer: UserId, directory: Arc<dyn UserDirectory>, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            viewer,
            directory,
            sink,
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn should_alert(&self, message: &MessageRecord, open_counterpart: Option<UserId>) -> bool {
        self.enabled
            && message.receiver_id == self.viewer
            && message.sender_id != self.viewer
            && open_counterpart != Some(message.sender_id)
    }

    /// Spawns the name lookup and delivery. Must be called inside a Tokio runtime.
    pub fn notify(
        &self,
        message: &MessageRecord,
        open_counterpart: Option<UserId>,
    ) -> Option<JoinHandle<()>> {
        if !self.should_alert(message, open_counterpart) {
            return None;
        }

        let directory = Arc::clone(&self.directory);
        let sink = Arc::clone(&self.sink);
        let sender_id = message.sender_id;
        let message_id = message.id;
        Some(tokio::spawn(async move {
            let name = match directory.resolve_display_name(sender_id).await {
                Ok(name) => Some(name),
                Err(error) => {
                    tracing::warn!(%sender_id, %error, "display name lookup failed");
                    None
                }
            };
            sink.deliver(Alert {
                sender_id,
                message_id,
                text: alert_text(name.as_ref()),
            });
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use parley_storage::{NewUser, SqliteStorage};

    use super::*;

    const BOB: UserId = UserId::new(2);

    fn message(id: i64, sender: UserId, receiver: UserId) -> MessageRecord {
        MessageRecord {
            id: MessageId::new(id),
            sender_id: sender,
            receiver_id: receiver,
            content: "ping".to_string(),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000 + id)
                .expect("fixture timestamp in range"),
            reply_to: None,
            is_read: false,
        }
    }

    async fn directory_with_alice() -> (Arc<SqliteStorage>, UserId) {
        let store = SqliteStorage::open(":memory:").await.expect("store opens");
        let alice = store
            .create_user(NewUser::new("Alice Moreau", "amoreau"))
            .await
            .expect("create alice");
        (Arc::new(store), alice.id)
    }

    #[tokio::test]
    async fn alerts_with_the_sender_name() {
        let (store, alice) = directory_with_alice().await;
        let (sink, mut alerts) = mpsc::unbounded_channel();
        let notifier = Notifier::new(BOB, store, Arc::new(sink));

        let handle = notifier
            .notify(&message(1, alice, BOB), None)
            .expect("alert dispatched");
        handle.await.expect("alert task");

        let alert = alerts.try_recv().expect("alert delivered");
        assert_eq!(alert.text, "New message from Alice Moreau");
        assert_eq!(alert.sender_id, alice);
    }

    #[tokio::test]
    async fn lookup_failure_falls_back_to_generic_text() {
        let (store, _) = directory_with_alice().await;
        let (sink, mut alerts) = mpsc::unbounded_channel();
        let notifier = Notifier::new(BOB, store, Arc::new(sink));

        let handle = notifier
            .notify(&message(1, UserId::new(404), BOB), None)
            .expect("alert dispatched");
        handle.await.expect("alert task");

        assert_eq!(alerts.try_recv().expect("alert").text, GENERIC_ALERT_TEXT);
    }

    #[tokio::test]
    async fn suppressed_for_open_conversation_and_own_messages() {
        let (store, alice) = directory_with_alice().await;
        let (sink, _alerts) = mpsc::unbounded_channel();
        let notifier = Notifier::new(BOB, store, Arc::new(sink));

        assert!(!notifier.should_alert(&message(1, alice, BOB), Some(alice)));
        assert!(!notifier.should_alert(&message(2, BOB, alice), None));
        assert!(notifier.should_alert(&message(3, alice, BOB), Some(UserId::new(9))));
        assert!(!notifier.clone().with_enabled(false).should_alert(&message(4, alice, BOB), None));
    }
}
