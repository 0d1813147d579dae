//! Per-viewer session: the single owner of unread counts, list ordering and the
//! open conversation.
//!
//! Live deliveries and background history fetches land in one inbox and are
//! applied in arrival order by [`ChatSession::process_pending`] or
//! [`ChatSession::next_event`], so derived state is only mutated from here.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, TimeZone};
use parley_storage::{MessageId, MessageRecord, Storage, UserId};
use snafu::OptionExt;
use tokio::sync::mpsc;

use crate::channel::{Delivery, Envelope, Scope, SubscriberId, Subscription, SubscriptionId};
use crate::config::ChatConfig;
use crate::error::{
    ChatError, ChatResult, NoOpenConversationSnafu, StorageResultExt, ValidationSnafu,
};
use crate::list::{ContactRow, ConversationList};
use crate::notifier::{AlertSink, Notifier};
use crate::service::MessageService;
use crate::unread::UnreadTracker;
use crate::view::{ConversationModel, ConversationView};

/// Identity of the signed-in viewer, resolved once by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub viewer: UserId,
}

#[derive(Debug)]
pub enum SessionEvent {
    /// A message addressed to the viewer arrived.
    MessageReceived(MessageRecord),
    /// The open conversation gained a message from the live feed.
    ConversationUpdated(MessageRecord),
    HistoryLoaded { counterpart: UserId, loaded: usize },
    HistoryFailed { counterpart: UserId, error: ChatError },
    /// Unread counts and contact times were rebuilt from the store.
    Resynced,
}

enum InboxItem {
    Delivery(Envelope),
    History {
        generation: u64,
        counterpart: UserId,
        result: ChatResult<Vec<MessageRecord>>,
    },
}

struct OpenConversation {
    view: ConversationView,
    subscription: Subscription,
    generation: u64,
}

pub struct ChatSession<S> {
    context: SessionContext,
    service: MessageService<S>,
    subscriber: SubscriberId,
    inbox_tx: mpsc::UnboundedSender<InboxItem>,
    inbox_rx: mpsc::UnboundedReceiver<InboxItem>,
    recipient: Subscription,
    conversation: Option<OpenConversation>,
    tracker: UnreadTracker,
    list: ConversationList,
    notifier: Option<Notifier>,
    generation: u64,
    // Set by a feed gap; cleared only by a successful reconcile.
    resync_required: bool,
    // Events applied by a batch that later failed, handed out first next time.
    ready: VecDeque<SessionEvent>,
}

impl<S> ChatSession<S>
where
    S: Storage + 'static,
{
    /// Subscribes to the viewer's feed, then loads the directory, contact times
    /// and unread state. Subscribing first means nothing written during startup
    /// is missed; duplicates are absorbed by the tracker.
    pub async fn start(
        context: SessionContext,
        service: MessageService<S>,
        alerts: Option<Arc<dyn AlertSink>>,
    ) -> ChatResult<Self> {
        Self::start_inner(context, service, alerts, true).await
    }

    /// Like [`ChatSession::start`], honoring `notifications_enabled`.
    pub async fn start_with_config(
        context: SessionContext,
        service: MessageService<S>,
        alerts: Option<Arc<dyn AlertSink>>,
        config: &ChatConfig,
    ) -> ChatResult<Self> {
        Self::start_inner(context, service, alerts, config.notifications_enabled).await
    }

    async fn start_inner(
        context: SessionContext,
        service: MessageService<S>,
        alerts: Option<Arc<dyn AlertSink>>,
        notifications_enabled: bool,
    ) -> ChatResult<Self> {
        let viewer = context.viewer;
        let subscriber = SubscriberId::new_v7();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let recipient = service.hub().subscribe(
            subscriber,
            Scope::Recipient(viewer),
            delivery_sink(inbox_tx.clone()),
        );

        let directory = service
            .store()
            .list_users()
            .await
            .chat_context("session-start-directory")?;
        let mut list = ConversationList::new(viewer, directory);
        list.replace_last_contacts(service.last_contacts(viewer).await?);

        let mut tracker = UnreadTracker::new(viewer);
        tracker.reconcile(&service).await?;

        let notifier = alerts.map(|sink| {
            let directory = Arc::clone(service.store());
            Notifier::new(viewer, directory, sink).with_enabled(notifications_enabled)
        });

        tracing::info!(%viewer, %subscriber, unread = tracker.total(), "chat session started");
        Ok(Self {
            context,
            service,
            subscriber,
            inbox_tx,
            inbox_rx,
            recipient,
            conversation: None,
            tracker,
            list,
            notifier,
            generation: 0,
            resync_required: false,
            ready: VecDeque::new(),
        })
    }

    pub fn viewer(&self) -> UserId {
        self.context.viewer
    }

    pub fn service(&self) -> &MessageService<S> {
        &self.service
    }

    pub fn tracker(&self) -> &UnreadTracker {
        &self.tracker
    }

    pub fn list(&self) -> &ConversationList {
        &self.list
    }

    pub fn is_resync_required(&self) -> bool {
        self.resync_required
    }

    pub fn open_counterpart(&self) -> Option<UserId> {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.view.counterpart())
    }

    pub fn conversation(&self) -> Option<&ConversationView> {
        self.conversation.as_ref().map(|conversation| &conversation.view)
    }

    /// Switches the open conversation. History arrives later as
    /// [`SessionEvent::HistoryLoaded`]; fetches for a conversation that was
    /// replaced in the meantime are discarded.
    pub async fn open_conversation(&mut self, counterpart: UserId) -> ChatResult<()> {
        let viewer = self.viewer();
        if counterpart == viewer {
            return ValidationSnafu {
                stage: "session-open-conversation",
                details: "cannot open a conversation with yourself".to_string(),
            }
            .fail();
        }

        self.generation += 1;
        let generation = self.generation;
        // Release the old pair subscription before the new one starts.
        self.conversation = None;

        let subscription = self.service.hub().subscribe(
            self.subscriber,
            Scope::pair(viewer, counterpart),
            delivery_sink(self.inbox_tx.clone()),
        );
        self.conversation = Some(OpenConversation {
            view: ConversationView::new(viewer, counterpart),
            subscription,
            generation,
        });
        self.list.open(counterpart);
        tracing::debug!(%viewer, %counterpart, generation, "conversation opened");

        // History loads even when marking read fails below.
        self.spawn_history(generation, counterpart);
        self.mark_conversation_read(counterpart).await
    }

    pub fn close_conversation(&mut self) {
        if let Some(conversation) = self.conversation.take() {
            self.generation += 1;
            tracing::debug!(
                counterpart = %conversation.view.counterpart(),
                "conversation closed"
            );
            conversation.subscription.release();
        }
    }

    /// Sends `content` to the open counterpart, consuming the pending reply marker.
    pub async fn send(&mut self, content: &str) -> ChatResult<MessageRecord> {
        let viewer = self.viewer();
        let conversation = self
            .conversation
            .as_mut()
            .context(NoOpenConversationSnafu {
                stage: "session-send",
            })?;
        let counterpart = conversation.view.counterpart();
        let reply_to = conversation.view.pending_reply().map(|message| message.id);

        let message = self
            .service
            .send(viewer, counterpart, content, reply_to)
            .await?;

        if let Some(conversation) = self.conversation.as_mut()
            && conversation.view.counterpart() == counterpart
        {
            conversation.view.take_reply();
            conversation.view.append_own(message.clone());
        }
        self.list.touch(counterpart, message.timestamp);
        Ok(message)
    }

    pub fn reply_to(&mut self, message_id: MessageId) -> ChatResult<()> {
        let conversation = self
            .conversation
            .as_mut()
            .context(NoOpenConversationSnafu {
                stage: "session-reply-to",
            })?;
        conversation.view.reply_to(message_id)?;
        Ok(())
    }

    pub fn cancel_reply(&mut self) {
        if let Some(conversation) = self.conversation.as_mut() {
            conversation.view.cancel_reply();
        }
    }

    /// Applies everything already queued without waiting.
    ///
    /// On failure the events applied so far are kept and returned by the next call.
    pub async fn process_pending(&mut self) -> ChatResult<Vec<SessionEvent>> {
        let mut events = self.ready.drain(..).collect::<Vec<_>>();
        while let Ok(item) = self.inbox_rx.try_recv() {
            match self.apply(item).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(error) => {
                    self.ready.extend(events);
                    return Err(error);
                }
            }
        }
        Ok(events)
    }

    /// Waits for the next item that changes session state.
    pub async fn next_event(&mut self) -> ChatResult<Option<SessionEvent>> {
        if let Some(event) = self.ready.pop_front() {
            return Ok(Some(event));
        }
        while let Some(item) = self.inbox_rx.recv().await {
            if let Some(event) = self.apply(item).await? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    pub fn conversation_list(&self, query: &str) -> Vec<ContactRow> {
        self.list.rows(&self.tracker, query)
    }

    pub fn conversation_model<Tz>(&self, now: &DateTime<Tz>) -> Option<ConversationModel>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.view.build(now))
    }

    pub fn unread_count(&self, counterpart: UserId) -> u64 {
        self.tracker.count(counterpart)
    }

    pub fn total_unread(&self) -> u64 {
        self.tracker.total()
    }

    /// Rebuilds unread counts and contact times from the store.
    pub async fn reconcile(&mut self) -> ChatResult<()> {
        self.tracker.reconcile(&self.service).await?;
        let last_contacts = self.service.last_contacts(self.viewer()).await?;
        self.list.replace_last_contacts(last_contacts);
        if let Some(counterpart) = self.open_counterpart() {
            self.mark_conversation_read(counterpart).await?;
        }
        self.resync_required = false;
        Ok(())
    }

    /// Reconciles after a feed gap. Until this succeeds no incremental update is applied.
    async fn resync(&mut self) -> ChatResult<()> {
        self.resync_required = true;
        tracing::info!(viewer = %self.viewer(), "reconciling after feed gap");
        if let Err(error) = self.reconcile().await {
            tracing::warn!(%error, "reconcile failed; retrying before the next delivery");
            return Err(error);
        }
        if let Some(conversation) = &self.conversation {
            self.spawn_history(conversation.generation, conversation.view.counterpart());
        }
        Ok(())
    }

    async fn apply(&mut self, item: InboxItem) -> ChatResult<Option<SessionEvent>> {
        match item {
            InboxItem::Delivery(envelope) => {
                if self.resync_required {
                    self.resync().await?;
                }
                self.apply_delivery(envelope).await
            }
            InboxItem::History {
                generation,
                counterpart,
                result,
            } => Ok(self.apply_history(generation, counterpart, result)),
        }
    }

    async fn apply_delivery(&mut self, envelope: Envelope) -> ChatResult<Option<SessionEvent>> {
        if envelope.subscription == self.recipient.id() {
            return self.apply_incoming(envelope.delivery).await;
        }
        if self.pair_subscription() == Some(envelope.subscription) {
            return Ok(self.apply_conversation(envelope.delivery));
        }

        tracing::debug!(
            subscription = %envelope.subscription,
            "dropping delivery from released subscription"
        );
        Ok(None)
    }

    async fn apply_incoming(&mut self, delivery: Delivery) -> ChatResult<Option<SessionEvent>> {
        let message = match delivery {
            Delivery::Message(message) => message,
            Delivery::Resync => {
                self.resync().await?;
                return Ok(Some(SessionEvent::Resynced));
            }
        };

        self.ensure_contact(message.sender_id).await;
        self.list.on_emission(&message);
        let open_counterpart = self.open_counterpart();
        if open_counterpart == Some(message.sender_id) {
            if let Some(conversation) = self.conversation.as_mut() {
                conversation.view.apply_emission(message.clone());
            }
            if let Err(error) = self.mark_conversation_read(message.sender_id).await {
                // Still unread in the store, so count it like any other arrival.
                tracing::warn!(message_id = %message.id, %error, "marking in-view message read failed");
                self.tracker.on_emission(&message);
            }
        } else {
            self.tracker.on_emission(&message);
            if let Some(notifier) = &self.notifier {
                notifier.notify(&message, open_counterpart);
            }
        }
        Ok(Some(SessionEvent::MessageReceived(message)))
    }

    fn apply_conversation(&mut self, delivery: Delivery) -> Option<SessionEvent> {
        let conversation = self.conversation.as_mut()?;
        match delivery {
            Delivery::Message(message) => {
                if !conversation.view.apply_emission(message.clone()) {
                    return None;
                }
                if message.sender_id == self.context.viewer {
                    self.list.touch(message.receiver_id, message.timestamp);
                }
                Some(SessionEvent::ConversationUpdated(message))
            }
            Delivery::Resync => {
                let generation = conversation.generation;
                let counterpart = conversation.view.counterpart();
                self.spawn_history(generation, counterpart);
                None
            }
        }
    }

    fn apply_history(
        &mut self,
        generation: u64,
        counterpart: UserId,
        result: ChatResult<Vec<MessageRecord>>,
    ) -> Option<SessionEvent> {
        let Some(conversation) = self
            .conversation
            .as_mut()
            .filter(|conversation| conversation.generation == generation)
        else {
            tracing::debug!(%counterpart, generation, "discarding stale history result");
            return None;
        };

        match result {
            Ok(history) => {
                let loaded = conversation.view.load_history(history);
                Some(SessionEvent::HistoryLoaded {
                    counterpart,
                    loaded,
                })
            }
            Err(error) => {
                tracing::warn!(%counterpart, %error, "history fetch failed");
                Some(SessionEvent::HistoryFailed { counterpart, error })
            }
        }
    }

    async fn mark_conversation_read(&mut self, counterpart: UserId) -> ChatResult<()> {
        let receipt = self.service.mark_read(self.viewer(), counterpart).await?;
        self.tracker.clear(counterpart, receipt);
        self.list.open(counterpart);
        if let Some(conversation) = self.conversation.as_mut()
            && conversation.view.counterpart() == counterpart
        {
            conversation.view.mark_counterpart_read();
        }
        Ok(())
    }

    /// Adds senders who registered after the session started to the directory.
    async fn ensure_contact(&mut self, user_id: UserId) {
        if self.list.contains(user_id) {
            return;
        }
        match self.service.store().get_user(user_id).await {
            Ok(Some(user)) => self.list.upsert_contact(user),
            Ok(None) => tracing::warn!(%user_id, "message from unknown user"),
            Err(error) => tracing::warn!(%user_id, %error, "directory lookup failed"),
        }
    }

    fn pair_subscription(&self) -> Option<SubscriptionId> {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.subscription.id())
    }

    fn spawn_history(&self, generation: u64, counterpart: UserId) {
        let service = self.service.clone();
        let inbox = self.inbox_tx.clone();
        let viewer = self.viewer();
        tokio::spawn(async move {
            let result = service.history(viewer, counterpart).await;
            if inbox
                .send(InboxItem::History {
                    generation,
                    counterpart,
                    result,
                })
                .is_err()
            {
                tracing::debug!(%counterpart, "session dropped before history arrived");
            }
        });
    }
}

fn delivery_sink(
    inbox: mpsc::UnboundedSender<InboxItem>,
) -> impl Fn(Envelope) + Send + Sync + 'static {
    move |envelope| {
        if inbox.send(InboxItem::Delivery(envelope)).is_err() {
            tracing::trace!("session inbox closed; delivery dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use parley_storage::{
        MessageStore, NewMessage, NewUser, ReadReceipt, SqliteStorage, StorageError,
        StorageResult, UnreadMessage, UserRecord, UserStore,
    };
    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::channel::{BackoffConfig, EventHub};
    use crate::notifier::Alert;

    /// Delegates to SQLite but fails the next N calls of selected queries.
    struct FlakyStore {
        inner: SqliteStorage,
        failing_unread: AtomicUsize,
        failing_mark_read: AtomicUsize,
    }

    impl FlakyStore {
        fn fail_unread(&self, times: usize) {
            self.failing_unread.store(times, Ordering::SeqCst);
        }

        fn fail_mark_read(&self, times: usize) {
            self.failing_mark_read.store(times, Ordering::SeqCst);
        }

        fn outage(counter: &AtomicUsize, stage: &'static str) -> StorageResult<()> {
            if counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::InvariantViolation {
                    stage,
                    details: "store unreachable".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn send(&self, input: NewMessage) -> StorageResult<MessageRecord> {
            self.inner.send(input).await
        }

        async fn history(
            &self,
            user_a: UserId,
            user_b: UserId,
        ) -> StorageResult<Vec<MessageRecord>> {
            self.inner.history(user_a, user_b).await
        }

        async fn get_message(&self, message_id: MessageId) -> StorageResult<Option<MessageRecord>> {
            self.inner.get_message(message_id).await
        }

        async fn mark_read(&self, viewer: UserId, counterpart: UserId) -> StorageResult<ReadReceipt> {
            Self::outage(&self.failing_mark_read, "flaky-mark-read")?;
            self.inner.mark_read(viewer, counterpart).await
        }

        async fn unread_messages(&self, viewer: UserId) -> StorageResult<Vec<UnreadMessage>> {
            Self::outage(&self.failing_unread, "flaky-unread-messages")?;
            self.inner.unread_messages(viewer).await
        }

        async fn unread_counts(&self, viewer: UserId) -> StorageResult<HashMap<UserId, u64>> {
            self.inner.unread_counts(viewer).await
        }

        async fn last_contacts(
            &self,
            viewer: UserId,
        ) -> StorageResult<HashMap<UserId, DateTime<Utc>>> {
            self.inner.last_contacts(viewer).await
        }
    }

    #[async_trait]
    impl UserStore for FlakyStore {
        async fn create_user(&self, input: NewUser) -> StorageResult<UserRecord> {
            self.inner.create_user(input).await
        }

        async fn get_user(&self, user_id: UserId) -> StorageResult<Option<UserRecord>> {
            self.inner.get_user(user_id).await
        }

        async fn list_users(&self) -> StorageResult<Vec<UserRecord>> {
            self.inner.list_users().await
        }
    }

    struct Fixture<S> {
        service: MessageService<S>,
        alice: UserId,
        bob: UserId,
        carol: UserId,
    }

    async fn seeded_store() -> (SqliteStorage, [UserId; 3]) {
        let store = SqliteStorage::open(":memory:").await.expect("store opens");
        let mut ids = [UserId::new(0); 3];
        for (slot, (full_name, username)) in ids.iter_mut().zip([
            ("Alice Moreau", "amoreau"),
            ("Bob Tran", "btran"),
            ("Carol Diaz", "cdiaz"),
        ]) {
            *slot = store
                .create_user(NewUser::new(full_name, username))
                .await
                .expect("create user")
                .id;
        }
        (store, ids)
    }

    async fn fixture() -> Fixture<SqliteStorage> {
        let (store, [alice, bob, carol]) = seeded_store().await;
        Fixture {
            service: MessageService::new(Arc::new(store), EventHub::default()),
            alice,
            bob,
            carol,
        }
    }

    async fn flaky_fixture() -> Fixture<FlakyStore> {
        let (inner, [alice, bob, carol]) = seeded_store().await;
        let store = FlakyStore {
            inner,
            failing_unread: AtomicUsize::new(0),
            failing_mark_read: AtomicUsize::new(0),
        };
        let hub = EventHub::new(
            16,
            BackoffConfig {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
            },
        );
        Fixture {
            service: MessageService::new(Arc::new(store), hub),
            alice,
            bob,
            carol,
        }
    }

    async fn viewer_session<S: Storage + 'static>(
        fixture: &Fixture<S>,
        viewer: UserId,
    ) -> ChatSession<S> {
        ChatSession::start(SessionContext { viewer }, fixture.service.clone(), None)
            .await
            .expect("session starts")
    }

    async fn try_next<S: Storage + 'static>(session: &mut ChatSession<S>) -> ChatResult<SessionEvent> {
        timeout(Duration::from_secs(2), session.next_event())
            .await
            .expect("event in time")
            .map(|event| event.expect("inbox open"))
    }

    async fn next<S: Storage + 'static>(session: &mut ChatSession<S>) -> SessionEvent {
        try_next(session).await.expect("event applies")
    }

    async fn next_received<S: Storage + 'static>(session: &mut ChatSession<S>) -> MessageRecord {
        loop {
            if let SessionEvent::MessageReceived(message) = next(session).await {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn send_requires_an_open_conversation() {
        let fixture = fixture().await;
        let mut session = ChatSession::start(
            SessionContext {
                viewer: fixture.bob,
            },
            fixture.service.clone(),
            None,
        )
        .await
        .expect("session starts");

        let error = session.send("hello").await.expect_err("nothing open");
        assert!(matches!(error, ChatError::NoOpenConversation { .. }));
        assert!(session.open_conversation(fixture.bob).await.is_err());
    }

    #[tokio::test]
    async fn stale_history_is_discarded_after_switching() {
        let fixture = fixture().await;
        fixture
            .service
            .send(fixture.alice, fixture.bob, "from alice", None)
            .await
            .expect("seed alice");
        fixture
            .service
            .send(fixture.carol, fixture.bob, "from carol", None)
            .await
            .expect("seed carol");

        let mut session = ChatSession::start(
            SessionContext {
                viewer: fixture.bob,
            },
            fixture.service.clone(),
            None,
        )
        .await
        .expect("session starts");

        session
            .open_conversation(fixture.alice)
            .await
            .expect("open alice");
        session
            .open_conversation(fixture.carol)
            .await
            .expect("open carol");

        match next(&mut session).await {
            SessionEvent::HistoryLoaded {
                counterpart,
                loaded,
            } => {
                assert_eq!(counterpart, fixture.carol);
                assert_eq!(loaded, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let view = session.conversation().expect("carol open");
        assert_eq!(view.counterpart(), fixture.carol);
        assert!(
            view.messages()
                .iter()
                .all(|message| message.sender_id == fixture.carol)
        );
        assert_eq!(session.total_unread(), 0);
    }

    #[tokio::test]
    async fn messages_for_the_open_conversation_are_read_immediately() {
        let fixture = fixture().await;
        let mut session = ChatSession::start(
            SessionContext {
                viewer: fixture.bob,
            },
            fixture.service.clone(),
            None,
        )
        .await
        .expect("session starts");
        session
            .open_conversation(fixture.alice)
            .await
            .expect("open alice");

        fixture
            .service
            .send(fixture.alice, fixture.bob, "are you there?", None)
            .await
            .expect("alice sends");

        loop {
            if let SessionEvent::MessageReceived(_) = next(&mut session).await {
                break;
            }
        }

        assert_eq!(session.unread_count(fixture.alice), 0);
        let unread = fixture
            .service
            .unread_messages(fixture.bob)
            .await
            .expect("unread query");
        assert!(unread.is_empty());
    }

    #[tokio::test]
    async fn close_conversation_drops_pair_deliveries() {
        let fixture = fixture().await;
        let mut session = ChatSession::start(
            SessionContext {
                viewer: fixture.bob,
            },
            fixture.service.clone(),
            None,
        )
        .await
        .expect("session starts");
        session
            .open_conversation(fixture.alice)
            .await
            .expect("open alice");
        session.close_conversation();

        fixture
            .service
            .send(fixture.alice, fixture.bob, "after close", None)
            .await
            .expect("alice sends");

        match next(&mut session).await {
            SessionEvent::MessageReceived(message) => {
                assert_eq!(message.content, "after close");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(session.conversation().is_none());
        assert_eq!(session.unread_count(fixture.alice), 1);
    }

    #[tokio::test]
    async fn in_view_delivery_leaves_no_activity_indicator() {
        let fixture = fixture().await;
        let mut bob = viewer_session(&fixture, fixture.bob).await;
        bob.open_conversation(fixture.alice).await.expect("open alice");

        fixture
            .service
            .send(fixture.alice, fixture.bob, "hi while open", None)
            .await
            .expect("alice sends");
        next_received(&mut bob).await;

        assert!(!bob.list().has_new_activity(fixture.alice));
        let row = bob
            .conversation_list("")
            .into_iter()
            .find(|row| row.user.id == fixture.alice)
            .expect("alice row");
        assert_eq!(row.unread, 0);
        assert!(!row.show_indicator());
    }

    #[tokio::test]
    async fn failed_resync_is_retried_before_further_updates() {
        let fixture = flaky_fixture().await;
        let mut bob = viewer_session(&fixture, fixture.bob).await;

        fixture.service.hub().disconnect();
        for index in 0..3 {
            fixture
                .service
                .send(fixture.alice, fixture.bob, &format!("offline {index}"), None)
                .await
                .expect("offline send");
        }
        fixture.service.store().fail_unread(1);
        fixture.service.hub().reconnect();

        let failed = try_next(&mut bob).await;
        assert!(failed.is_err());
        assert!(bob.is_resync_required());

        fixture
            .service
            .send(fixture.alice, fixture.bob, "back online", None)
            .await
            .expect("live send");
        next_received(&mut bob).await;

        let truth = fixture
            .service
            .store()
            .unread_counts(fixture.bob)
            .await
            .expect("unread counts");
        assert!(!bob.is_resync_required());
        assert_eq!(truth.get(&fixture.alice).copied(), Some(4));
        assert_eq!(bob.unread_count(fixture.alice), 4);
    }

    #[tokio::test]
    async fn failed_in_view_mark_read_still_counts_the_message() {
        let fixture = flaky_fixture().await;
        let mut bob = viewer_session(&fixture, fixture.bob).await;
        bob.open_conversation(fixture.alice).await.expect("open alice");

        fixture.service.store().fail_mark_read(1);
        fixture
            .service
            .send(fixture.alice, fixture.bob, "are you there?", None)
            .await
            .expect("alice sends");
        next_received(&mut bob).await;

        let unread = fixture
            .service
            .unread_messages(fixture.bob)
            .await
            .expect("unread rows");
        assert_eq!(unread.len(), 1);
        assert_eq!(bob.unread_count(fixture.alice), 1);
    }

    #[tokio::test]
    async fn process_pending_keeps_events_applied_before_a_failure() {
        let fixture = flaky_fixture().await;
        let mut bob = viewer_session(&fixture, fixture.bob).await;

        fixture
            .service
            .send(fixture.carol, fixture.bob, "queued first", None)
            .await
            .expect("carol sends");
        sleep(Duration::from_millis(100)).await;

        fixture.service.hub().disconnect();
        fixture.service.store().fail_unread(1);
        fixture.service.hub().reconnect();
        sleep(Duration::from_millis(200)).await;

        assert!(bob.process_pending().await.is_err());
        let events = bob.process_pending().await.expect("retry succeeds");
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::MessageReceived(message) if message.content == "queued first"
        )));
        assert_eq!(bob.unread_count(fixture.carol), 1);
    }

    #[tokio::test]
    async fn open_still_loads_history_when_mark_read_fails() {
        let fixture = flaky_fixture().await;
        fixture
            .service
            .send(fixture.alice, fixture.bob, "waiting for you", None)
            .await
            .expect("seed");
        let mut bob = viewer_session(&fixture, fixture.bob).await;

        fixture.service.store().fail_mark_read(1);
        assert!(bob.open_conversation(fixture.alice).await.is_err());

        match next(&mut bob).await {
            SessionEvent::HistoryLoaded {
                counterpart,
                loaded,
            } => {
                assert_eq!(counterpart, fixture.alice);
                assert_eq!(loaded, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(bob.open_counterpart(), Some(fixture.alice));
        assert_eq!(bob.unread_count(fixture.alice), 1);
    }

    #[tokio::test]
    async fn disabled_notifications_raise_no_alerts() {
        let fixture = fixture().await;
        let (sink, mut alerts) = mpsc::unbounded_channel::<Alert>();
        let config = ChatConfig {
            notifications_enabled: false,
            ..ChatConfig::default()
        };
        let mut bob = ChatSession::start_with_config(
            SessionContext {
                viewer: fixture.bob,
            },
            fixture.service.clone(),
            Some(Arc::new(sink)),
            &config,
        )
        .await
        .expect("session starts");

        fixture
            .service
            .send(fixture.carol, fixture.bob, "ping", None)
            .await
            .expect("carol sends");
        next_received(&mut bob).await;
        sleep(Duration::from_millis(50)).await;

        assert!(alerts.try_recv().is_err());
        assert_eq!(bob.unread_count(fixture.carol), 1);
    }

    #[tokio::test]
    async fn senders_registered_later_join_the_list() {
        let fixture = fixture().await;
        let mut bob = viewer_session(&fixture, fixture.bob).await;

        let dave = fixture
            .service
            .store()
            .create_user(NewUser::new("Dave Okafor", "dokafor"))
            .await
            .expect("dave registers");
        assert!(!bob.list().contains(dave.id));

        fixture
            .service
            .send(dave.id, fixture.bob, "hello, new here", None)
            .await
            .expect("dave sends");
        next_received(&mut bob).await;

        let rows = bob.conversation_list("okafor");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user.id, dave.id);
        assert_eq!(rows[0].unread, 1);
    }
}
