//! Live event channel: a scoped publish/subscribe feed of newly written messages.
//!
//! The hub is the in-process transport. Every published message goes through one
//! broadcast queue, so deliveries inside a scope keep write order. Each
//! subscription runs a pump task that filters by [`Scope`] and forwards matches to
//! the subscriber's sink. When the transport drops, pumps retry with exponential
//! backoff and emit [`Delivery::Resync`] once the feed is back, telling consumers
//! to reconcile against the store.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use parley_storage::{MessageRecord, UserId};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::config::ChatConfig;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Identity of one consumer (a list, a conversation view) holding subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub Uuid);

impl SubscriberId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "sub-{}", self.0)
    }
}

/// Filter predicate selecting which messages a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Messages addressed to one user.
    Recipient(UserId),
    /// Messages in either direction between two users.
    Pair(UserId, UserId),
}

impl Scope {
    /// Builds a pair scope with a canonical participant order.
    pub fn pair(a: UserId, b: UserId) -> Self {
        if a <= b { Self::Pair(a, b) } else { Self::Pair(b, a) }
    }

    pub fn matches(&self, message: &MessageRecord) -> bool {
        match *self {
            Self::Recipient(user_id) => message.receiver_id == user_id,
            Self::Pair(a, b) => message.involves(a, b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Message(MessageRecord),
    /// The feed had a gap; derived state must be rebuilt from the store.
    Resync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub subscription: SubscriptionId,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

type Sink = Arc<dyn Fn(Envelope) + Send + Sync>;

struct SubscriptionState {
    id: SubscriptionId,
    released: AtomicBool,
}

impl SubscriptionState {
    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

struct ActiveEntry {
    state: Arc<SubscriptionState>,
    abort: AbortHandle,
}

struct HubState {
    sender: Option<broadcast::Sender<MessageRecord>>,
    active: HashMap<(SubscriberId, Scope), ActiveEntry>,
}

struct HubInner {
    state: Mutex<HubState>,
    capacity: usize,
    backoff: BackoffConfig,
    next_subscription: AtomicU64,
}

impl HubInner {
    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_receiver(&self) -> Option<broadcast::Receiver<MessageRecord>> {
        self.lock().sender.as_ref().map(broadcast::Sender::subscribe)
    }
}

/// Cloneable handle to the in-process transport.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for EventHub {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EventHub")
            .field("capacity", &self.inner.capacity)
            .field("connected", &self.is_connected())
            .field("active_subscriptions", &self.active_subscriptions())
            .finish()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, BackoffConfig::default())
    }
}

impl EventHub {
    pub fn new(capacity: usize, backoff: BackoffConfig) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    sender: Some(sender),
                    active: HashMap::new(),
                }),
                capacity,
                backoff,
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    /// Sizes the queue and reconnect backoff from `config`.
    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(config.channel_capacity, config.backoff())
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Emits one newly written message. Returns how many pumps received it.
    pub fn publish(&self, message: MessageRecord) -> usize {
        let state = self.inner.lock();
        let Some(sender) = state.sender.as_ref() else {
            tracing::warn!(message_id = %message.id, "transport offline; emission dropped");
            return 0;
        };

        let message_id = message.id;
        let receivers = sender.send(message).unwrap_or(0);
        tracing::debug!(%message_id, receivers, "published message emission");
        receivers
    }

    /// Registers `sink` for every message matching `scope` from now on.
    ///
    /// A subscriber holds at most one subscription per scope: an existing one is
    /// released before the new pump starts. Must be called inside a Tokio runtime.
    pub fn subscribe<F>(&self, subscriber: SubscriberId, scope: Scope, sink: F) -> Subscription
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let state = Arc::new(SubscriptionState {
            id,
            released: AtomicBool::new(false),
        });

        let mut hub_state = self.inner.lock();
        if let Some(previous) = hub_state.active.remove(&(subscriber, scope)) {
            tracing::debug!(
                %subscriber,
                previous = %previous.state.id,
                replacement = %id,
                "releasing previous subscription for scope"
            );
            previous.state.release();
            previous.abort.abort();
        }

        let receiver = hub_state.sender.as_ref().map(broadcast::Sender::subscribe);
        let task = tokio::spawn(run_pump(
            Arc::downgrade(&self.inner),
            scope,
            Arc::clone(&state),
            receiver,
            Arc::new(sink),
            self.inner.backoff,
        ));
        hub_state.active.insert(
            (subscriber, scope),
            ActiveEntry {
                state: Arc::clone(&state),
                abort: task.abort_handle(),
            },
        );
        drop(hub_state);

        tracing::debug!(%subscriber, subscription = %id, ?scope, "subscription established");
        Subscription {
            subscriber,
            scope,
            state,
            task,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Drops the transport. Pumps observe the closure and start retrying.
    pub fn disconnect(&self) {
        if self.inner.lock().sender.take().is_some() {
            tracing::info!("event transport disconnected");
        }
    }

    /// Restores the transport after [`EventHub::disconnect`].
    pub fn reconnect(&self) {
        let mut state = self.inner.lock();
        if state.sender.is_none() {
            let (sender, _) = broadcast::channel(self.inner.capacity);
            state.sender = Some(sender);
            tracing::info!("event transport reconnected");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().sender.is_some()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.lock().active.len()
    }
}

/// Handle for one live subscription. Dropping it has the same effect as
/// [`Subscription::release`].
pub struct Subscription {
    subscriber: SubscriberId,
    scope: Scope,
    state: Arc<SubscriptionState>,
    task: JoinHandle<()>,
    hub: Weak<HubInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("id", &self.state.id)
            .field("subscriber", &self.subscriber)
            .field("scope", &self.scope)
            .field("released", &self.state.is_released())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.state.id
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_released(&self) -> bool {
        self.state.is_released()
    }

    /// Stops delivery. Callbacks already scheduled become no-ops.
    pub fn release(self) {
        drop(self);
    }

    fn teardown(&self) {
        self.state.release();
        self.task.abort();

        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let mut hub_state = hub.lock();
        let key = (self.subscriber, self.scope);
        if hub_state
            .active
            .get(&key)
            .is_some_and(|entry| entry.state.id == self.state.id)
        {
            hub_state.active.remove(&key);
            tracing::debug!(subscription = %self.state.id, "subscription released");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run_pump(
    hub: Weak<HubInner>,
    scope: Scope,
    state: Arc<SubscriptionState>,
    mut receiver: Option<broadcast::Receiver<MessageRecord>>,
    sink: Sink,
    backoff: BackoffConfig,
) {
    let mut delay = backoff.initial;
    let mut resync_pending = receiver.is_none();

    loop {
        if state.is_released() {
            return;
        }

        let Some(active) = receiver.as_mut() else {
            tokio::time::sleep(delay).await;
            delay = backoff.next(delay);
            let Some(hub) = hub.upgrade() else {
                return;
            };
            receiver = hub.open_receiver();
            if receiver.is_some() {
                tracing::info!(subscription = %state.id, "subscription re-established");
            }
            continue;
        };

        if resync_pending {
            resync_pending = false;
            delay = backoff.initial;
            deliver(&state, &sink, Delivery::Resync);
        }

        match active.recv().await {
            Ok(message) => {
                if scope.matches(&message) {
                    deliver(&state, &sink, Delivery::Message(message));
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(subscription = %state.id, skipped, "subscriber lagged behind feed");
                deliver(&state, &sink, Delivery::Resync);
            }
            Err(RecvError::Closed) => {
                tracing::warn!(subscription = %state.id, "event transport dropped; retrying");
                receiver = None;
                resync_pending = true;
            }
        }
    }
}

fn deliver(state: &SubscriptionState, sink: &Sink, delivery: Delivery) {
    if state.is_released() {
        return;
    }

    sink(Envelope {
        subscription: state.id,
        delivery,
    });
}
