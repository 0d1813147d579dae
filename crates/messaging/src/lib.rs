pub mod channel;
pub mod config;
pub mod error;
pub mod list;
pub mod notifier;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod unread;
pub mod view;

pub use channel::{
    BackoffConfig, DEFAULT_CHANNEL_CAPACITY, Delivery, Envelope, EventHub, Scope, SubscriberId,
    Subscription, SubscriptionId,
};
pub use config::{ChatConfig, ConfigError, ConfigStore};
pub use error::{ChatError, ChatResult};
pub use list::{ContactRow, ConversationList};
pub use notifier::{Alert, AlertSink, DisplayName, Notifier, UserDirectory};
pub use service::MessageService;
pub use session::{ChatSession, SessionContext, SessionEvent};
pub use unread::UnreadTracker;
pub use view::{ConversationModel, ConversationView, DateGroup, MessageEntry, RepliedPreview};

pub use parley_storage as storage;
