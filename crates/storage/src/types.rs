use chrono::{DateTime, Utc};

use super::ids::{MessageId, UserId};

/// One direct message between two users.
///
/// Rows are immutable once written except for `is_read`, which only moves from
/// `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub reply_to: Option<MessageId>,
    pub is_read: bool,
}

impl MessageRecord {
    /// Total display order inside one conversation.
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id)
    }

    /// Returns the other participant relative to `viewer`, or `None` when the
    /// viewer is not part of this message.
    pub fn counterpart_of(&self, viewer: UserId) -> Option<UserId> {
        if self.sender_id == viewer {
            Some(self.receiver_id)
        } else if self.receiver_id == viewer {
            Some(self.sender_id)
        } else {
            None
        }
    }

    /// True when the unordered participant pair is `{a, b}`.
    pub fn involves(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
    pub reply_to: Option<MessageId>,
}

impl NewMessage {
    pub fn new(sender_id: UserId, receiver_id: UserId, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            receiver_id,
            content: content.into(),
            reply_to: None,
        }
    }

    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

/// Outcome of marking a conversation as read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadReceipt {
    pub marked: u64,
    // Highest id flipped by this call; redelivered emissions at or below it are stale.
    pub last_marked: Option<MessageId>,
}

/// One unread row addressed to a viewer, used to rebuild unread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnreadMessage {
    pub sender_id: UserId,
    pub message_id: MessageId,
}

/// Directory row for one member of the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub full_name: String,
    pub username: String,
    pub department: Option<String>,
    pub graduation_year: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub full_name: String,
    pub username: String,
    pub department: Option<String>,
    pub graduation_year: Option<i32>,
}

impl NewUser {
    pub fn new(full_name: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            username: username.into(),
            department: None,
            graduation_year: None,
        }
    }

    pub fn with_cohort(mut self, department: impl Into<String>, graduation_year: i32) -> Self {
        self.department = Some(department.into());
        self.graduation_year = Some(graduation_year);
        self
    }
}
