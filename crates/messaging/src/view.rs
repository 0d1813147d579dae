use std::collections::HashMap;
use std::fmt::Display;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parley_storage::{MessageId, MessageRecord, UserId};

use crate::error::{ChatResult, ReplyTargetUnavailableSnafu};

pub const TODAY_LABEL: &str = "Today";
pub const YESTERDAY_LABEL: &str = "Yesterday";
const DATE_LABEL_FORMAT: &str = "%b %d, %Y";
const TIME_LABEL_FORMAT: &str = "%I:%M %p";

/// Quoted copy of the message another message replies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepliedPreview {
    pub id: MessageId,
    pub sender_id: UserId,
    pub content: String,
}

impl RepliedPreview {
    fn of(message: &MessageRecord) -> Self {
        Self {
            id: message.id,
            sender_id: message.sender_id,
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    pub message: MessageRecord,
    pub is_own: bool,
    /// Absent when the target is outside the loaded window.
    pub replied: Option<RepliedPreview>,
    pub time_label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateGroup {
    pub date: NaiveDate,
    pub label: String,
    pub entries: Vec<MessageEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationModel {
    pub viewer: UserId,
    pub counterpart: UserId,
    pub groups: Vec<DateGroup>,
    pub pending_reply: Option<RepliedPreview>,
}

impl ConversationModel {
    pub fn labels(&self) -> Vec<&str> {
        self.groups.iter().map(|group| group.label.as_str()).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &MessageEntry> {
        self.groups.iter().flat_map(|group| group.entries.iter())
    }

    pub fn entry(&self, message_id: MessageId) -> Option<&MessageEntry> {
        self.entries().find(|entry| entry.message.id == message_id)
    }
}

/// Loaded window of one two-party conversation, kept in `(timestamp, id)` order.
#[derive(Debug, Clone)]
pub struct ConversationView {
    viewer: UserId,
    counterpart: UserId,
    messages: Vec<MessageRecord>,
    // Timestamp per loaded id, enough to rebuild the order key for a binary search.
    loaded: HashMap<MessageId, DateTime<Utc>>,
    pending_reply: Option<MessageId>,
}

impl ConversationView {
    pub fn new(viewer: UserId, counterpart: UserId) -> Self {
        Self {
            viewer,
            counterpart,
            messages: Vec::new(),
            loaded: HashMap::new(),
            pending_reply: None,
        }
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    pub fn counterpart(&self) -> UserId {
        self.counterpart
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn find(&self, message_id: MessageId) -> Option<&MessageRecord> {
        self.position(message_id)
            .map(|position| &self.messages[position])
    }

    fn position(&self, message_id: MessageId) -> Option<usize> {
        let timestamp = *self.loaded.get(&message_id)?;
        self.messages
            .binary_search_by_key(&(timestamp, message_id), MessageRecord::order_key)
            .ok()
    }

    /// Merges a history snapshot. Returns how many messages were new.
    pub fn load_history(&mut self, history: impl IntoIterator<Item = MessageRecord>) -> usize {
        history
            .into_iter()
            .filter(|message| self.insert(message.clone()))
            .count()
    }

    /// Applies a live emission. Returns false for other conversations and duplicates.
    pub fn apply_emission(&mut self, message: MessageRecord) -> bool {
        self.insert(message)
    }

    /// Appends the viewer's own freshly sent message without waiting for the feed.
    pub fn append_own(&mut self, message: MessageRecord) -> bool {
        self.insert(message)
    }

    fn insert(&mut self, message: MessageRecord) -> bool {
        if !message.involves(self.viewer, self.counterpart) {
            return false;
        }

        if self.loaded.contains_key(&message.id) {
            // Read flags only move forward, so a later copy may carry is_read = true.
            if message.is_read
                && let Some(position) = self.position(message.id)
            {
                self.messages[position].is_read = true;
            }
            return false;
        }

        let key = message.order_key();
        let position = self
            .messages
            .partition_point(|existing| existing.order_key() < key);
        self.loaded.insert(message.id, message.timestamp);
        self.messages.insert(position, message);
        true
    }

    /// Marks every loaded message from the counterpart as read.
    pub fn mark_counterpart_read(&mut self) {
        for message in &mut self.messages {
            if message.sender_id == self.counterpart {
                message.is_read = true;
            }
        }
    }

    pub fn reply_to(&mut self, message_id: MessageId) -> ChatResult<&MessageRecord> {
        if !self.loaded.contains_key(&message_id) {
            return ReplyTargetUnavailableSnafu {
                stage: "view-reply-to",
                message_id,
            }
            .fail();
        }

        self.pending_reply = Some(message_id);
        self.find(message_id).ok_or_else(|| {
            ReplyTargetUnavailableSnafu {
                stage: "view-reply-to-lookup",
                message_id,
            }
            .build()
        })
    }

    pub fn cancel_reply(&mut self) {
        self.pending_reply = None;
    }

    pub fn pending_reply(&self) -> Option<&MessageRecord> {
        self.pending_reply.and_then(|message_id| self.find(message_id))
    }

    pub fn take_reply(&mut self) -> Option<MessageId> {
        self.pending_reply.take()
    }

    pub fn reply_banner(&self) -> Option<String> {
        self.pending_reply()
            .map(|message| format!("Replying to: {}", message.content))
    }

    /// Builds the date-grouped rendering model relative to `now`, using the
    /// timezone of `now` as the viewer's local time.
    pub fn build<Tz>(&self, now: &DateTime<Tz>) -> ConversationModel
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let timezone = now.timezone();
        let today = now.date_naive();
        let mut groups: Vec<DateGroup> = Vec::new();

        for message in &self.messages {
            let local = message.timestamp.with_timezone(&timezone);
            let date = local.date_naive();
            let entry = MessageEntry {
                message: message.clone(),
                is_own: message.sender_id == self.viewer,
                replied: message
                    .reply_to
                    .and_then(|target| self.find(target))
                    .map(RepliedPreview::of),
                time_label: local.format(TIME_LABEL_FORMAT).to_string(),
            };

            match groups.last_mut() {
                Some(group) if group.date == date => group.entries.push(entry),
                _ => groups.push(DateGroup {
                    date,
                    label: date_label(date, today),
                    entries: vec![entry],
                }),
            }
        }

        ConversationModel {
            viewer: self.viewer,
            counterpart: self.counterpart,
            groups,
            pending_reply: self.pending_reply().map(RepliedPreview::of),
        }
    }
}

pub fn date_label(date: NaiveDate, today: NaiveDate) -> String {
    if date == today {
        TODAY_LABEL.to_string()
    } else if today.pred_opt() == Some(date) {
        YESTERDAY_LABEL.to_string()
    } else {
        date.format(DATE_LABEL_FORMAT).to_string()
    }
}
