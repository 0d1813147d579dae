use std::collections::{BTreeSet, HashMap};

use parley_storage::{MessageId, MessageRecord, MessageStore, ReadReceipt, UnreadMessage, UserId};

use crate::error::ChatResult;
use crate::service::MessageService;

/// Per-counterpart unread state for one viewer.
///
/// Counts are the sizes of per-counterpart id sets, so a message delivered twice
/// is still counted once. The store stays authoritative: [`UnreadTracker::reconcile`]
/// replaces everything with a fresh query.
#[derive(Debug, Clone)]
pub struct UnreadTracker {
    viewer: UserId,
    unread: HashMap<UserId, BTreeSet<MessageId>>,
    // Highest id known to be read per counterpart; emissions at or below it are redeliveries.
    read_watermarks: HashMap<UserId, MessageId>,
}

impl UnreadTracker {
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            unread: HashMap::new(),
            read_watermarks: HashMap::new(),
        }
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    /// Replaces tracked state with the given unread rows.
    pub fn rebuild(&mut self, rows: impl IntoIterator<Item = UnreadMessage>) {
        self.unread.clear();
        for row in rows {
            self.unread
                .entry(row.sender_id)
                .or_default()
                .insert(row.message_id);
        }
        tracing::debug!(viewer = %self.viewer, total = self.total(), "unread state rebuilt");
    }

    pub async fn reconcile<S>(&mut self, service: &MessageService<S>) -> ChatResult<()>
    where
        S: MessageStore + 'static,
    {
        let rows = service.unread_messages(self.viewer).await?;
        self.rebuild(rows);
        Ok(())
    }

    /// Counts a newly delivered message. Returns true when the count changed.
    pub fn on_emission(&mut self, message: &MessageRecord) -> bool {
        if message.receiver_id != self.viewer || message.sender_id == self.viewer || message.is_read
        {
            return false;
        }
        if self
            .read_watermarks
            .get(&message.sender_id)
            .is_some_and(|watermark| message.id <= *watermark)
        {
            tracing::trace!(message_id = %message.id, "ignoring redelivered read message");
            return false;
        }

        self.unread
            .entry(message.sender_id)
            .or_default()
            .insert(message.id)
    }

    /// Zeroes the counterpart after its conversation was marked read.
    pub fn clear(&mut self, counterpart: UserId, receipt: ReadReceipt) {
        let local_max = self
            .unread
            .remove(&counterpart)
            .and_then(|ids| ids.last().copied());
        let watermark = local_max.max(receipt.last_marked);
        if let Some(watermark) = watermark {
            let entry = self.read_watermarks.entry(counterpart).or_insert(watermark);
            *entry = (*entry).max(watermark);
        }
    }

    pub fn count(&self, counterpart: UserId) -> u64 {
        self.unread
            .get(&counterpart)
            .map_or(0, |ids| ids.len() as u64)
    }

    pub fn total(&self) -> u64 {
        self.unread.values().map(|ids| ids.len() as u64).sum()
    }

    pub fn counts(&self) -> HashMap<UserId, u64> {
        self.unread
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(counterpart, ids)| (*counterpart, ids.len() as u64))
            .collect()
    }
}
