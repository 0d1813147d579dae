use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parley_storage::{MessageRecord, UserId, UserRecord};

use crate::unread::UnreadTracker;

/// One counterpart in the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRow {
    pub user: UserRecord,
    pub last_contact: Option<DateTime<Utc>>,
    pub unread: u64,
    pub has_new_activity: bool,
}

impl ContactRow {
    pub fn show_indicator(&self) -> bool {
        self.has_new_activity || self.unread > 0
    }

    /// Numeric badge; a single unread message only lights the indicator.
    pub fn badge(&self) -> Option<u64> {
        (self.unread > 1).then_some(self.unread)
    }

    pub fn subtitle(&self) -> Option<String> {
        let department = self
            .user
            .department
            .as_deref()
            .map(str::trim)
            .filter(|department| !department.is_empty());
        let cohort = self
            .user
            .graduation_year
            .map(|year| format!("Class of {year}"));

        match (department, cohort) {
            (Some(department), Some(cohort)) => Some(format!("{department} · {cohort}")),
            (Some(department), None) => Some(department.to_string()),
            (None, cohort) => cohort,
        }
    }

    fn matches(&self, needle: &str) -> bool {
        self.user.full_name.to_lowercase().contains(needle)
            || self.user.username.to_lowercase().contains(needle)
    }
}

/// Recency-ordered directory of counterparts for one viewer.
#[derive(Debug, Clone)]
pub struct ConversationList {
    viewer: UserId,
    contacts: HashMap<UserId, UserRecord>,
    last_contact: HashMap<UserId, DateTime<Utc>>,
    new_activity: HashSet<UserId>,
}

impl ConversationList {
    pub fn new(viewer: UserId, directory: impl IntoIterator<Item = UserRecord>) -> Self {
        let contacts = directory
            .into_iter()
            .filter(|user| user.id != viewer)
            .map(|user| (user.id, user))
            .collect();
        Self {
            viewer,
            contacts,
            last_contact: HashMap::new(),
            new_activity: HashSet::new(),
        }
    }

    pub fn viewer(&self) -> UserId {
        self.viewer
    }

    pub fn upsert_contact(&mut self, user: UserRecord) {
        if user.id != self.viewer {
            self.contacts.insert(user.id, user);
        }
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.contacts.contains_key(&user_id)
    }

    pub fn replace_last_contacts(&mut self, last_contact: HashMap<UserId, DateTime<Utc>>) {
        self.last_contact = last_contact;
        self.last_contact.remove(&self.viewer);
    }

    /// Applies a live emission. Returns the counterpart it touched.
    pub fn on_emission(&mut self, message: &MessageRecord) -> Option<UserId> {
        let counterpart = message.counterpart_of(self.viewer)?;
        self.touch(counterpart, message.timestamp);
        if message.sender_id != self.viewer {
            self.new_activity.insert(counterpart);
        }
        Some(counterpart)
    }

    /// Records contact at `at`, keeping the latest timestamp seen.
    pub fn touch(&mut self, counterpart: UserId, at: DateTime<Utc>) {
        if counterpart == self.viewer {
            return;
        }
        self.last_contact
            .entry(counterpart)
            .and_modify(|current| *current = (*current).max(at))
            .or_insert(at);
    }

    pub fn open(&mut self, counterpart: UserId) {
        self.new_activity.remove(&counterpart);
    }

    pub fn has_new_activity(&self, counterpart: UserId) -> bool {
        self.new_activity.contains(&counterpart)
    }

    pub fn last_contact(&self, counterpart: UserId) -> Option<DateTime<Utc>> {
        self.last_contact.get(&counterpart).copied()
    }

    /// Builds rows ordered by most recent contact, then filters by `query`.
    pub fn rows(&self, tracker: &UnreadTracker, query: &str) -> Vec<ContactRow> {
        let mut rows = self
            .contacts
            .values()
            .map(|user| ContactRow {
                user: user.clone(),
                last_contact: self.last_contact(user.id),
                unread: tracker.count(user.id),
                has_new_activity: self.has_new_activity(user.id),
            })
            .collect::<Vec<_>>();

        // `None` orders below every timestamp, so reversed it lands last.
        rows.sort_by_key(|row| (Reverse(row.last_contact), row.user.id));

        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return rows;
        }
        rows.retain(|row| row.matches(&needle));
        rows
    }
}
