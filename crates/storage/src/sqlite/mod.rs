use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageResult, ValidationSnafu,
};
use super::ids::{MessageId, UserId};
use super::types::{
    MessageRecord, NewMessage, NewUser, ReadReceipt, UnreadMessage, UserRecord,
};
use super::{MessageStore, UserStore};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, content, timestamp_ms, reply_to, is_read";
const USER_COLUMNS: &str = "id, full_name, username, department, graduation_year";

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let mut connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(5_000));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // A single long-lived connection serializes writes and keeps in-memory databases alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite message store ready");
        Ok(Self { pool, database_url })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }
}

#[async_trait]
impl MessageStore for SqliteStorage {
    async fn send(&self, input: NewMessage) -> StorageResult<MessageRecord> {
        let content = input.content.trim().to_string();
        if content.is_empty() {
            return ValidationSnafu {
                stage: "message-send-validate-content",
                details: "message content must not be empty".to_string(),
            }
            .fail();
        }
        if input.sender_id == input.receiver_id {
            return ValidationSnafu {
                stage: "message-send-validate-participants",
                details: format!("user '{}' cannot message themselves", input.sender_id),
            }
            .fail();
        }

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-send-begin",
        })?;

        if let Some(reply_to) = input.reply_to {
            let target = sqlx::query_as::<_, (i64, i64)>(
                "SELECT sender_id, receiver_id FROM messages WHERE id = ?",
            )
            .bind(reply_to.get())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-send-load-reply-target",
            })?;

            // A reply may only point inside the same two-party conversation.
            let in_scope = target.is_some_and(|(sender, receiver)| {
                let (sender, receiver) = (UserId::new(sender), UserId::new(receiver));
                (sender == input.sender_id && receiver == input.receiver_id)
                    || (sender == input.receiver_id && receiver == input.sender_id)
            });
            if !in_scope {
                return NotFoundSnafu {
                    stage: "message-send-reply-target-missing",
                    entity: "message",
                    id: reply_to.to_string(),
                }
                .fail();
            }
        }

        // Timestamps never decrease with id, so the newest row carries the maximum.
        let latest_timestamp = sqlx::query_scalar::<_, i64>(
            "SELECT timestamp_ms FROM messages ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-send-latest-timestamp",
        })?;
        // Clock skew must never move a new message before an existing one.
        let timestamp_ms = unix_timestamp_millis().max(latest_timestamp.unwrap_or(0));

        let inserted = sqlx::query(
            "INSERT INTO messages (sender_id, receiver_id, content, timestamp_ms, reply_to, is_read) VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(input.sender_id.get())
        .bind(input.receiver_id.get())
        .bind(content.clone())
        .bind(timestamp_ms)
        .bind(input.reply_to.map(|id| id.get()))
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-send-insert",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-send-commit",
        })?;

        Ok(MessageRecord {
            id: MessageId::new(inserted.last_insert_rowid()),
            sender_id: input.sender_id,
            receiver_id: input.receiver_id,
            content,
            timestamp: millis_to_datetime(timestamp_ms, "message-send-timestamp")?,
            reply_to: input.reply_to,
            is_read: false,
        })
    }

    async fn history(&self, user_a: UserId, user_b: UserId) -> StorageResult<Vec<MessageRecord>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE (sender_id = ? AND receiver_id = ?) OR (sender_id = ? AND receiver_id = ?) ORDER BY timestamp_ms ASC, id ASC"
        ))
        .bind(user_a.get())
        .bind(user_b.get())
        .bind(user_b.get())
        .bind(user_a.get())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-history-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn get_message(&self, message_id: MessageId) -> StorageResult<Option<MessageRecord>> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id.get())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-get-query",
        })?;

        row.map(message_row_to_record).transpose()
    }

    async fn mark_read(&self, viewer: UserId, counterpart: UserId) -> StorageResult<ReadReceipt> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-mark-read-begin",
        })?;

        let last_unread = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(id) FROM messages WHERE receiver_id = ? AND sender_id = ? AND is_read = 0",
        )
        .bind(viewer.get())
        .bind(counterpart.get())
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-mark-read-last-unread",
        })?;

        let Some(last_unread) = last_unread else {
            return Ok(ReadReceipt::default());
        };

        let updated = sqlx::query(
            "UPDATE messages SET is_read = 1 WHERE receiver_id = ? AND sender_id = ? AND is_read = 0 AND id <= ?",
        )
        .bind(viewer.get())
        .bind(counterpart.get())
        .bind(last_unread)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-mark-read-update",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-mark-read-commit",
        })?;

        Ok(ReadReceipt {
            marked: updated.rows_affected(),
            last_marked: Some(MessageId::new(last_unread)),
        })
    }

    async fn unread_messages(&self, viewer: UserId) -> StorageResult<Vec<UnreadMessage>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT sender_id, id FROM messages WHERE receiver_id = ? AND is_read = 0 ORDER BY id ASC",
        )
        .bind(viewer.get())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-unread-query",
        })?;

        Ok(rows
            .into_iter()
            .map(|(sender_id, message_id)| UnreadMessage {
                sender_id: UserId::new(sender_id),
                message_id: MessageId::new(message_id),
            })
            .collect())
    }

    async fn unread_counts(&self, viewer: UserId) -> StorageResult<HashMap<UserId, u64>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT sender_id, COUNT(*) FROM messages WHERE receiver_id = ? AND is_read = 0 GROUP BY sender_id",
        )
        .bind(viewer.get())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-unread-counts-query",
        })?;

        rows.into_iter()
            .map(|(sender_id, count)| {
                Ok((
                    UserId::new(sender_id),
                    i64_to_u64(count, "message-unread-counts-count")?,
                ))
            })
            .collect()
    }

    async fn last_contacts(
        &self,
        viewer: UserId,
    ) -> StorageResult<HashMap<UserId, DateTime<Utc>>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT CASE WHEN sender_id = ? THEN receiver_id ELSE sender_id END AS counterpart_id, MAX(timestamp_ms) FROM messages WHERE sender_id = ? OR receiver_id = ? GROUP BY counterpart_id",
        )
        .bind(viewer.get())
        .bind(viewer.get())
        .bind(viewer.get())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-last-contacts-query",
        })?;

        rows.into_iter()
            .map(|(counterpart_id, timestamp_ms)| {
                Ok((
                    UserId::new(counterpart_id),
                    millis_to_datetime(timestamp_ms, "message-last-contacts-timestamp")?,
                ))
            })
            .collect()
    }
}

#[async_trait]
impl UserStore for SqliteStorage {
    async fn create_user(&self, input: NewUser) -> StorageResult<UserRecord> {
        let full_name = input.full_name.trim().to_string();
        let username = input.username.trim().to_string();
        if full_name.is_empty() || username.is_empty() {
            return ValidationSnafu {
                stage: "user-create-validate",
                details: "full name and username are required".to_string(),
            }
            .fail();
        }

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "user-create-begin",
        })?;

        let taken = sqlx::query_scalar::<_, i64>("SELECT 1 FROM users WHERE username = ? LIMIT 1")
            .bind(username.clone())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "user-create-username-taken",
            })?;
        if taken.is_some() {
            return ConflictSnafu {
                stage: "user-create-username-taken",
                entity: "user",
                details: format!("username '{username}' is already registered"),
            }
            .fail();
        }

        let inserted = sqlx::query(
            "INSERT INTO users (full_name, username, department, graduation_year, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(full_name.clone())
        .bind(username.clone())
        .bind(input.department.clone())
        .bind(input.graduation_year)
        .bind(unix_timestamp_millis())
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "user-create-insert",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "user-create-commit",
        })?;

        Ok(UserRecord {
            id: UserId::new(inserted.last_insert_rowid()),
            full_name,
            username,
            department: input.department,
            graduation_year: input.graduation_year,
        })
    }

    async fn get_user(&self, user_id: UserId) -> StorageResult<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(user_id.get())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "user-get-query",
        })?;

        Ok(row.map(user_row_to_record))
    }

    async fn list_users(&self) -> StorageResult<Vec<UserRecord>> {
        let rows = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "user-list-query",
        })?;

        Ok(rows.into_iter().map(user_row_to_record).collect())
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    sender_id: i64,
    receiver_id: i64,
    content: String,
    timestamp_ms: i64,
    reply_to: Option<i64>,
    is_read: i64,
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: i64,
    full_name: String,
    username: String,
    department: Option<String>,
    graduation_year: Option<i32>,
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::new(row.id),
        sender_id: UserId::new(row.sender_id),
        receiver_id: UserId::new(row.receiver_id),
        content: row.content,
        timestamp: millis_to_datetime(row.timestamp_ms, "message-row-timestamp")?,
        reply_to: row.reply_to.map(MessageId::new),
        is_read: row.is_read != 0,
    })
}

fn user_row_to_record(row: UserRow) -> UserRecord {
    UserRecord {
        id: UserId::new(row.id),
        full_name: row.full_name,
        username: row.username,
        department: row.department,
        graduation_year: row.graduation_year,
    }
}

fn unix_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(value: i64, stage: &'static str) -> StorageResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(value).context(InvariantViolationSnafu {
        stage,
        details: format!("sqlite timestamp '{value}' is out of range"),
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    const ALICE: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);
    const CAROL: UserId = UserId::new(3);

    async fn memory_store() -> SqliteStorage {
        SqliteStorage::open(":memory:")
            .await
            .expect("in-memory store opens")
    }

    #[tokio::test]
    async fn send_assigns_increasing_ids_and_history_orders_them() {
        let store = memory_store().await;
        let first = store
            .send(NewMessage::new(ALICE, BOB, "Hi"))
            .await
            .expect("first send");
        let second = store
            .send(NewMessage::new(BOB, ALICE, "Hey there"))
            .await
            .expect("second send");
        store
            .send(NewMessage::new(ALICE, CAROL, "unrelated"))
            .await
            .expect("third send");

        assert!(second.id > first.id);
        assert!(second.timestamp >= first.timestamp);

        let history = store.history(BOB, ALICE).await.expect("history");
        let ids = history.iter().map(|message| message.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(history.iter().all(|message| message.involves(ALICE, BOB)));
    }

    #[tokio::test]
    async fn send_never_stamps_before_the_newest_row() {
        let store = memory_store().await;
        let future_ms = unix_timestamp_millis() + 3_600_000;
        sqlx::query(
            "INSERT INTO messages (sender_id, receiver_id, content, timestamp_ms, is_read) VALUES (?, ?, 'skewed', ?, 0)",
        )
        .bind(ALICE.get())
        .bind(BOB.get())
        .bind(future_ms)
        .execute(store.pool())
        .await
        .expect("insert skewed row");

        let next = store
            .send(NewMessage::new(BOB, ALICE, "after skew"))
            .await
            .expect("send after skew");
        assert_eq!(next.timestamp.timestamp_millis(), future_ms);

        let history = store.history(ALICE, BOB).await.expect("history");
        assert_eq!(history.last().map(|message| message.id), Some(next.id));
    }

    #[tokio::test]
    async fn send_rejects_blank_and_self_addressed_messages() {
        let store = memory_store().await;

        let blank = store
            .send(NewMessage::new(ALICE, BOB, "   "))
            .await
            .expect_err("blank content is rejected");
        assert_eq!(blank.kind(), ErrorKind::Validation);

        let to_self = store
            .send(NewMessage::new(ALICE, ALICE, "note to self"))
            .await
            .expect_err("self-addressed message is rejected");
        assert_eq!(to_self.kind(), ErrorKind::Validation);

        assert!(store.history(ALICE, BOB).await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn reply_target_must_belong_to_the_same_pair() {
        let store = memory_store().await;
        let original = store
            .send(NewMessage::new(ALICE, BOB, "Hello"))
            .await
            .expect("original");
        let elsewhere = store
            .send(NewMessage::new(ALICE, CAROL, "Hello Carol"))
            .await
            .expect("other conversation");

        let reply = store
            .send(NewMessage::new(BOB, ALICE, "Hi back").replying_to(original.id))
            .await
            .expect("reply inside the pair");
        assert_eq!(reply.reply_to, Some(original.id));

        let cross = store
            .send(NewMessage::new(BOB, ALICE, "wrong thread").replying_to(elsewhere.id))
            .await
            .expect_err("reply outside the pair is rejected");
        assert_eq!(cross.kind(), ErrorKind::NotFound);

        let missing = store
            .send(NewMessage::new(BOB, ALICE, "ghost").replying_to(MessageId::new(999)))
            .await
            .expect_err("reply to a missing message is rejected");
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_scoped_to_the_sender() {
        let store = memory_store().await;
        store.send(NewMessage::new(ALICE, BOB, "one")).await.expect("send");
        let last = store.send(NewMessage::new(ALICE, BOB, "two")).await.expect("send");
        store.send(NewMessage::new(CAROL, BOB, "three")).await.expect("send");

        let receipt = store.mark_read(BOB, ALICE).await.expect("mark read");
        assert_eq!(receipt.marked, 2);
        assert_eq!(receipt.last_marked, Some(last.id));

        let again = store.mark_read(BOB, ALICE).await.expect("mark read again");
        assert_eq!(again, ReadReceipt::default());

        let counts = store.unread_counts(BOB).await.expect("counts");
        assert_eq!(counts.get(&ALICE), None);
        assert_eq!(counts.get(&CAROL), Some(&1));
    }

    #[tokio::test]
    async fn read_flag_and_content_cannot_be_rewritten() {
        let store = memory_store().await;
        let message = store.send(NewMessage::new(ALICE, BOB, "hi")).await.expect("send");
        store.mark_read(BOB, ALICE).await.expect("mark read");

        let revert = sqlx::query("UPDATE messages SET is_read = 0 WHERE id = ?")
            .bind(message.id.get())
            .execute(store.pool())
            .await;
        assert!(revert.is_err());

        let rewrite = sqlx::query("UPDATE messages SET content = 'edited' WHERE id = ?")
            .bind(message.id.get())
            .execute(store.pool())
            .await;
        assert!(rewrite.is_err());
    }

    #[tokio::test]
    async fn last_contacts_cover_both_directions() {
        let store = memory_store().await;
        store.send(NewMessage::new(ALICE, BOB, "to bob")).await.expect("send");
        let latest = store
            .send(NewMessage::new(ALICE, CAROL, "to carol"))
            .await
            .expect("send");

        let contacts = store.last_contacts(ALICE).await.expect("contacts");
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts.get(&CAROL), Some(&latest.timestamp));

        let carol_view = store.last_contacts(CAROL).await.expect("contacts");
        assert_eq!(carol_view.get(&ALICE), Some(&latest.timestamp));
    }

    #[tokio::test]
    async fn users_are_listed_and_usernames_are_unique() {
        let store = memory_store().await;
        let alice = store
            .create_user(NewUser::new("Alice Liddell", "alice").with_cohort("Mathematics", 2019))
            .await
            .expect("create alice");
        store
            .create_user(NewUser::new("Bob Builder", "bob"))
            .await
            .expect("create bob");

        let duplicate = store
            .create_user(NewUser::new("Another Alice", "alice"))
            .await
            .expect_err("duplicate username");
        assert_eq!(duplicate.kind(), ErrorKind::Validation);

        let fetched = store.get_user(alice.id).await.expect("get").expect("exists");
        assert_eq!(fetched.graduation_year, Some(2019));
        assert_eq!(store.list_users().await.expect("list").len(), 2);
    }
}
