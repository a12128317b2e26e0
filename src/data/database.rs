//! SQLite database operations
//!
//! All database access goes through this module.
//! Every committed write to a watched table is published on the
//! [`ChangeFeed`] after the statement succeeds.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::path::Path;

use super::feed::{ChangeEvent, ChangeFeed, ChangeKind};
use super::models::*;
use crate::error::AppError;

const CLUB_MESSAGE_COLUMNS: &str = r#"
    SELECT m.id, m.text, m.sender_id, NULL AS receiver_id, m.club_id AS conversation_id,
           m.created_at, p.display_name AS sender_name
    FROM club_chat_messages m
    LEFT JOIN profiles p ON p.id = m.sender_id
"#;

const DIRECT_MESSAGE_COLUMNS: &str = r#"
    SELECT m.id, m.text, m.sender_id, m.receiver_id, m.conversation_id,
           m.created_at, p.display_name AS sender_name
    FROM direct_messages m
    LEFT JOIN profiles p ON p.id = m.sender_id
"#;

fn message_select(kind: ConversationKind) -> (&'static str, &'static str) {
    match kind {
        ConversationKind::Club => (CLUB_MESSAGE_COLUMNS, "m.club_id"),
        ConversationKind::Dm => (DIRECT_MESSAGE_COLUMNS, "m.conversation_id"),
    }
}

fn read_table(kind: ConversationKind) -> (&'static str, &'static str) {
    match kind {
        ConversationKind::Club => ("club_messages_read", "club_id"),
        ConversationKind::Dm => ("direct_messages_read", "conversation_id"),
    }
}

/// Database connection pool wrapper.
pub struct Database {
    pub(super) pool: Pool<Sqlite>,
    feed: ChangeFeed,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    /// * `feed` - Change feed that receives committed writes
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path, feed: ChangeFeed) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool, feed })
    }

    /// The change feed this database publishes to.
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    // =========================================================================
    // Profiles
    // =========================================================================

    /// Create or rename a user profile
    pub async fn upsert_profile(&self, user_id: &str, display_name: &str) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO profiles (id, display_name) VALUES (?, ?) \
             ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name",
        )
        .bind(user_id)
        .bind(display_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // =========================================================================
    // Clubs & membership
    // =========================================================================

    /// Create a club with `owner_id` as its first member
    pub async fn create_club(&self, name: &str, owner_id: &str) -> Result<Club, AppError> {
        let club = Club {
            id: EntityId::new().0,
            name: name.to_string(),
            created_at: Utc::now(),
        };

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO clubs (id, name, created_at) VALUES (?, ?, ?)")
            .bind(&club.id)
            .bind(&club.name)
            .bind(club.created_at)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO club_members (club_id, user_id, joined_at) VALUES (?, ?, ?)")
            .bind(&club.id)
            .bind(owner_id)
            .bind(club.created_at)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.feed.publish(ChangeEvent::membership(
            ChangeKind::Insert,
            owner_id,
            ConversationKey::club(club.id.clone()),
        ));

        Ok(club)
    }

    pub async fn get_club(&self, club_id: &str) -> Result<Option<Club>, AppError> {
        let club = sqlx::query_as::<_, Club>("SELECT id, name, created_at FROM clubs WHERE id = ?")
            .bind(club_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(club)
    }

    /// Add a member to a club
    ///
    /// # Returns
    /// `true` if the user was not already a member
    pub async fn join_club(&self, club_id: &str, user_id: &str) -> Result<bool, AppError> {
        if self.get_club(club_id).await?.is_none() {
            return Err(AppError::NotFound);
        }

        let result = sqlx::query(
            "INSERT INTO club_members (club_id, user_id, joined_at) VALUES (?, ?, ?) \
             ON CONFLICT(club_id, user_id) DO NOTHING",
        )
        .bind(club_id)
        .bind(user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let joined = result.rows_affected() > 0;
        if joined {
            self.feed.publish(ChangeEvent::membership(
                ChangeKind::Insert,
                user_id,
                ConversationKey::club(club_id),
            ));
        }

        Ok(joined)
    }

    /// Remove a member from a club
    ///
    /// # Returns
    /// `true` if the user was a member
    pub async fn leave_club(&self, club_id: &str, user_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM club_members WHERE club_id = ? AND user_id = ?")
            .bind(club_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        let left = result.rows_affected() > 0;
        if left {
            self.feed.publish(ChangeEvent::membership(
                ChangeKind::Delete,
                user_id,
                ConversationKey::club(club_id),
            ));
        }

        Ok(left)
    }

    /// Get or create the direct conversation between two users
    ///
    /// The pair is stored in sorted order so (a, b) and (b, a) resolve to
    /// the same conversation.
    pub async fn create_direct_conversation(
        &self,
        user_id: &str,
        other_user_id: &str,
    ) -> Result<DirectConversation, AppError> {
        if user_id == other_user_id {
            return Err(AppError::Validation(
                "a direct conversation needs two distinct users".to_string(),
            ));
        }

        let (user_a, user_b) = if user_id < other_user_id {
            (user_id, other_user_id)
        } else {
            (other_user_id, user_id)
        };

        let conversation = DirectConversation {
            id: EntityId::new().0,
            user_a: user_a.to_string(),
            user_b: user_b.to_string(),
            created_at: Utc::now(),
        };

        let result = sqlx::query(
            "INSERT INTO direct_conversations (id, user_a, user_b, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(user_a, user_b) DO NOTHING",
        )
        .bind(&conversation.id)
        .bind(&conversation.user_a)
        .bind(&conversation.user_b)
        .bind(conversation.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = sqlx::query_as::<_, DirectConversation>(
                "SELECT id, user_a, user_b, created_at FROM direct_conversations WHERE user_a = ? AND user_b = ?",
            )
            .bind(user_a)
            .bind(user_b)
            .fetch_one(&self.pool)
            .await?;
            return Ok(existing);
        }

        for participant in [user_a, user_b] {
            self.feed.publish(ChangeEvent::membership(
                ChangeKind::Insert,
                participant,
                ConversationKey::dm(conversation.id.clone()),
            ));
        }

        Ok(conversation)
    }

    pub async fn get_direct_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DirectConversation>, AppError> {
        let conversation = sqlx::query_as::<_, DirectConversation>(
            "SELECT id, user_a, user_b, created_at FROM direct_conversations WHERE id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(conversation)
    }

    /// Clubs and conversations the user participates in
    pub async fn membership(&self, user_id: &str) -> Result<Membership, AppError> {
        let club_ids: Vec<String> =
            sqlx::query_scalar("SELECT club_id FROM club_members WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        let conversation_ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM direct_conversations WHERE user_a = ? OR user_b = ?",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Membership {
            club_ids: club_ids.into_iter().collect(),
            conversation_ids: conversation_ids.into_iter().collect(),
        })
    }

    /// Whether the user may read and write the conversation
    pub async fn is_participant(
        &self,
        user_id: &str,
        key: &ConversationKey,
    ) -> Result<bool, AppError> {
        let found: Option<i64> = match key.kind {
            ConversationKind::Club => {
                sqlx::query_scalar("SELECT 1 FROM club_members WHERE club_id = ? AND user_id = ?")
                    .bind(&key.id)
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await?
            }
            ConversationKind::Dm => {
                sqlx::query_scalar(
                    "SELECT 1 FROM direct_conversations WHERE id = ? AND (user_a = ? OR user_b = ?)",
                )
                .bind(&key.id)
                .bind(user_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(found.is_some())
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Insert a message stamped with the current time
    pub async fn insert_message(
        &self,
        key: &ConversationKey,
        new: &NewMessage,
    ) -> Result<Message, AppError> {
        self.insert_message_at(key, new, Utc::now()).await
    }

    /// Insert a message with an explicit timestamp and publish it
    pub async fn insert_message_at(
        &self,
        key: &ConversationKey,
        new: &NewMessage,
        timestamp: DateTime<Utc>,
    ) -> Result<Message, AppError> {
        if new.text.trim().is_empty() {
            return Err(AppError::Validation("message text must not be empty".to_string()));
        }

        let id = EntityId::new().0;
        let created_at = to_micros(timestamp);

        let receiver_id = match key.kind {
            ConversationKind::Club => {
                sqlx::query(
                    "INSERT INTO club_chat_messages (id, club_id, sender_id, text, created_at) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(&key.id)
                .bind(&new.sender_id)
                .bind(&new.text)
                .bind(created_at)
                .execute(&self.pool)
                .await?;
                None
            }
            ConversationKind::Dm => {
                let conversation = self
                    .get_direct_conversation(&key.id)
                    .await?
                    .ok_or(AppError::NotFound)?;
                let receiver = conversation
                    .other_participant(&new.sender_id)
                    .ok_or(AppError::Forbidden)?
                    .to_string();

                sqlx::query(
                    "INSERT INTO direct_messages (id, conversation_id, sender_id, receiver_id, text, created_at) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(&id)
                .bind(&key.id)
                .bind(&new.sender_id)
                .bind(&receiver)
                .bind(&new.text)
                .bind(created_at)
                .execute(&self.pool)
                .await?;
                Some(receiver)
            }
        };

        let message = match self.get_message(key, &id).await? {
            Some(message) => message,
            None => Message {
                id,
                kind: key.kind,
                text: new.text.clone(),
                sender_id: new.sender_id.clone(),
                receiver_id,
                conversation_id: key.id.clone(),
                timestamp: from_micros(created_at),
                sender: None,
            },
        };

        self.feed.publish(ChangeEvent::message_inserted(message.clone()));
        Ok(message)
    }

    pub async fn get_message(
        &self,
        key: &ConversationKey,
        message_id: &str,
    ) -> Result<Option<Message>, AppError> {
        let (select, conversation_column) = message_select(key.kind);
        let sql = format!("{select} WHERE {conversation_column} = ? AND m.id = ?");

        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(&key.id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.into_message(key.kind)))
    }

    /// Hard-delete a message and publish the removed row
    ///
    /// # Returns
    /// The deleted message, or None if it did not exist
    pub async fn delete_message(
        &self,
        key: &ConversationKey,
        message_id: &str,
    ) -> Result<Option<Message>, AppError> {
        let Some(message) = self.get_message(key, message_id).await? else {
            return Ok(None);
        };

        let sql = match key.kind {
            ConversationKind::Club => "DELETE FROM club_chat_messages WHERE id = ?",
            ConversationKind::Dm => "DELETE FROM direct_messages WHERE id = ?",
        };
        sqlx::query(sql).bind(message_id).execute(&self.pool).await?;

        self.feed.publish(ChangeEvent::message_deleted(message.clone()));
        Ok(Some(message))
    }

    /// Get one page of messages, newest first
    ///
    /// # Arguments
    /// * `before` - Only return messages strictly older than this timestamp
    /// * `limit` - Maximum results
    pub async fn fetch_messages_page(
        &self,
        key: &ConversationKey,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        let (select, conversation_column) = message_select(key.kind);

        let rows = match before {
            Some(before) => {
                let sql = format!(
                    "{select} WHERE {conversation_column} = ? AND m.created_at < ? \
                     ORDER BY m.created_at DESC, m.id DESC LIMIT ?"
                );
                sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(&key.id)
                    .bind(to_micros(before))
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "{select} WHERE {conversation_column} = ? \
                     ORDER BY m.created_at DESC, m.id DESC LIMIT ?"
                );
                sqlx::query_as::<_, MessageRow>(&sql)
                    .bind(&key.id)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        Ok(rows.into_iter().map(|row| row.into_message(key.kind)).collect())
    }

    // =========================================================================
    // Read cursors
    // =========================================================================

    /// Create or advance a read cursor
    ///
    /// Keyed by (user, conversation). The stored timestamp never moves
    /// backwards, so out-of-order writes converge on the latest one.
    pub async fn upsert_read_cursor(
        &self,
        user_id: &str,
        key: &ConversationKey,
        last_read: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let (table, column) = read_table(key.kind);
        let sql = format!(
            "INSERT INTO {table} (user_id, {column}, last_read_timestamp) VALUES (?, ?, ?) \
             ON CONFLICT(user_id, {column}) DO UPDATE \
             SET last_read_timestamp = MAX(last_read_timestamp, excluded.last_read_timestamp)"
        );

        sqlx::query(&sql)
            .bind(user_id)
            .bind(&key.id)
            .bind(to_micros(last_read))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_read_cursor(
        &self,
        user_id: &str,
        key: &ConversationKey,
    ) -> Result<Option<ReadCursor>, AppError> {
        let (table, column) = read_table(key.kind);
        let sql = format!("SELECT last_read_timestamp FROM {table} WHERE user_id = ? AND {column} = ?");

        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(&key.id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| ReadCursor {
            conversation: key.clone(),
            user_id: user_id.to_string(),
            last_read_timestamp: from_micros(row.get::<i64, _>("last_read_timestamp")),
        }))
    }

    /// Conversations with at least one message newer than the user's cursor
    /// that the user did not send themselves
    pub async fn unread_conversations(
        &self,
        user_id: &str,
    ) -> Result<HashSet<ConversationKey>, AppError> {
        let club_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT m.club_id
            FROM club_chat_messages m
            JOIN club_members cm ON cm.club_id = m.club_id AND cm.user_id = ?
            LEFT JOIN club_messages_read r ON r.club_id = m.club_id AND r.user_id = ?
            WHERE m.sender_id != ?
              AND (r.last_read_timestamp IS NULL OR m.created_at > r.last_read_timestamp)
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let conversation_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT m.conversation_id
            FROM direct_messages m
            LEFT JOIN direct_messages_read r ON r.conversation_id = m.conversation_id AND r.user_id = ?
            WHERE m.receiver_id = ?
              AND (r.last_read_timestamp IS NULL OR m.created_at > r.last_read_timestamp)
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(club_ids
            .into_iter()
            .map(ConversationKey::club)
            .chain(conversation_ids.into_iter().map(ConversationKey::dm))
            .collect())
    }
}
