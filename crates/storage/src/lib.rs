use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, QueryBuilder, Row, Sqlite,
};
use std::{fs, path::Path, str::FromStr};

use shared::{
    cursor::MessageCursor,
    domain::{ChannelId, ChannelRole, FileId, MessageId, PresenceStatus, UserId, UserRole},
    protocol::AttachmentPayload,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredUser {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub avatar_ref: Option<String>,
    pub status: PresenceStatus,
    pub role: UserRole,
    pub bio: Option<String>,
    pub status_message: Option<String>,
    pub status_emoji: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredChannel {
    pub id: ChannelId,
    pub name: String,
    pub description: Option<String>,
    pub is_private: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMembership {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub role: ChannelRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMember {
    pub membership: StoredMembership,
    pub name: String,
    pub avatar_ref: Option<String>,
    pub status: PresenceStatus,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub parent_id: Option<MessageId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub author_name: String,
    pub author_avatar: Option<String>,
    pub reply_count: u32,
}

#[derive(Debug, Clone)]
pub struct StoredReaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
    pub user_name: String,
    pub user_avatar: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub id: FileId,
    pub message_id: MessageId,
    pub name: String,
    pub url: String,
    pub size_bytes: u64,
    pub mime_type: Option<String>,
}

/// Which slice of a channel's top-level messages to read. Bounds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePage {
    Latest,
    Before(MessageCursor),
    After(MessageCursor),
}

#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub name: Option<String>,
    pub bio: Option<String>,
    pub avatar_ref: Option<String>,
    pub status: Option<PresenceStatus>,
    pub status_message: Option<String>,
    pub status_emoji: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChannelChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_private: Option<bool>,
}

/// Outcome of a guarded demotion or removal of a channel member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberChange {
    Applied,
    NotMember,
    LastAdmin,
}

/// Outcome of a capped reaction insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionInsert {
    Inserted,
    AlreadyPresent,
    CapReached,
}

const MESSAGE_COLUMNS: &str = "SELECT m.id, m.channel_id, m.user_id, m.parent_id, m.content, m.created_at, m.updated_at,
            u.name AS author_name, u.avatar_ref AS author_avatar,
            (SELECT COUNT(*) FROM messages r WHERE r.parent_id = m.id) AS reply_count
     FROM messages m
     INNER JOIN users u ON u.id = m.user_id";

const USER_COLUMNS: &str = "SELECT id, email, name, avatar_ref, status, role, bio, status_message, status_emoji, created_at, updated_at FROM users";

const CHANNEL_COLUMNS: &str =
    "SELECT c.id, c.name, c.description, c.is_private, c.created_by, c.created_at, c.updated_at FROM channels c";

/// Fixed-width UTC text so timestamps order correctly as strings.
pub fn timestamp_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every pooled connection to `:memory:` shares one database only while
        // at least one stays open, so the in-memory pool is pinned to a single
        // long-lived connection.
        let in_memory = database_url.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    // -- Users --

    /// Creates the user on first sight of `email`. Returns the stored row and
    /// whether it was newly created.
    pub async fn upsert_user(&self, email: &str, name: &str) -> Result<(StoredUser, bool)> {
        let now = timestamp_text(Utc::now());
        let inserted = sqlx::query(
            "INSERT INTO users (email, name, created_at, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(email) DO NOTHING",
        )
        .bind(email)
        .bind(name)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        let row = sqlx::query(&format!("{USER_COLUMNS} WHERE email = ?"))
            .bind(email)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("user row missing after upsert for {email}"))?;
        Ok((user_from_row(&row)?, inserted))
    }

    pub async fn user_by_id(&self, user_id: UserId) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!("{USER_COLUMNS} WHERE id = ?"))
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<StoredUser>> {
        let row = sqlx::query(&format!("{USER_COLUMNS} WHERE email = ?"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn update_profile(
        &self,
        user_id: UserId,
        changes: &ProfileChanges,
    ) -> Result<Option<StoredUser>> {
        let updated = sqlx::query(
            "UPDATE users SET
                name = COALESCE(?, name),
                bio = COALESCE(?, bio),
                avatar_ref = COALESCE(?, avatar_ref),
                status = COALESCE(?, status),
                status_message = COALESCE(?, status_message),
                status_emoji = COALESCE(?, status_emoji),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(changes.name.as_deref())
        .bind(changes.bio.as_deref())
        .bind(changes.avatar_ref.as_deref())
        .bind(changes.status.map(PresenceStatus::as_str))
        .bind(changes.status_message.as_deref())
        .bind(changes.status_emoji.as_deref())
        .bind(timestamp_text(Utc::now()))
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Ok(None);
        }
        self.user_by_id(user_id).await
    }

    pub async fn set_user_role(&self, user_id: UserId, role: UserRole) -> Result<bool> {
        let updated = sqlx::query("UPDATE users SET role = ?, updated_at = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(timestamp_text(Utc::now()))
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    // -- Channels --

    /// Inserts the channel and its creator as the first admin member.
    pub async fn create_channel(
        &self,
        name: &str,
        description: Option<&str>,
        is_private: bool,
        created_by: UserId,
    ) -> Result<StoredChannel> {
        self.insert_channel(name, description, is_private, created_by, None)
            .await?
            .ok_or_else(|| anyhow!("uncapped channel insert was refused"))
    }

    /// Like [`Storage::create_channel`], but `None` once `created_by` has
    /// created `cap` channels. The count is taken inside the insert.
    pub async fn create_channel_capped(
        &self,
        name: &str,
        description: Option<&str>,
        is_private: bool,
        created_by: UserId,
        cap: i64,
    ) -> Result<Option<StoredChannel>> {
        self.insert_channel(name, description, is_private, created_by, Some(cap))
            .await
    }

    async fn insert_channel(
        &self,
        name: &str,
        description: Option<&str>,
        is_private: bool,
        created_by: UserId,
        cap: Option<i64>,
    ) -> Result<Option<StoredChannel>> {
        let now = timestamp_text(Utc::now());
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO channels (name, description, is_private, created_by, created_at, updated_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?5
             WHERE ?6 IS NULL OR (SELECT COUNT(*) FROM channels WHERE created_by = ?4) < ?6
             RETURNING id",
        )
        .bind(name)
        .bind(description)
        .bind(is_private)
        .bind(created_by.0)
        .bind(&now)
        .bind(cap)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(rec) = rec else {
            return Ok(None);
        };
        let channel_id = ChannelId(rec.try_get::<i64, _>(0)?);

        sqlx::query(
            "INSERT INTO channel_members (channel_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)",
        )
        .bind(channel_id.0)
        .bind(created_by.0)
        .bind(ChannelRole::Admin.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.channel_by_id(channel_id)
            .await?
            .ok_or_else(|| anyhow!("channel {channel_id} vanished after insert"))
            .map(Some)
    }

    pub async fn channel_by_id(&self, channel_id: ChannelId) -> Result<Option<StoredChannel>> {
        let row = sqlx::query(&format!("{CHANNEL_COLUMNS} WHERE c.id = ?"))
            .bind(channel_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(channel_from_row).transpose()
    }

    pub async fn channel_by_name(&self, name: &str) -> Result<Option<StoredChannel>> {
        let row = sqlx::query(&format!("{CHANNEL_COLUMNS} WHERE c.name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(channel_from_row).transpose()
    }

    /// Public channels plus the private ones `user_id` belongs to.
    pub async fn list_channels_for_user(&self, user_id: UserId) -> Result<Vec<StoredChannel>> {
        let rows = sqlx::query(&format!(
            "{CHANNEL_COLUMNS}
             WHERE c.is_private = 0
                OR EXISTS (SELECT 1 FROM channel_members cm WHERE cm.channel_id = c.id AND cm.user_id = ?)
             ORDER BY c.name ASC"
        ))
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(channel_from_row).collect()
    }

    pub async fn count_channels_created_by(&self, user_id: UserId) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM channels WHERE created_by = ?")
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn update_channel(
        &self,
        channel_id: ChannelId,
        changes: &ChannelChanges,
    ) -> Result<Option<StoredChannel>> {
        let updated = sqlx::query(
            "UPDATE channels SET
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                is_private = COALESCE(?, is_private),
                updated_at = ?
             WHERE id = ?",
        )
        .bind(changes.name.as_deref())
        .bind(changes.description.as_deref())
        .bind(changes.is_private)
        .bind(timestamp_text(Utc::now()))
        .bind(channel_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Ok(None);
        }
        self.channel_by_id(channel_id).await
    }

    pub async fn delete_channel(&self, channel_id: ChannelId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }

    // -- Members --

    /// Returns `false` when the user already belongs to the channel.
    pub async fn add_member(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        role: ChannelRole,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO channel_members (channel_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(channel_id, user_id) DO NOTHING",
        )
        .bind(channel_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .bind(timestamp_text(Utc::now()))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted == 1)
    }

    pub async fn membership(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
    ) -> Result<Option<StoredMembership>> {
        let row = sqlx::query(
            "SELECT channel_id, user_id, role, joined_at FROM channel_members
             WHERE channel_id = ? AND user_id = ?",
        )
        .bind(channel_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(membership_from_row).transpose()
    }

    pub async fn count_admins(&self, channel_id: ChannelId) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_members WHERE channel_id = ? AND role = 'admin'",
        )
        .bind(channel_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn list_members(&self, channel_id: ChannelId) -> Result<Vec<StoredMember>> {
        let rows = sqlx::query(
            "SELECT cm.channel_id, cm.user_id, cm.role, cm.joined_at, u.name, u.avatar_ref, u.status
             FROM channel_members cm
             INNER JOIN users u ON u.id = cm.user_id
             WHERE cm.channel_id = ?
             ORDER BY lower(u.name) ASC, u.id ASC",
        )
        .bind(channel_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(StoredMember {
                    membership: membership_from_row(r)?,
                    name: r.try_get("name")?,
                    avatar_ref: r.try_get("avatar_ref")?,
                    status: parse_column(r, "status")?,
                })
            })
            .collect()
    }

    /// Changes a member's role. A demotion that would leave the channel
    /// without an admin is refused inside the same statement.
    pub async fn set_member_role(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        role: ChannelRole,
    ) -> Result<MemberChange> {
        let updated = sqlx::query(
            "UPDATE channel_members SET role = ?1
             WHERE channel_id = ?2 AND user_id = ?3
               AND (?1 = 'admin' OR role <> 'admin'
                    OR (SELECT COUNT(*) FROM channel_members WHERE channel_id = ?2 AND role = 'admin') > 1)",
        )
        .bind(role.as_str())
        .bind(channel_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.member_change_outcome(channel_id, user_id, updated).await
    }

    /// Removes a membership unless it is the channel's last admin.
    pub async fn remove_member(&self, channel_id: ChannelId, user_id: UserId) -> Result<MemberChange> {
        let deleted = sqlx::query(
            "DELETE FROM channel_members
             WHERE channel_id = ?1 AND user_id = ?2
               AND (role <> 'admin'
                    OR (SELECT COUNT(*) FROM channel_members WHERE channel_id = ?1 AND role = 'admin') > 1)",
        )
        .bind(channel_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        self.member_change_outcome(channel_id, user_id, deleted).await
    }

    async fn member_change_outcome(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        affected: u64,
    ) -> Result<MemberChange> {
        if affected > 0 {
            return Ok(MemberChange::Applied);
        }
        Ok(match self.membership(channel_id, user_id).await? {
            Some(_) => MemberChange::LastAdmin,
            None => MemberChange::NotMember,
        })
    }

    // -- Messages --

    pub async fn insert_message(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        content: &str,
        parent_id: Option<MessageId>,
        files: &[AttachmentPayload],
    ) -> Result<MessageId> {
        let now = timestamp_text(Utc::now());
        let mut tx = self.pool.begin().await?;
        let rec = sqlx::query(
            "INSERT INTO messages (content, channel_id, user_id, parent_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(content)
        .bind(channel_id.0)
        .bind(user_id.0)
        .bind(parent_id.map(|id| id.0))
        .bind(&now)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;
        let message_id = MessageId(rec.try_get::<i64, _>(0)?);

        for file in files {
            sqlx::query(
                "INSERT INTO files (message_id, name, url, size_bytes, mime_type, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.0)
            .bind(&file.name)
            .bind(&file.url)
            .bind(i64::try_from(file.size_bytes).unwrap_or(i64::MAX))
            .bind(file.mime_type.as_deref())
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(message_id)
    }

    pub async fn message_by_id(&self, message_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!("{MESSAGE_COLUMNS} WHERE m.id = ?"))
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Top-level messages of a channel, oldest first.
    pub async fn list_messages(
        &self,
        channel_id: ChannelId,
        page: MessagePage,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut query = QueryBuilder::<Sqlite>::new(MESSAGE_COLUMNS);
        query.push(" WHERE m.channel_id = ");
        query.push_bind(channel_id.0);
        query.push(" AND m.parent_id IS NULL");

        let newest_first = match page {
            MessagePage::Latest => true,
            MessagePage::Before(cursor) => {
                let ts = timestamp_text(cursor.created_at);
                query.push(" AND (m.created_at < ");
                query.push_bind(ts.clone());
                query.push(" OR (m.created_at = ");
                query.push_bind(ts);
                query.push(" AND m.id < ");
                query.push_bind(cursor.message_id.0);
                query.push("))");
                true
            }
            MessagePage::After(cursor) => {
                let ts = timestamp_text(cursor.created_at);
                query.push(" AND (m.created_at > ");
                query.push_bind(ts.clone());
                query.push(" OR (m.created_at = ");
                query.push_bind(ts);
                query.push(" AND m.id > ");
                query.push_bind(cursor.message_id.0);
                query.push("))");
                false
            }
        };

        if newest_first {
            query.push(" ORDER BY m.created_at DESC, m.id DESC");
        } else {
            query.push(" ORDER BY m.created_at ASC, m.id ASC");
        }
        query.push(" LIMIT ");
        query.push_bind(i64::from(limit));

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        if newest_first {
            messages.reverse();
        }
        Ok(messages)
    }

    pub async fn list_replies(&self, parent_id: MessageId) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(&format!(
            "{MESSAGE_COLUMNS} WHERE m.parent_id = ? ORDER BY m.created_at ASC, m.id ASC"
        ))
        .bind(parent_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn update_message_content(&self, message_id: MessageId, content: &str) -> Result<bool> {
        let updated = sqlx::query("UPDATE messages SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(timestamp_text(Utc::now()))
            .bind(message_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated == 1)
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted == 1)
    }

    pub async fn files_for_messages(&self, message_ids: &[MessageId]) -> Result<Vec<StoredFile>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, message_id, name, url, size_bytes, mime_type FROM files WHERE message_id IN (",
        );
        let mut ids = query.separated(", ");
        for id in message_ids {
            ids.push_bind(id.0);
        }
        query.push(") ORDER BY id ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                Ok(StoredFile {
                    id: FileId(r.try_get("id")?),
                    message_id: MessageId(r.try_get("message_id")?),
                    name: r.try_get("name")?,
                    url: r.try_get("url")?,
                    size_bytes: u64::try_from(r.try_get::<i64, _>("size_bytes")?).unwrap_or(0),
                    mime_type: r.try_get("mime_type")?,
                })
            })
            .collect()
    }

    // -- Reactions --

    pub async fn reaction_exists(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM message_reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn count_user_reactions(&self, message_id: MessageId, user_id: UserId) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM message_reactions WHERE message_id = ? AND user_id = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Adds the reaction while the user holds fewer than `cap` on the
    /// message, counted inside the same statement.
    pub async fn insert_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
        cap: i64,
    ) -> Result<ReactionInsert> {
        let inserted = sqlx::query(
            "INSERT INTO message_reactions (message_id, user_id, emoji, created_at)
             SELECT ?1, ?2, ?3, ?4
             WHERE (SELECT COUNT(*) FROM message_reactions WHERE message_id = ?1 AND user_id = ?2) < ?5
             ON CONFLICT(message_id, user_id, emoji) DO NOTHING",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .bind(timestamp_text(Utc::now()))
        .bind(cap)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted == 1 {
            return Ok(ReactionInsert::Inserted);
        }
        if self.reaction_exists(message_id, user_id, emoji).await? {
            Ok(ReactionInsert::AlreadyPresent)
        } else {
            Ok(ReactionInsert::CapReached)
        }
    }

    pub async fn delete_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: &str,
    ) -> Result<bool> {
        let deleted = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id.0)
        .bind(user_id.0)
        .bind(emoji)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted == 1)
    }

    /// Reaction rows for the given messages in the order they were added.
    pub async fn reactions_for_messages(
        &self,
        message_ids: &[MessageId],
    ) -> Result<Vec<StoredReaction>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT r.message_id, r.user_id, r.emoji, r.created_at, u.name, u.avatar_ref
             FROM message_reactions r
             INNER JOIN users u ON u.id = r.user_id
             WHERE r.message_id IN (",
        );
        let mut ids = query.separated(", ");
        for id in message_ids {
            ids.push_bind(id.0);
        }
        query.push(") ORDER BY r.created_at ASC, r.rowid ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                Ok(StoredReaction {
                    message_id: MessageId(r.try_get("message_id")?),
                    user_id: UserId(r.try_get("user_id")?),
                    emoji: r.try_get("emoji")?,
                    created_at: r.try_get("created_at")?,
                    user_name: r.try_get("name")?,
                    user_avatar: r.try_get("avatar_ref")?,
                })
            })
            .collect()
    }
}

fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .with_context(|| format!("unexpected value in column {column}"))
}

fn user_from_row(r: &SqliteRow) -> Result<StoredUser> {
    Ok(StoredUser {
        id: UserId(r.try_get("id")?),
        email: r.try_get("email")?,
        name: r.try_get("name")?,
        avatar_ref: r.try_get("avatar_ref")?,
        status: parse_column(r, "status")?,
        role: parse_column(r, "role")?,
        bio: r.try_get("bio")?,
        status_message: r.try_get("status_message")?,
        status_emoji: r.try_get("status_emoji")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn channel_from_row(r: &SqliteRow) -> Result<StoredChannel> {
    Ok(StoredChannel {
        id: ChannelId(r.try_get("id")?),
        name: r.try_get("name")?,
        description: r.try_get("description")?,
        is_private: r.try_get("is_private")?,
        created_by: UserId(r.try_get("created_by")?),
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn membership_from_row(r: &SqliteRow) -> Result<StoredMembership> {
    Ok(StoredMembership {
        channel_id: ChannelId(r.try_get("channel_id")?),
        user_id: UserId(r.try_get("user_id")?),
        role: parse_column(r, "role")?,
        joined_at: r.try_get("joined_at")?,
    })
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        id: MessageId(r.try_get("id")?),
        channel_id: ChannelId(r.try_get("channel_id")?),
        user_id: UserId(r.try_get("user_id")?),
        parent_id: r.try_get::<Option<i64>, _>("parent_id")?.map(MessageId),
        content: r.try_get("content")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
        author_name: r.try_get("author_name")?,
        author_avatar: r.try_get("author_avatar")?,
        reply_count: u32::try_from(r.try_get::<i64, _>("reply_count")?).unwrap_or(u32::MAX),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url.contains(":memory:") || !database_url.starts_with("sqlite:") {
        return Ok(());
    }
    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    let Some(parent) = Path::new(path).parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
