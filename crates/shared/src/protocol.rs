use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    cursor::MessageCursor,
    domain::{ChannelId, ChannelRole, FileId, MessageId, PresenceStatus, UserId, UserRole},
    error::ApiError,
};

/// Public identity of a user as it appears next to messages and reactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    pub status: PresenceStatus,
    pub role: UserRole,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub status_emoji: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            name: self.name.clone(),
            avatar_ref: self.avatar_ref.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub is_private: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipPayload {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub role: ChannelRole,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSummary {
    pub user: UserSummary,
    pub role: ChannelRole,
    pub status: PresenceStatus,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub users: Vec<UserSummary>,
}

/// Reactions on one message grouped by emoji.
pub type ReactionsByEmoji = BTreeMap<String, ReactionGroup>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
    pub user: UserSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub name: String,
    pub url: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    pub id: FileId,
    #[serde(flatten)]
    pub attachment: AttachmentPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    #[serde(default)]
    pub parent_id: Option<MessageId>,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user: UserSummary,
    #[serde(default)]
    pub reactions: ReactionsByEmoji,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(default)]
    pub files: Vec<FilePayload>,
}

impl MessagePayload {
    pub fn cursor(&self) -> MessageCursor {
        MessageCursor {
            created_at: self.created_at,
            message_id: self.id,
        }
    }
}

// -- Requests --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: String,
    pub user: UserProfile,
}

/// Claim set of an HS256 session token, shared by whoever signs one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: i64,
    pub email: String,
    pub exp: i64,
}

impl SessionClaims {
    pub fn new(user_id: UserId, email: &str, expires_at: DateTime<Utc>) -> Self {
        Self {
            sub: user_id.0,
            email: email.to_string(),
            exp: expires_at.timestamp(),
        }
    }

    pub fn user_id(&self) -> UserId {
        UserId(self.sub)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_emoji: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateChannelRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_private: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<AttachmentPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: ChannelRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageDirection {
    #[default]
    Older,
    Newer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<PageDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

// -- Realtime --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    Users,
    Channels,
    ChannelMembers,
    Messages,
    MessageReactions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row in a watched table was inserted, updated or deleted. Carries only
/// the keys subscribers filter on; listeners re-fetch the data themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: ChangeTable,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl ChangeEvent {
    pub fn message(kind: ChangeKind, message: &MessagePayload) -> Self {
        Self {
            table: ChangeTable::Messages,
            kind,
            channel_id: Some(message.channel_id),
            message_id: Some(message.id),
            parent_id: message.parent_id,
            user_id: Some(message.user_id),
        }
    }

    pub fn reaction(
        kind: ChangeKind,
        channel_id: ChannelId,
        message_id: MessageId,
        user_id: UserId,
    ) -> Self {
        Self {
            table: ChangeTable::MessageReactions,
            kind,
            channel_id: Some(channel_id),
            message_id: Some(message_id),
            parent_id: None,
            user_id: Some(user_id),
        }
    }

    pub fn member(kind: ChangeKind, channel_id: ChannelId, user_id: UserId) -> Self {
        Self {
            table: ChangeTable::ChannelMembers,
            kind,
            channel_id: Some(channel_id),
            message_id: None,
            parent_id: None,
            user_id: Some(user_id),
        }
    }

    pub fn channel(kind: ChangeKind, channel_id: ChannelId) -> Self {
        Self {
            table: ChangeTable::Channels,
            kind,
            channel_id: Some(channel_id),
            message_id: None,
            parent_id: None,
            user_id: None,
        }
    }

    pub fn user(user_id: UserId) -> Self {
        Self {
            table: ChangeTable::Users,
            kind: ChangeKind::Update,
            channel_id: None,
            message_id: None,
            parent_id: None,
            user_id: Some(user_id),
        }
    }
}

/// Predicate a realtime subscription is scoped by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeFilter {
    ChannelMessages { channel_id: ChannelId },
    MessageReactions { message_ids: Vec<MessageId> },
    ThreadReplies { parent_id: MessageId },
    ChannelMembers { channel_id: ChannelId },
    Users,
}

impl ChangeFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            ChangeFilter::ChannelMessages { channel_id } => {
                event.table == ChangeTable::Messages && event.channel_id == Some(*channel_id)
            }
            ChangeFilter::MessageReactions { message_ids } => {
                event.table == ChangeTable::MessageReactions
                    && event
                        .message_id
                        .is_some_and(|id| message_ids.contains(&id))
            }
            ChangeFilter::ThreadReplies { parent_id } => {
                event.table == ChangeTable::Messages
                    && (event.parent_id == Some(*parent_id)
                        || event.message_id == Some(*parent_id))
            }
            ChangeFilter::ChannelMembers { channel_id } => {
                event.table == ChangeTable::ChannelMembers
                    && event.channel_id == Some(*channel_id)
            }
            ChangeFilter::Users => event.table == ChangeTable::Users,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeCommand {
    Subscribe {
        subscription_id: u64,
        filter: ChangeFilter,
    },
    Unsubscribe {
        subscription_id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RealtimeFrame {
    Subscribed {
        subscription_id: u64,
    },
    Change {
        subscription_id: u64,
        event: ChangeEvent,
    },
    Error(ApiError),
}
