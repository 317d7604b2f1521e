//! Local view model of a message list: confirmed server messages plus
//! pending sends that have not been acknowledged yet.

use std::{collections::HashSet, fmt};

use chrono::{DateTime, Utc};
use shared::{
    cursor::MessageCursor,
    domain::{ChannelId, MessageId, UserId},
    protocol::{FilePayload, MessagePayload, ReactionsByEmoji, UserSummary},
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    Pending(Uuid),
    Confirmed(MessageId),
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKey::Pending(id) => write!(f, "temp-{id}"),
            MessageKey::Confirmed(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewMessage {
    pub key: MessageKey,
    pub channel_id: ChannelId,
    pub parent_id: Option<MessageId>,
    pub author: UserSummary,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub reactions: ReactionsByEmoji,
    pub reply_count: u32,
    pub files: Vec<FilePayload>,
}

impl ViewMessage {
    pub fn confirmed(message: MessagePayload) -> Self {
        Self {
            key: MessageKey::Confirmed(message.id),
            channel_id: message.channel_id,
            parent_id: message.parent_id,
            author: message.user,
            content: message.content,
            created_at: message.created_at,
            reactions: message.reactions,
            reply_count: message.reply_count,
            files: message.files,
        }
    }

    /// A tentative entry stamped with the local clock.
    pub fn pending(
        local_id: Uuid,
        channel_id: ChannelId,
        parent_id: Option<MessageId>,
        author: UserSummary,
        content: impl Into<String>,
    ) -> Self {
        Self {
            key: MessageKey::Pending(local_id),
            channel_id,
            parent_id,
            author,
            content: content.into(),
            created_at: Utc::now(),
            reactions: ReactionsByEmoji::new(),
            reply_count: 0,
            files: Vec::new(),
        }
    }

    pub fn id(&self) -> Option<MessageId> {
        match self.key {
            MessageKey::Confirmed(id) => Some(id),
            MessageKey::Pending(_) => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.key, MessageKey::Pending(_))
    }

    pub fn is_from(&self, user_id: UserId) -> bool {
        self.author.id == user_id
    }

    pub fn cursor(&self) -> Option<MessageCursor> {
        self.id().map(|id| MessageCursor::new(self.created_at, id))
    }
}

/// Messages in display order: confirmed entries ascending by
/// `(created_at, id)`, pending entries after them in send order.
#[derive(Debug, Clone, Default)]
pub struct MessageList {
    items: Vec<ViewMessage>,
}

impl MessageList {
    pub fn items(&self) -> &[ViewMessage] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&ViewMessage> {
        self.items.iter().find(|m| m.id() == Some(id))
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.get(id).is_some()
    }

    pub fn confirmed_ids(&self) -> Vec<MessageId> {
        self.items.iter().filter_map(ViewMessage::id).collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &ViewMessage> {
        self.items.iter().filter(|m| m.is_pending())
    }

    pub fn oldest_cursor(&self) -> Option<MessageCursor> {
        self.items.iter().find_map(ViewMessage::cursor)
    }

    pub fn newest(&self) -> Option<&ViewMessage> {
        self.items.last()
    }

    pub fn push(&mut self, message: ViewMessage) {
        self.items.push(message);
    }

    pub fn remove(&mut self, key: MessageKey) -> Option<ViewMessage> {
        let index = self.items.iter().position(|m| m.key == key)?;
        Some(self.items.remove(index))
    }

    /// Swaps a pending entry for the server's copy, placed by its cursor
    /// among the confirmed entries. When a refetch already brought the
    /// message in, the pending entry is only dropped.
    pub fn confirm_pending(&mut self, local_id: Uuid, message: MessagePayload) {
        let key = MessageKey::Pending(local_id);
        if self.remove(key).is_none() || self.contains(message.id) {
            return;
        }
        let cursor = message.cursor();
        let index = self
            .items
            .iter()
            .position(|m| m.cursor().map_or(true, |c| c > cursor))
            .unwrap_or(self.items.len());
        self.items.insert(index, ViewMessage::confirmed(message));
    }

    /// Adds an older page in front, skipping ids already loaded.
    pub fn prepend(&mut self, page: Vec<MessagePayload>) -> usize {
        let known: HashSet<MessageId> = self.confirmed_ids().into_iter().collect();
        let older: Vec<ViewMessage> = page
            .into_iter()
            .filter(|m| !known.contains(&m.id))
            .map(ViewMessage::confirmed)
            .collect();
        let added = older.len();
        self.items.splice(0..0, older);
        added
    }

    /// Overwrites a confirmed entry with a newer server copy.
    pub fn replace_confirmed(&mut self, message: MessagePayload) -> bool {
        match self.items.iter_mut().find(|m| m.id() == Some(message.id)) {
            Some(slot) => {
                *slot = ViewMessage::confirmed(message);
                true
            }
            None => false,
        }
    }

    pub fn reactions_of(&self, id: MessageId) -> Option<&ReactionsByEmoji> {
        self.get(id).map(|m| &m.reactions)
    }

    pub fn set_reactions(&mut self, id: MessageId, reactions: ReactionsByEmoji) -> bool {
        match self.items.iter_mut().find(|m| m.id() == Some(id)) {
            Some(message) => {
                message.reactions = reactions;
                true
            }
            None => false,
        }
    }

    /// Replaces everything with `items`. Callers keep the ordering invariant.
    pub(crate) fn replace_all(&mut self, items: Vec<ViewMessage>) {
        self.items = items;
    }
}
