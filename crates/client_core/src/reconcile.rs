//! Folding an authoritative snapshot into the local view.

use chrono::Duration;
use shared::{cursor::MessageCursor, protocol::MessagePayload};

use crate::view::{MessageList, ViewMessage};

/// How long a pending send may lag behind the server copy it matches.
pub const PENDING_MATCH_WINDOW_SECS: i64 = 30;

/// Authoritative messages fetched after a change.
///
/// `from` is the exclusive lower bound the fetch started at. Confirmed
/// entries at or before it were not part of the fetch and are kept.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub messages: Vec<MessagePayload>,
    pub from: Option<MessageCursor>,
}

impl Snapshot {
    pub fn full(messages: Vec<MessagePayload>) -> Self {
        Self {
            messages,
            from: None,
        }
    }
}

pub trait Reconciler: Send + Sync {
    fn reconcile(&self, list: &mut MessageList, snapshot: Snapshot);
}

/// Confirmed state is replaced wholesale by the snapshot; pending sends
/// survive until the server copy shows up.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceReconciler;

impl ReplaceReconciler {
    fn settles(pending: &ViewMessage, message: &MessagePayload) -> bool {
        message.user_id == pending.author.id
            && message.parent_id == pending.parent_id
            && message.content == pending.content
            && (message.created_at - pending.created_at).abs()
                <= Duration::seconds(PENDING_MATCH_WINDOW_SECS)
    }
}

impl Reconciler for ReplaceReconciler {
    fn reconcile(&self, list: &mut MessageList, snapshot: Snapshot) {
        let Snapshot { mut messages, from } = snapshot;
        messages.sort_by_key(MessagePayload::cursor);

        let kept_older = list.items().iter().filter(|m| match (m.cursor(), from) {
            (Some(cursor), Some(bound)) => cursor <= bound,
            _ => false,
        });
        let pending = list
            .pending()
            .filter(|p| !messages.iter().any(|m| Self::settles(p, m)));

        let mut items: Vec<ViewMessage> = kept_older.cloned().collect();
        let pending: Vec<ViewMessage> = pending.cloned().collect();
        items.extend(
            messages
                .into_iter()
                .filter(|m| from.map_or(true, |bound| m.cursor() > bound))
                .map(ViewMessage::confirmed),
        );
        items.extend(pending);
        list.replace_all(items);
    }
}
