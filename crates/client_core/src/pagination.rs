use shared::{
    cursor::MessageCursor,
    protocol::{ListMessagesQuery, MessagePayload, PageDirection},
};

pub const PAGE_SIZE: u32 = 50;
/// Page size used when re-reading the loaded window after a change.
pub const REFETCH_PAGE_SIZE: u32 = 200;

/// Tracks how far back a channel view has loaded.
#[derive(Debug, Clone)]
pub struct PaginationCursor {
    page_size: u32,
    oldest: Option<MessageCursor>,
    has_more: bool,
}

impl Default for PaginationCursor {
    fn default() -> Self {
        Self::new(PAGE_SIZE)
    }
}

impl PaginationCursor {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            oldest: None,
            has_more: true,
        }
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn oldest(&self) -> Option<MessageCursor> {
        self.oldest
    }

    pub fn initial_query(&self) -> ListMessagesQuery {
        ListMessagesQuery {
            cursor: None,
            direction: None,
            limit: Some(self.page_size),
        }
    }

    /// `None` once the start of the channel has been reached.
    pub fn older_query(&self) -> Option<ListMessagesQuery> {
        if !self.has_more {
            return None;
        }
        let oldest = self.oldest?;
        Some(ListMessagesQuery {
            cursor: Some(oldest.encode()),
            direction: Some(PageDirection::Older),
            limit: Some(self.page_size),
        })
    }

    /// Records a page fetched going backwards (the initial page included).
    pub fn record_page(&mut self, page: &[MessagePayload]) {
        if (page.len() as u32) < self.page_size {
            self.has_more = false;
        }
        if let Some(first) = page.iter().map(MessagePayload::cursor).min() {
            self.oldest = Some(self.oldest.map_or(first, |current| current.min(first)));
        }
    }

    /// Query re-reading every loaded message, starting at `from`.
    pub fn refetch_query(from: Option<MessageCursor>) -> ListMessagesQuery {
        ListMessagesQuery {
            cursor: from.map(|cursor| cursor.encode()),
            direction: from.map(|_| PageDirection::Newer),
            limit: Some(REFETCH_PAGE_SIZE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use shared::{
        domain::{ChannelId, MessageId, UserId},
        protocol::{ReactionsByEmoji, UserSummary},
    };

    fn page(ids: std::ops::RangeInclusive<i64>) -> Vec<MessagePayload> {
        ids.map(|id| {
            let at = DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(id);
            MessagePayload {
                id: MessageId(id),
                channel_id: ChannelId(1),
                user_id: UserId(1),
                parent_id: None,
                content: id.to_string(),
                created_at: at,
                updated_at: at,
                user: UserSummary {
                    id: UserId(1),
                    name: "ann".into(),
                    avatar_ref: None,
                },
                reactions: ReactionsByEmoji::new(),
                reply_count: 0,
                files: Vec::new(),
            }
        })
        .collect()
    }

    #[test]
    fn short_first_page_means_nothing_older() {
        let mut cursor = PaginationCursor::default();
        cursor.record_page(&page(1..=3));
        assert!(!cursor.has_more());
        assert!(cursor.older_query().is_none());
    }

    #[test]
    fn older_query_starts_below_the_oldest_loaded_message() {
        let mut cursor = PaginationCursor::new(2);
        cursor.record_page(&page(9..=10));
        assert!(cursor.has_more());

        let query = cursor.older_query().expect("more pages");
        assert_eq!(query.direction, Some(PageDirection::Older));
        let token = query.cursor.expect("cursor");
        let parsed = MessageCursor::parse(&token, PageDirection::Older).expect("parse");
        assert_eq!(parsed.message_id, MessageId(9));

        cursor.record_page(&page(8..=8));
        assert!(!cursor.has_more());
        assert_eq!(cursor.oldest().map(|c| c.message_id), Some(MessageId(8)));
    }

    #[test]
    fn refetch_without_a_bound_reads_the_latest_page() {
        let query = PaginationCursor::refetch_query(None);
        assert!(query.cursor.is_none());
        assert!(query.direction.is_none());
    }
}
