use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::{domain::MessageId, protocol::PageDirection};

/// A position in a channel's `(created_at, id)` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageCursor {
    pub created_at: DateTime<Utc>,
    pub message_id: MessageId,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed pagination cursor")]
pub struct CursorError;

impl MessageCursor {
    pub fn new(created_at: DateTime<Utc>, message_id: MessageId) -> Self {
        Self {
            created_at,
            message_id,
        }
    }

    /// The position immediately before this message, so that an exclusive
    /// "newer than" bound built from it still includes the message itself.
    pub fn preceding(self) -> Self {
        Self {
            created_at: self.created_at,
            message_id: MessageId(self.message_id.0.saturating_sub(1)),
        }
    }

    pub fn encode(&self) -> String {
        let raw = format!(
            "{}|{}",
            self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.message_id.0
        );
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    /// Parses an opaque token produced by [`MessageCursor::encode`] or a bare
    /// RFC 3339 timestamp. A bare timestamp excludes every message created at
    /// that instant, whichever way the page runs.
    pub fn parse(token: &str, direction: PageDirection) -> Result<Self, CursorError> {
        if let Ok(created_at) = DateTime::parse_from_rfc3339(token) {
            let message_id = match direction {
                PageDirection::Older => MessageId(i64::MIN),
                PageDirection::Newer => MessageId(i64::MAX),
            };
            return Ok(Self {
                created_at: created_at.with_timezone(&Utc),
                message_id,
            });
        }

        let decoded = URL_SAFE_NO_PAD.decode(token.as_bytes()).map_err(|_| CursorError)?;
        let text = String::from_utf8(decoded).map_err(|_| CursorError)?;
        let (ts, id) = text.split_once('|').ok_or(CursorError)?;
        let created_at = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| CursorError)?
            .with_timezone(&Utc);
        let message_id = id.parse::<i64>().map(MessageId).map_err(|_| CursorError)?;
        Ok(Self {
            created_at,
            message_id,
        })
    }
}

impl fmt::Display for MessageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
