use crate::error::ApiError;

pub const MAX_MESSAGE_CHARS: usize = 4000;
pub const MAX_STATUS_MESSAGE_CHARS: usize = 25;
pub const MAX_CHANNEL_NAME_CHARS: usize = 80;
pub const MAX_EMOJI_BYTES: usize = 64;

/// Returns the trimmed message body, rejecting blank or oversized content.
pub fn message_content(content: &str) -> Result<&str, ApiError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ApiError::invalid_input("message content cannot be empty"));
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::invalid_input(format!(
            "message content exceeds {MAX_MESSAGE_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

/// Accepts unicode emoji sequences and `:shortcode:` names.
pub fn emoji(value: &str) -> Result<&str, ApiError> {
    let malformed = || ApiError::invalid_input("malformed emoji");
    if value.is_empty() || value.len() > MAX_EMOJI_BYTES {
        return Err(malformed());
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(malformed());
    }
    if !value.is_ascii() {
        return Ok(value);
    }
    let shortcode = value
        .strip_prefix(':')
        .and_then(|rest| rest.strip_suffix(':'))
        .filter(|name| {
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-'))
        });
    shortcode.map(|_| value).ok_or_else(malformed)
}

pub fn status_message(value: &str) -> Result<&str, ApiError> {
    let trimmed = value.trim();
    if trimmed.chars().count() > MAX_STATUS_MESSAGE_CHARS {
        return Err(ApiError::invalid_input(format!(
            "status message exceeds {MAX_STATUS_MESSAGE_CHARS} characters"
        )));
    }
    Ok(trimmed)
}

/// Lowercases and hyphenates a channel name.
pub fn channel_name(value: &str) -> Result<String, ApiError> {
    let normalized = value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    if normalized.is_empty() {
        return Err(ApiError::invalid_input("channel name cannot be empty"));
    }
    if normalized.chars().count() > MAX_CHANNEL_NAME_CHARS {
        return Err(ApiError::invalid_input("channel name is too long"));
    }
    Ok(normalized)
}
