use std::collections::HashMap;

use shared::{
    cursor::MessageCursor,
    domain::{ChannelId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        AttachmentPayload, ChangeEvent, ChangeKind, FilePayload, ListMessagesQuery,
        MessagePayload, PageDirection, PostMessageRequest, UserSummary,
    },
    reactions::group_reactions,
    validate,
};
use storage::{MessagePage, StoredMessage};
use tracing::info;

use crate::{access, internal, rate_limit::RateLimitAction, ApiContext};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;
pub const MAX_FILES_PER_MESSAGE: usize = 10;

/// Annotates stored rows with grouped reactions and attachments.
pub(crate) async fn hydrate(
    ctx: &ApiContext,
    messages: Vec<StoredMessage>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();

    let mut reaction_rows: HashMap<MessageId, Vec<(String, UserSummary)>> = HashMap::new();
    for row in ctx
        .storage
        .reactions_for_messages(&ids)
        .await
        .map_err(internal)?
    {
        reaction_rows.entry(row.message_id).or_default().push((
            row.emoji,
            UserSummary {
                id: row.user_id,
                name: row.user_name,
                avatar_ref: row.user_avatar,
            },
        ));
    }

    let mut files: HashMap<MessageId, Vec<FilePayload>> = HashMap::new();
    for file in ctx
        .storage
        .files_for_messages(&ids)
        .await
        .map_err(internal)?
    {
        files.entry(file.message_id).or_default().push(FilePayload {
            id: file.id,
            attachment: AttachmentPayload {
                name: file.name,
                url: file.url,
                size_bytes: file.size_bytes,
                mime_type: file.mime_type,
            },
        });
    }

    Ok(messages
        .into_iter()
        .map(|m| MessagePayload {
            id: m.id,
            channel_id: m.channel_id,
            user_id: m.user_id,
            parent_id: m.parent_id,
            content: m.content,
            created_at: m.created_at,
            updated_at: m.updated_at,
            user: UserSummary {
                id: m.user_id,
                name: m.author_name,
                avatar_ref: m.author_avatar,
            },
            reactions: group_reactions(reaction_rows.remove(&m.id).unwrap_or_default()),
            reply_count: m.reply_count,
            files: files.remove(&m.id).unwrap_or_default(),
        })
        .collect())
}

async fn hydrate_one(ctx: &ApiContext, message: StoredMessage) -> Result<MessagePayload, ApiError> {
    hydrate(ctx, vec![message])
        .await?
        .pop()
        .ok_or_else(ApiError::upstream)
}

/// Loads a message that must live in `channel_id`.
pub(crate) async fn message_in_channel(
    ctx: &ApiContext,
    channel_id: ChannelId,
    message_id: MessageId,
) -> Result<StoredMessage, ApiError> {
    ctx.storage
        .message_by_id(message_id)
        .await
        .map_err(internal)?
        .filter(|m| m.channel_id == channel_id)
        .ok_or_else(|| ApiError::not_found("message not found"))
}

pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

fn page_for(query: &ListMessagesQuery) -> Result<MessagePage, ApiError> {
    let direction = query.direction.unwrap_or_default();
    let Some(token) = query.cursor.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(MessagePage::Latest);
    };
    let cursor = MessageCursor::parse(token, direction)
        .map_err(|err| ApiError::invalid_input(err.to_string()))?;
    Ok(match direction {
        PageDirection::Older => MessagePage::Before(cursor),
        PageDirection::Newer => MessagePage::After(cursor),
    })
}

/// Top-level messages of a channel in ascending `(created_at, id)` order.
pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    query: &ListMessagesQuery,
) -> Result<Vec<MessagePayload>, ApiError> {
    access::require_member(ctx, channel_id, user_id).await?;
    let page = page_for(query)?;
    let messages = ctx
        .storage
        .list_messages(channel_id, page, clamp_limit(query.limit))
        .await
        .map_err(internal)?;
    hydrate(ctx, messages).await
}

fn validate_files(files: &[AttachmentPayload]) -> Result<(), ApiError> {
    if files.len() > MAX_FILES_PER_MESSAGE {
        return Err(ApiError::invalid_input(format!(
            "at most {MAX_FILES_PER_MESSAGE} files per message"
        )));
    }
    if files
        .iter()
        .any(|f| f.name.trim().is_empty() || f.url.trim().is_empty())
    {
        return Err(ApiError::invalid_input("attachments need a name and url"));
    }
    Ok(())
}

pub async fn post_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    request: PostMessageRequest,
) -> Result<MessagePayload, ApiError> {
    access::require_member(ctx, channel_id, user_id).await?;
    let content = validate::message_content(&request.content)?;
    validate_files(&request.files)?;

    if let Some(parent_id) = request.parent_id {
        let parent = ctx
            .storage
            .message_by_id(parent_id)
            .await
            .map_err(internal)?;
        if !parent.is_some_and(|p| p.channel_id == channel_id) {
            return Err(ApiError::new(
                ErrorCode::InvalidParent,
                "parent message must exist in the same channel",
            ));
        }
    }
    ctx.rate_limiter
        .check(user_id, RateLimitAction::PostMessage)
        .await?;

    let message_id = ctx
        .storage
        .insert_message(channel_id, user_id, content, request.parent_id, &request.files)
        .await
        .map_err(internal)?;
    let stored = ctx
        .storage
        .message_by_id(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(ApiError::upstream)?;
    let message = hydrate_one(ctx, stored).await?;
    info!(
        message_id = message_id.0,
        channel_id = channel_id.0,
        user_id = user_id.0,
        "message posted"
    );
    ctx.feed
        .publish(ChangeEvent::message(ChangeKind::Insert, &message));
    Ok(message)
}

async fn authored_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    message_id: MessageId,
) -> Result<StoredMessage, ApiError> {
    access::require_member(ctx, channel_id, user_id).await?;
    let message = message_in_channel(ctx, channel_id, message_id).await?;
    if message.user_id != user_id {
        return Err(ApiError::forbidden("only the author may change this message"));
    }
    Ok(message)
}

pub async fn update_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    message_id: MessageId,
    content: &str,
) -> Result<MessagePayload, ApiError> {
    let content = validate::message_content(content)?;
    authored_message(ctx, user_id, channel_id, message_id).await?;

    if !ctx
        .storage
        .update_message_content(message_id, content)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found("message not found"));
    }
    let stored = message_in_channel(ctx, channel_id, message_id).await?;
    let message = hydrate_one(ctx, stored).await?;
    ctx.feed
        .publish(ChangeEvent::message(ChangeKind::Update, &message));
    Ok(message)
}

/// Deletes a message with its replies, reactions and files.
pub async fn delete_message(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    let stored = authored_message(ctx, user_id, channel_id, message_id).await?;
    let message = hydrate_one(ctx, stored).await?;
    if !ctx
        .storage
        .delete_message(message_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found("message not found"));
    }
    info!(message_id = message_id.0, user_id = user_id.0, "message deleted");
    ctx.feed
        .publish(ChangeEvent::message(ChangeKind::Delete, &message));
    Ok(())
}

pub async fn list_replies(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    parent_id: MessageId,
) -> Result<Vec<MessagePayload>, ApiError> {
    access::require_member(ctx, channel_id, user_id).await?;
    message_in_channel(ctx, channel_id, parent_id).await?;
    let replies = ctx
        .storage
        .list_replies(parent_id)
        .await
        .map_err(internal)?;
    hydrate(ctx, replies).await
}
