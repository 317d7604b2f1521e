use shared::{
    domain::{ChannelId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ChangeEvent, ChangeKind, ReactionPayload, ReactionsByEmoji, UserSummary},
    reactions::group_reactions,
    validate,
};
use storage::{ReactionInsert, StoredReaction};
use tracing::debug;

use crate::{
    access, internal, messages::message_in_channel, rate_limit::RateLimitAction, ApiContext,
};

async fn reaction_rows(
    ctx: &ApiContext,
    message_id: MessageId,
) -> Result<Vec<StoredReaction>, ApiError> {
    ctx.storage
        .reactions_for_messages(&[message_id])
        .await
        .map_err(internal)
}

fn regroup(rows: Vec<StoredReaction>) -> ReactionsByEmoji {
    group_reactions(rows.into_iter().map(|row| {
        (
            row.emoji,
            UserSummary {
                id: row.user_id,
                name: row.user_name,
                avatar_ref: row.user_avatar,
            },
        )
    }))
}

/// Adds the reaction if absent, removes it if present, and returns the
/// message's reactions regrouped from a fresh read.
pub async fn toggle_reaction(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    message_id: MessageId,
    emoji: &str,
) -> Result<ReactionsByEmoji, ApiError> {
    let emoji = validate::emoji(emoji)?;
    access::require_member(ctx, channel_id, user_id).await?;
    message_in_channel(ctx, channel_id, message_id).await?;
    ctx.rate_limiter
        .check(user_id, RateLimitAction::ToggleReaction)
        .await?;

    let exists = ctx
        .storage
        .reaction_exists(message_id, user_id, emoji)
        .await
        .map_err(internal)?;
    let kind = if exists {
        let deleted = ctx
            .storage
            .delete_reaction(message_id, user_id, emoji)
            .await
            .map_err(internal)?;
        deleted.then_some(ChangeKind::Delete)
    } else {
        let outcome = ctx
            .storage
            .insert_reaction(message_id, user_id, emoji, ctx.limits.reaction_cap)
            .await
            .map_err(internal)?;
        match outcome {
            ReactionInsert::Inserted => Some(ChangeKind::Insert),
            // A concurrent toggle added it first.
            ReactionInsert::AlreadyPresent => None,
            ReactionInsert::CapReached => {
                return Err(ApiError::new(
                    ErrorCode::LimitReached,
                    format!(
                        "at most {} reactions per message",
                        ctx.limits.reaction_cap
                    ),
                ))
            }
        }
    };
    if let Some(kind) = kind {
        debug!(message_id = message_id.0, user_id = user_id.0, emoji, ?kind, "reaction toggled");
        ctx.feed
            .publish(ChangeEvent::reaction(kind, channel_id, message_id, user_id));
    }

    Ok(regroup(reaction_rows(ctx, message_id).await?))
}

/// Raw reaction rows with the reacting user, oldest first.
pub async fn list_reactions(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    message_id: MessageId,
) -> Result<Vec<ReactionPayload>, ApiError> {
    access::require_member(ctx, channel_id, user_id).await?;
    message_in_channel(ctx, channel_id, message_id).await?;
    Ok(reaction_rows(ctx, message_id)
        .await?
        .into_iter()
        .map(|row| ReactionPayload {
            message_id: row.message_id,
            user_id: row.user_id,
            user: UserSummary {
                id: row.user_id,
                name: row.user_name,
                avatar_ref: row.user_avatar,
            },
            emoji: row.emoji,
            created_at: row.created_at,
        })
        .collect())
}
