use shared::{
    domain::{ChannelRole, UserId, GENERAL_CHANNEL},
    error::ApiError,
    protocol::{ChangeEvent, ChangeKind, UpdateProfileRequest, UserProfile},
    validate,
};
use storage::{ProfileChanges, StoredUser};
use tracing::info;

use crate::{access, internal, rate_limit::RateLimitAction, ApiContext};

pub(crate) fn user_profile(user: StoredUser) -> UserProfile {
    UserProfile {
        id: user.id,
        email: user.email,
        name: user.name,
        avatar_ref: user.avatar_ref,
        status: user.status,
        role: user.role,
        bio: user.bio,
        status_message: user.status_message,
        status_emoji: user.status_emoji,
        created_at: user.created_at,
        updated_at: user.updated_at,
    }
}

/// First-sign-in sync. Creates the user when the email is new and makes sure
/// they belong to `general`, creating that channel with them as admin if it
/// does not exist yet.
pub async fn sync_user(ctx: &ApiContext, email: &str, name: &str) -> Result<UserProfile, ApiError> {
    let email = email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::invalid_input("a valid email is required"));
    }
    let name = name.trim();
    let name = if name.is_empty() {
        email.split('@').next().unwrap_or_default()
    } else {
        name
    };

    let (user, created) = ctx
        .storage
        .upsert_user(&email, name)
        .await
        .map_err(internal)?;
    if created {
        info!(user_id = user.id.0, "registered new user");
        ctx.feed.publish(ChangeEvent::user(user.id));
    }
    join_general(ctx, user.id).await?;
    Ok(user_profile(user))
}

async fn join_general(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    let existing = ctx
        .storage
        .channel_by_name(GENERAL_CHANNEL)
        .await
        .map_err(internal)?;
    match existing {
        Some(channel) => {
            let joined = ctx
                .storage
                .add_member(channel.id, user_id, ChannelRole::Member)
                .await
                .map_err(internal)?;
            if joined {
                ctx.feed
                    .publish(ChangeEvent::member(ChangeKind::Insert, channel.id, user_id));
            }
        }
        None => {
            let channel = ctx
                .storage
                .create_channel(
                    GENERAL_CHANNEL,
                    Some("Company-wide announcements and chatter"),
                    false,
                    user_id,
                )
                .await
                .map_err(internal)?;
            info!(channel_id = channel.id.0, "created general channel");
            ctx.feed
                .publish(ChangeEvent::channel(ChangeKind::Insert, channel.id));
            ctx.feed
                .publish(ChangeEvent::member(ChangeKind::Insert, channel.id, user_id));
        }
    }
    Ok(())
}

pub async fn get_profile(ctx: &ApiContext, user_id: UserId) -> Result<UserProfile, ApiError> {
    access::current_user(ctx, user_id).await.map(user_profile)
}

/// Profile and presence edits. Fields left out keep their current value.
pub async fn update_profile(
    ctx: &ApiContext,
    user_id: UserId,
    request: UpdateProfileRequest,
) -> Result<UserProfile, ApiError> {
    access::current_user(ctx, user_id).await?;
    ctx.rate_limiter
        .check(user_id, RateLimitAction::UpdateProfile)
        .await?;

    let name = match request.name.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::invalid_input("name cannot be empty")),
        other => other.map(str::to_string),
    };
    let status_message = request
        .status_message
        .as_deref()
        .map(validate::status_message)
        .transpose()?
        .map(str::to_string);
    let status_emoji = match request.status_emoji.as_deref() {
        None | Some("") => request.status_emoji.clone(),
        Some(emoji) => Some(validate::emoji(emoji)?.to_string()),
    };

    let changes = ProfileChanges {
        name,
        bio: request.bio.map(|bio| bio.trim().to_string()),
        avatar_ref: request.avatar_ref,
        status: request.status,
        status_message,
        status_emoji,
    };
    let user = ctx
        .storage
        .update_profile(user_id, &changes)
        .await
        .map_err(internal)?
        .ok_or_else(ApiError::unauthenticated)?;
    ctx.feed.publish(ChangeEvent::user(user_id));
    Ok(user_profile(user))
}
