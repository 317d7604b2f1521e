use shared::{
    domain::{ChannelId, ChannelRole, UserId, GENERAL_CHANNEL},
    error::{ApiError, ErrorCode},
    protocol::{
        ChangeEvent, ChangeKind, ChannelSummary, CreateChannelRequest, MemberSummary,
        MembershipPayload, UpdateChannelRequest, UserSummary,
    },
    validate,
};
use storage::{ChannelChanges, MemberChange, StoredChannel, StoredMembership};
use tracing::info;

use crate::{
    access::{self, last_admin},
    internal,
    rate_limit::RateLimitAction,
    ApiContext,
};

pub(crate) fn channel_summary(channel: StoredChannel) -> ChannelSummary {
    ChannelSummary {
        id: channel.id,
        name: channel.name,
        description: channel.description,
        is_private: channel.is_private,
        created_by: channel.created_by,
        created_at: channel.created_at,
        updated_at: channel.updated_at,
    }
}

fn membership_payload(membership: StoredMembership) -> MembershipPayload {
    MembershipPayload {
        channel_id: membership.channel_id,
        user_id: membership.user_id,
        role: membership.role,
        joined_at: membership.joined_at,
    }
}

/// Public channels plus the private channels the caller belongs to.
pub async fn list_channels(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ChannelSummary>, ApiError> {
    access::current_user(ctx, user_id).await?;
    let channels = ctx
        .storage
        .list_channels_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(channels.into_iter().map(channel_summary).collect())
}

async fn ensure_name_free(ctx: &ApiContext, name: &str) -> Result<(), ApiError> {
    let taken = ctx
        .storage
        .channel_by_name(name)
        .await
        .map_err(internal)?
        .is_some();
    if taken {
        return Err(ApiError::invalid_input("a channel with that name already exists"));
    }
    Ok(())
}

pub async fn create_channel(
    ctx: &ApiContext,
    user_id: UserId,
    request: CreateChannelRequest,
) -> Result<ChannelSummary, ApiError> {
    access::current_user(ctx, user_id).await?;
    ctx.rate_limiter
        .check(user_id, RateLimitAction::CreateChannel)
        .await?;
    let name = validate::channel_name(&request.name)?;
    ensure_name_free(ctx, &name).await?;

    let description = request
        .description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());
    let channel = ctx
        .storage
        .create_channel_capped(
            &name,
            description.as_deref(),
            request.is_private,
            user_id,
            ctx.limits.channel_cap,
        )
        .await
        .map_err(internal)?
        .ok_or_else(|| {
            ApiError::new(
                ErrorCode::LimitReached,
                format!("a user may create at most {} channels", ctx.limits.channel_cap),
            )
        })?;
    info!(channel_id = channel.id.0, user_id = user_id.0, "channel created");
    ctx.feed
        .publish(ChangeEvent::channel(ChangeKind::Insert, channel.id));
    ctx.feed
        .publish(ChangeEvent::member(ChangeKind::Insert, channel.id, user_id));
    Ok(channel_summary(channel))
}

pub async fn update_channel(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    request: UpdateChannelRequest,
) -> Result<ChannelSummary, ApiError> {
    let actor = access::require_admin(ctx, channel_id, user_id).await?;

    let name = request
        .name
        .as_deref()
        .map(validate::channel_name)
        .transpose()?
        .filter(|name| *name != actor.channel.name);
    if let Some(name) = name.as_deref() {
        if actor.channel.name == GENERAL_CHANNEL {
            return Err(ApiError::new(
                ErrorCode::InvariantViolation,
                "the general channel cannot be renamed",
            ));
        }
        ensure_name_free(ctx, name).await?;
    }

    let changes = ChannelChanges {
        name,
        description: request.description.map(|d| d.trim().to_string()),
        is_private: request.is_private,
    };
    let channel = ctx
        .storage
        .update_channel(channel_id, &changes)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("channel not found"))?;
    ctx.feed
        .publish(ChangeEvent::channel(ChangeKind::Update, channel_id));
    Ok(channel_summary(channel))
}

pub async fn delete_channel(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
) -> Result<(), ApiError> {
    let actor = access::require_admin(ctx, channel_id, user_id).await?;
    if actor.channel.name == GENERAL_CHANNEL {
        return Err(ApiError::new(
            ErrorCode::InvariantViolation,
            "the general channel cannot be deleted",
        ));
    }
    ctx.storage
        .delete_channel(channel_id)
        .await
        .map_err(internal)?;
    info!(channel_id = channel_id.0, user_id = user_id.0, "channel deleted");
    ctx.feed
        .publish(ChangeEvent::channel(ChangeKind::Delete, channel_id));
    Ok(())
}

pub async fn join_channel(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
) -> Result<MembershipPayload, ApiError> {
    access::current_user(ctx, user_id).await?;
    let channel = access::channel_exists(ctx, channel_id)
        .await?
        .ok_or_else(|| ApiError::not_found("channel not found"))?;
    if access::is_member(ctx, channel_id, user_id).await? {
        return Err(ApiError::invalid_input("already a member of this channel"));
    }
    if channel.is_private {
        return Err(ApiError::invalid_input("private channels are invite only"));
    }

    let joined = ctx
        .storage
        .add_member(channel_id, user_id, ChannelRole::Member)
        .await
        .map_err(internal)?;
    if !joined {
        return Err(ApiError::invalid_input("already a member of this channel"));
    }
    let membership = ctx
        .storage
        .membership(channel_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(ApiError::upstream)?;
    ctx.feed
        .publish(ChangeEvent::member(ChangeKind::Insert, channel_id, user_id));
    Ok(membership_payload(membership))
}

pub async fn list_members(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
) -> Result<Vec<MemberSummary>, ApiError> {
    access::require_member(ctx, channel_id, user_id).await?;
    let members = ctx
        .storage
        .list_members(channel_id)
        .await
        .map_err(internal)?;
    Ok(members
        .into_iter()
        .map(|member| MemberSummary {
            user: UserSummary {
                id: member.membership.user_id,
                name: member.name,
                avatar_ref: member.avatar_ref,
            },
            role: member.membership.role,
            status: member.status,
            joined_at: member.membership.joined_at,
        })
        .collect())
}

pub async fn update_member_role(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    target: UserId,
    role: ChannelRole,
) -> Result<MembershipPayload, ApiError> {
    let actor = access::require_admin(ctx, channel_id, user_id).await?;
    if !actor.can_manage_members() {
        return Err(ApiError::forbidden("cannot change member roles"));
    }
    if role != ChannelRole::Admin {
        access::ensure_not_last_admin(ctx, channel_id, target).await?;
    }

    match ctx
        .storage
        .set_member_role(channel_id, target, role)
        .await
        .map_err(internal)?
    {
        MemberChange::Applied => {}
        MemberChange::NotMember => return Err(ApiError::not_found("member not found")),
        MemberChange::LastAdmin => return Err(last_admin()),
    }
    let membership = ctx
        .storage
        .membership(channel_id, target)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("member not found"))?;
    info!(
        channel_id = channel_id.0,
        target = target.0,
        role = role.as_str(),
        "member role changed"
    );
    ctx.feed
        .publish(ChangeEvent::member(ChangeKind::Update, channel_id, target));
    Ok(membership_payload(membership))
}

/// Removes `target` from the channel. Removing yourself is leaving.
pub async fn remove_member(
    ctx: &ApiContext,
    user_id: UserId,
    channel_id: ChannelId,
    target: UserId,
) -> Result<(), ApiError> {
    access::require_member_removal(ctx, channel_id, user_id, target).await?;
    access::ensure_not_last_admin(ctx, channel_id, target).await?;

    match ctx
        .storage
        .remove_member(channel_id, target)
        .await
        .map_err(internal)?
    {
        MemberChange::Applied => {}
        MemberChange::NotMember => return Err(ApiError::not_found("member not found")),
        MemberChange::LastAdmin => return Err(last_admin()),
    }
    info!(channel_id = channel_id.0, target = target.0, "member removed");
    ctx.feed
        .publish(ChangeEvent::member(ChangeKind::Delete, channel_id, target));
    Ok(())
}
