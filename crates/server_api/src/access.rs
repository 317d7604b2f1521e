//! Membership and role gates shared by every write path.

use shared::{
    domain::{ChannelId, ChannelRole, UserId, UserRole},
    error::{ApiError, ErrorCode},
};
use storage::{StoredChannel, StoredMembership, StoredUser};

use crate::{internal, ApiContext};

/// Resolves a session's user id to a live user row.
pub async fn current_user(ctx: &ApiContext, user_id: UserId) -> Result<StoredUser, ApiError> {
    ctx.storage
        .user_by_id(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(ApiError::unauthenticated)
}

pub async fn channel_exists(
    ctx: &ApiContext,
    channel_id: ChannelId,
) -> Result<Option<StoredChannel>, ApiError> {
    ctx.storage.channel_by_id(channel_id).await.map_err(internal)
}

pub async fn is_member(
    ctx: &ApiContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<bool, ApiError> {
    Ok(membership(ctx, channel_id, user_id).await?.is_some())
}

pub async fn is_admin(
    ctx: &ApiContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<bool, ApiError> {
    Ok(membership(ctx, channel_id, user_id)
        .await?
        .is_some_and(|m| m.role == ChannelRole::Admin))
}

async fn membership(
    ctx: &ApiContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<Option<StoredMembership>, ApiError> {
    ctx.storage
        .membership(channel_id, user_id)
        .await
        .map_err(internal)
}

async fn existing_channel(
    ctx: &ApiContext,
    channel_id: ChannelId,
) -> Result<StoredChannel, ApiError> {
    channel_exists(ctx, channel_id)
        .await?
        .ok_or_else(|| ApiError::not_found("channel not found"))
}

/// The channel exists and `user_id` belongs to it.
pub async fn require_member(
    ctx: &ApiContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<(StoredChannel, StoredMembership), ApiError> {
    current_user(ctx, user_id).await?;
    let channel = existing_channel(ctx, channel_id).await?;
    let membership = membership(ctx, channel_id, user_id)
        .await?
        .ok_or_else(|| ApiError::forbidden("not a member of this channel"))?;
    Ok((channel, membership))
}

/// Who is acting on a channel and with which rights.
#[derive(Debug, Clone)]
pub struct ChannelActor {
    pub user: StoredUser,
    pub channel: StoredChannel,
    pub membership: Option<StoredMembership>,
}

impl ChannelActor {
    fn is_global_admin(&self) -> bool {
        self.user.role == UserRole::Admin
    }

    pub fn can_manage_channel(&self) -> bool {
        self.is_global_admin()
            || self
                .membership
                .as_ref()
                .is_some_and(|m| m.role.can_manage_channel())
    }

    pub fn can_manage_members(&self) -> bool {
        self.is_global_admin()
            || self
                .membership
                .as_ref()
                .is_some_and(|m| m.role.can_manage_members())
    }

    pub fn can_remove_member(&self, target: UserId) -> bool {
        let is_self = target == self.user.id;
        if self.is_global_admin() {
            return true;
        }
        self.membership
            .as_ref()
            .is_some_and(|m| m.role.can_remove_member(is_self))
    }
}

async fn channel_actor(
    ctx: &ApiContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<ChannelActor, ApiError> {
    let user = current_user(ctx, user_id).await?;
    let channel = existing_channel(ctx, channel_id).await?;
    let membership = membership(ctx, channel_id, user_id).await?;
    Ok(ChannelActor {
        user,
        channel,
        membership,
    })
}

/// Channel admins, or users whose global role is admin.
pub async fn require_admin(
    ctx: &ApiContext,
    channel_id: ChannelId,
    user_id: UserId,
) -> Result<ChannelActor, ApiError> {
    let actor = channel_actor(ctx, channel_id, user_id).await?;
    if !actor.can_manage_channel() {
        return Err(ApiError::forbidden("channel admin rights required"));
    }
    Ok(actor)
}

/// Checks that `target` may be removed from the channel by `user_id`.
pub async fn require_member_removal(
    ctx: &ApiContext,
    channel_id: ChannelId,
    user_id: UserId,
    target: UserId,
) -> Result<ChannelActor, ApiError> {
    let actor = channel_actor(ctx, channel_id, user_id).await?;
    if !actor.can_remove_member(target) {
        return Err(ApiError::forbidden("cannot remove this member"));
    }
    Ok(actor)
}

/// Rejects demoting or removing `target` when it is the channel's only admin.
pub async fn ensure_not_last_admin(
    ctx: &ApiContext,
    channel_id: ChannelId,
    target: UserId,
) -> Result<StoredMembership, ApiError> {
    let membership = membership(ctx, channel_id, target)
        .await?
        .ok_or_else(|| ApiError::not_found("member not found"))?;
    if membership.role == ChannelRole::Admin {
        let admins = ctx.storage.count_admins(channel_id).await.map_err(internal)?;
        if admins <= 1 {
            return Err(last_admin());
        }
    }
    Ok(membership)
}

pub(crate) fn last_admin() -> ApiError {
    ApiError::new(
        ErrorCode::InvariantViolation,
        "a channel must keep at least one admin",
    )
}
