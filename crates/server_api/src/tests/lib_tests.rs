use super::*;

use shared::{
    domain::{ChannelId, ChannelRole, MessageId, UserId, UserRole, GENERAL_CHANNEL},
    error::ErrorCode,
    protocol::{
        ChangeFilter, ChangeKind, ChangeTable, CreateChannelRequest, ListMessagesQuery,
        PageDirection, PostMessageRequest, UpdateChannelRequest, UpdateProfileRequest,
    },
};
use std::time::Duration;

async fn setup() -> (ApiContext, UserId, ChannelId) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let ctx = ApiContext::new(storage);
    let alice = users::sync_user(&ctx, "alice@example.com", "Alice")
        .await
        .expect("alice");
    let general = ctx
        .storage
        .channel_by_name(GENERAL_CHANNEL)
        .await
        .expect("lookup")
        .expect("general exists");
    (ctx, alice.id, general.id)
}

async fn join(ctx: &ApiContext, email: &str, name: &str) -> UserId {
    users::sync_user(ctx, email, name).await.expect("user").id
}

async fn post(ctx: &ApiContext, user: UserId, channel: ChannelId, content: &str) -> MessageId {
    messages::post_message(
        ctx,
        user,
        channel,
        PostMessageRequest {
            content: content.into(),
            parent_id: None,
            files: Vec::new(),
        },
    )
    .await
    .expect("post")
    .id
}

#[tokio::test]
async fn first_user_creates_general_as_admin_and_later_users_join_it() {
    let (ctx, alice, general) = setup().await;
    assert!(access::is_admin(&ctx, general, alice).await.expect("admin"));

    let bob = join(&ctx, "bob@example.com", "Bob").await;
    assert!(access::is_member(&ctx, general, bob).await.expect("member"));
    assert!(!access::is_admin(&ctx, general, bob).await.expect("not admin"));

    let again = users::sync_user(&ctx, "BOB@example.com", "Bobby")
        .await
        .expect("resync");
    assert_eq!(again.id, bob);
}

#[tokio::test]
async fn toggling_a_reaction_twice_restores_the_map() {
    let (ctx, alice, general) = setup().await;
    let message = post(&ctx, alice, general, "hello").await;

    let on = reactions::toggle_reaction(&ctx, alice, general, message, "👍")
        .await
        .expect("on");
    let group = on.get("👍").expect("thumbs group");
    assert_eq!(group.count, 1);
    assert_eq!(group.users[0].id, alice);
    assert_eq!(group.users[0].name, "Alice");

    let off = reactions::toggle_reaction(&ctx, alice, general, message, "👍")
        .await
        .expect("off");
    assert!(off.is_empty());
}

#[tokio::test]
async fn reaction_cap_blocks_new_emoji_but_allows_removal() {
    let (ctx, alice, general) = setup().await;
    let ctx = ctx.with_limits(Limits {
        reaction_cap: 3,
        ..Limits::default()
    });
    let message = post(&ctx, alice, general, "react to me").await;

    for emoji in ["😀", "🎉", ":rocket:"] {
        reactions::toggle_reaction(&ctx, alice, general, message, emoji)
            .await
            .expect("within cap");
    }
    let err = reactions::toggle_reaction(&ctx, alice, general, message, "🔥")
        .await
        .expect_err("over cap");
    assert_eq!(err.code, ErrorCode::LimitReached);

    let after = reactions::toggle_reaction(&ctx, alice, general, message, "🎉")
        .await
        .expect("removal still allowed");
    assert_eq!(after.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_toggles_cannot_overshoot_the_reaction_cap() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    let storage = Storage::new(&database_url).await.expect("db");
    let ctx = ApiContext::new(storage).with_limits(Limits {
        reaction_cap: 2,
        ..Limits::default()
    });
    let alice = join(&ctx, "alice@example.com", "Alice").await;
    let general = ctx
        .storage
        .channel_by_name(GENERAL_CHANNEL)
        .await
        .expect("lookup")
        .expect("general exists")
        .id;
    let message = post(&ctx, alice, general, "pile on").await;

    let tasks: Vec<_> = ["😀", "😂", "😍", "😎", "😭", "😡", "👍", "🎉"]
        .into_iter()
        .map(|emoji| {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                reactions::toggle_reaction(&ctx, alice, general, message, emoji).await
            })
        })
        .collect();
    let mut refused = 0;
    for task in tasks {
        if let Err(err) = task.await.expect("join") {
            assert_eq!(err.code, ErrorCode::LimitReached);
            refused += 1;
        }
    }
    assert_eq!(refused, 6);
    let rows = reactions::list_reactions(&ctx, alice, general, message)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn reactions_group_users_in_row_order() {
    let (ctx, alice, general) = setup().await;
    let bob = join(&ctx, "bob@example.com", "Bob").await;
    let message = post(&ctx, alice, general, "team lunch?").await;

    reactions::toggle_reaction(&ctx, alice, general, message, "🍕")
        .await
        .expect("alice");
    let map = reactions::toggle_reaction(&ctx, bob, general, message, "🍕")
        .await
        .expect("bob");
    let group = map.get("🍕").expect("group");
    assert_eq!(group.count, 2);
    assert_eq!(
        group.users.iter().map(|u| u.id).collect::<Vec<_>>(),
        vec![alice, bob]
    );

    let rows = reactions::list_reactions(&ctx, bob, general, message)
        .await
        .expect("rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].user.name, "Bob");
}

#[tokio::test]
async fn malformed_emoji_is_invalid_input() {
    let (ctx, alice, general) = setup().await;
    let message = post(&ctx, alice, general, "hi").await;
    let err = reactions::toggle_reaction(&ctx, alice, general, message, "thumbs up")
        .await
        .expect_err("malformed");
    assert_eq!(err.code, ErrorCode::InvalidInput);
}

#[tokio::test]
async fn reply_to_message_in_other_channel_is_rejected_without_a_row() {
    let (ctx, alice, general) = setup().await;
    let random = channels::create_channel(
        &ctx,
        alice,
        CreateChannelRequest {
            name: "random".into(),
            description: None,
            is_private: false,
        },
    )
    .await
    .expect("random");
    let foreign_parent = post(&ctx, alice, random.id, "elsewhere").await;

    let err = messages::post_message(
        &ctx,
        alice,
        general,
        PostMessageRequest {
            content: "reply".into(),
            parent_id: Some(foreign_parent),
            files: Vec::new(),
        },
    )
    .await
    .expect_err("cross-channel parent");
    assert_eq!(err.code, ErrorCode::InvalidParent);

    let err = messages::post_message(
        &ctx,
        alice,
        general,
        PostMessageRequest {
            content: "reply".into(),
            parent_id: Some(MessageId(9_999)),
            files: Vec::new(),
        },
    )
    .await
    .expect_err("missing parent");
    assert_eq!(err.code, ErrorCode::InvalidParent);

    let listed = messages::list_messages(&ctx, alice, general, &ListMessagesQuery::default())
        .await
        .expect("list");
    assert!(listed.is_empty());
}

#[tokio::test]
async fn replies_are_counted_and_listed_in_order() {
    let (ctx, alice, general) = setup().await;
    let parent = post(&ctx, alice, general, "question").await;
    for text in ["first", "second"] {
        messages::post_message(
            &ctx,
            alice,
            general,
            PostMessageRequest {
                content: text.into(),
                parent_id: Some(parent),
                files: Vec::new(),
            },
        )
        .await
        .expect("reply");
    }

    let top = messages::list_messages(&ctx, alice, general, &ListMessagesQuery::default())
        .await
        .expect("list");
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].reply_count, 2);

    let replies = messages::list_replies(&ctx, alice, general, parent)
        .await
        .expect("replies");
    assert_eq!(
        replies.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["first", "second"]
    );
}

#[tokio::test]
async fn whitespace_content_creates_no_row() {
    let (ctx, alice, general) = setup().await;
    let err = messages::post_message(
        &ctx,
        alice,
        general,
        PostMessageRequest {
            content: "   ".into(),
            parent_id: None,
            files: Vec::new(),
        },
    )
    .await
    .expect_err("blank");
    assert_eq!(err.code, ErrorCode::InvalidInput);
    let listed = messages::list_messages(&ctx, alice, general, &ListMessagesQuery::default())
        .await
        .expect("list");
    assert!(listed.is_empty());
}

#[tokio::test]
async fn only_the_author_edits_or_deletes() {
    let (ctx, alice, general) = setup().await;
    let bob = join(&ctx, "bob@example.com", "Bob").await;
    let message = post(&ctx, alice, general, "draft").await;

    let err = messages::update_message(&ctx, bob, general, message, "hijack")
        .await
        .expect_err("not author");
    assert_eq!(err.code, ErrorCode::Forbidden);
    let err = messages::delete_message(&ctx, bob, general, message)
        .await
        .expect_err("not author");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let edited = messages::update_message(&ctx, alice, general, message, " final ")
        .await
        .expect("edit");
    assert_eq!(edited.content, "final");
    messages::delete_message(&ctx, alice, general, message)
        .await
        .expect("delete");
    let err = messages::list_replies(&ctx, alice, general, message)
        .await
        .expect_err("gone");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn access_errors_are_distinguishable() {
    let (ctx, alice, _) = setup().await;
    let secret = channels::create_channel(
        &ctx,
        alice,
        CreateChannelRequest {
            name: "secret".into(),
            description: None,
            is_private: true,
        },
    )
    .await
    .expect("secret");
    let bob = join(&ctx, "bob@example.com", "Bob").await;

    let err = messages::list_messages(&ctx, bob, secret.id, &ListMessagesQuery::default())
        .await
        .expect_err("not a member");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = messages::list_messages(&ctx, bob, ChannelId(404), &ListMessagesQuery::default())
        .await
        .expect_err("missing channel");
    assert_eq!(err.code, ErrorCode::NotFound);

    let err = messages::list_messages(&ctx, UserId(777), secret.id, &ListMessagesQuery::default())
        .await
        .expect_err("unknown session user");
    assert_eq!(err.code, ErrorCode::Unauthenticated);

    let err = channels::join_channel(&ctx, bob, secret.id)
        .await
        .expect_err("private");
    assert_eq!(err.code, ErrorCode::InvalidInput);
}

#[tokio::test]
async fn joining_twice_is_invalid_input() {
    let (ctx, alice, general) = setup().await;
    let err = channels::join_channel(&ctx, alice, general)
        .await
        .expect_err("already member");
    assert_eq!(err.code, ErrorCode::InvalidInput);
}

#[tokio::test]
async fn sole_admin_cannot_be_removed_or_demoted() {
    let (ctx, alice, general) = setup().await;
    let bob = join(&ctx, "bob@example.com", "Bob").await;

    let err = channels::remove_member(&ctx, alice, general, alice)
        .await
        .expect_err("last admin leaving");
    assert_eq!(err.code, ErrorCode::InvariantViolation);
    let err = channels::update_member_role(&ctx, alice, general, alice, ChannelRole::Member)
        .await
        .expect_err("last admin demoting");
    assert_eq!(err.code, ErrorCode::InvariantViolation);
    assert!(access::is_admin(&ctx, general, alice).await.expect("still admin"));

    channels::update_member_role(&ctx, alice, general, bob, ChannelRole::Admin)
        .await
        .expect("promote bob");
    channels::update_member_role(&ctx, alice, general, alice, ChannelRole::Member)
        .await
        .expect("demote with two admins");
    assert!(!access::is_admin(&ctx, general, alice).await.expect("demoted"));
}

#[tokio::test]
async fn members_may_leave_but_not_remove_others() {
    let (ctx, alice, general) = setup().await;
    let bob = join(&ctx, "bob@example.com", "Bob").await;
    let carol = join(&ctx, "carol@example.com", "Carol").await;

    let err = channels::remove_member(&ctx, bob, general, carol)
        .await
        .expect_err("not admin");
    assert_eq!(err.code, ErrorCode::Forbidden);
    channels::remove_member(&ctx, bob, general, bob)
        .await
        .expect("leave");
    channels::remove_member(&ctx, alice, general, carol)
        .await
        .expect("admin removes");
    let members = channels::list_members(&ctx, alice, general)
        .await
        .expect("members");
    assert_eq!(members.len(), 1);
}

#[tokio::test]
async fn global_admin_manages_channels_without_membership() {
    let (ctx, alice, _) = setup().await;
    let bob = join(&ctx, "bob@example.com", "Bob").await;
    let room = channels::create_channel(
        &ctx,
        alice,
        CreateChannelRequest {
            name: "Design Room".into(),
            description: Some("mockups".into()),
            is_private: true,
        },
    )
    .await
    .expect("room");
    assert_eq!(room.name, "design-room");

    let err = channels::delete_channel(&ctx, bob, room.id)
        .await
        .expect_err("plain user");
    assert_eq!(err.code, ErrorCode::Forbidden);

    ctx.storage
        .set_user_role(bob, UserRole::Admin)
        .await
        .expect("promote");
    let renamed = channels::update_channel(
        &ctx,
        bob,
        room.id,
        UpdateChannelRequest {
            description: Some("final mockups".into()),
            ..UpdateChannelRequest::default()
        },
    )
    .await
    .expect("global admin update");
    assert_eq!(renamed.description.as_deref(), Some("final mockups"));

    let err = messages::post_message(
        &ctx,
        bob,
        room.id,
        PostMessageRequest {
            content: "hi".into(),
            parent_id: None,
            files: Vec::new(),
        },
    )
    .await
    .expect_err("posting still needs membership");
    assert_eq!(err.code, ErrorCode::Forbidden);
    channels::delete_channel(&ctx, bob, room.id)
        .await
        .expect("global admin delete");
}

#[tokio::test]
async fn general_cannot_be_deleted() {
    let (ctx, alice, general) = setup().await;
    let err = channels::delete_channel(&ctx, alice, general)
        .await
        .expect_err("general");
    assert_eq!(err.code, ErrorCode::InvariantViolation);
}

#[tokio::test]
async fn channel_cap_is_enforced_per_creator() {
    let (ctx, alice, _) = setup().await;
    let ctx = ctx.with_limits(Limits {
        channel_cap: 2,
        ..Limits::default()
    });
    // general already counts toward alice's cap
    channels::create_channel(
        &ctx,
        alice,
        CreateChannelRequest {
            name: "one".into(),
            description: None,
            is_private: false,
        },
    )
    .await
    .expect("second channel");
    let err = channels::create_channel(
        &ctx,
        alice,
        CreateChannelRequest {
            name: "two".into(),
            description: None,
            is_private: false,
        },
    )
    .await
    .expect_err("over cap");
    assert_eq!(err.code, ErrorCode::LimitReached);
}

#[tokio::test]
async fn pages_walk_older_without_duplicates() {
    let (ctx, alice, general) = setup().await;
    for n in 0..120 {
        post(&ctx, alice, general, &format!("message {n}")).await;
    }

    let mut seen = std::collections::HashSet::new();
    let mut sizes = Vec::new();
    let mut cursor = None;
    loop {
        let page = messages::list_messages(
            &ctx,
            alice,
            general,
            &ListMessagesQuery {
                cursor: cursor.clone(),
                direction: Some(PageDirection::Older),
                limit: Some(50),
            },
        )
        .await
        .expect("page");
        sizes.push(page.len());
        for message in &page {
            assert!(seen.insert(message.id), "duplicate {}", message.id);
        }
        if page.len() < 50 {
            break;
        }
        cursor = page.first().map(|m| m.cursor().encode());
    }
    assert_eq!(sizes, vec![50, 50, 20]);
}

#[tokio::test]
async fn newer_direction_pages_forward() {
    let (ctx, alice, general) = setup().await;
    let first = post(&ctx, alice, general, "one").await;
    post(&ctx, alice, general, "two").await;
    post(&ctx, alice, general, "three").await;

    let all = messages::list_messages(&ctx, alice, general, &ListMessagesQuery::default())
        .await
        .expect("all");
    assert_eq!(all[0].id, first);
    let newer = messages::list_messages(
        &ctx,
        alice,
        general,
        &ListMessagesQuery {
            cursor: Some(all[0].cursor().encode()),
            direction: Some(PageDirection::Newer),
            limit: None,
        },
    )
    .await
    .expect("newer");
    assert_eq!(
        newer.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(),
        vec!["two", "three"]
    );

    let err = messages::list_messages(
        &ctx,
        alice,
        general,
        &ListMessagesQuery {
            cursor: Some("%%%".into()),
            direction: None,
            limit: None,
        },
    )
    .await
    .expect_err("bad cursor");
    assert_eq!(err.code, ErrorCode::InvalidInput);
}

#[tokio::test]
async fn writes_are_published_on_the_change_feed() {
    let (ctx, alice, general) = setup().await;
    let mut events = ctx.feed.subscribe();
    let message = post(&ctx, alice, general, "ping").await;
    reactions::toggle_reaction(&ctx, alice, general, message, "👀")
        .await
        .expect("react");

    let posted = events.recv().await.expect("message event");
    assert_eq!(posted.table, ChangeTable::Messages);
    assert_eq!(posted.kind, ChangeKind::Insert);
    assert!(ChangeFilter::ChannelMessages { channel_id: general }.matches(&posted));

    let reacted = events.recv().await.expect("reaction event");
    assert!(ChangeFilter::MessageReactions {
        message_ids: vec![message]
    }
    .matches(&reacted));
}

#[tokio::test]
async fn rate_limited_posts_carry_retry_after() {
    let (ctx, alice, general) = setup().await;
    let limiter = RateLimiter::new(
        std::sync::Arc::new(InMemoryCounterStore::default()),
        2,
        Duration::from_secs(30),
    );
    let ctx = ctx.with_rate_limiter(std::sync::Arc::new(limiter));
    post(&ctx, alice, general, "one").await;
    post(&ctx, alice, general, "two").await;
    let err = messages::post_message(
        &ctx,
        alice,
        general,
        PostMessageRequest {
            content: "three".into(),
            parent_id: None,
            files: Vec::new(),
        },
    )
    .await
    .expect_err("limited");
    assert_eq!(err.code, ErrorCode::RateLimited);
    assert!(err.retry_after_secs.is_some());
}

#[tokio::test]
async fn profile_updates_validate_status_fields() {
    let (ctx, alice, _) = setup().await;
    let err = users::update_profile(
        &ctx,
        alice,
        UpdateProfileRequest {
            status_message: Some("x".repeat(26)),
            ..UpdateProfileRequest::default()
        },
    )
    .await
    .expect_err("too long");
    assert_eq!(err.code, ErrorCode::InvalidInput);

    let profile = users::update_profile(
        &ctx,
        alice,
        UpdateProfileRequest {
            status: Some(shared::domain::PresenceStatus::Away),
            status_message: Some("focusing".into()),
            status_emoji: Some(":headphones:".into()),
            ..UpdateProfileRequest::default()
        },
    )
    .await
    .expect("update");
    assert_eq!(profile.status, shared::domain::PresenceStatus::Away);
    assert_eq!(profile.status_emoji.as_deref(), Some(":headphones:"));
}
