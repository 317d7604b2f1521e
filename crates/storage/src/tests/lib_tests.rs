use super::*;

async fn seeded() -> (Storage, StoredUser, StoredChannel) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (alice, created) = storage
        .upsert_user("alice@example.com", "Alice")
        .await
        .expect("alice");
    assert!(created);
    let channel = storage
        .create_channel("general", None, false, alice.id)
        .await
        .expect("channel");
    (storage, alice, channel)
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("nested").join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    storage.health_check().await.expect("health check");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn upsert_user_is_idempotent_per_email() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (first, created) = storage
        .upsert_user("bob@example.com", "Bob")
        .await
        .expect("first");
    assert!(created);
    let (second, created_again) = storage
        .upsert_user("bob@example.com", "Robert")
        .await
        .expect("second");
    assert!(!created_again);
    assert_eq!(first.id, second.id);
    assert_eq!(second.name, "Bob");
    assert_eq!(second.status, PresenceStatus::Offline);
    assert_eq!(second.role, UserRole::User);
}

#[tokio::test]
async fn profile_changes_only_touch_given_fields() {
    let (storage, alice, _) = seeded().await;
    let updated = storage
        .update_profile(
            alice.id,
            &ProfileChanges {
                status: Some(PresenceStatus::Away),
                status_message: Some("lunch".into()),
                ..ProfileChanges::default()
            },
        )
        .await
        .expect("update")
        .expect("user exists");
    assert_eq!(updated.name, "Alice");
    assert_eq!(updated.status, PresenceStatus::Away);
    assert_eq!(updated.status_message.as_deref(), Some("lunch"));

    assert!(storage
        .update_profile(UserId(999), &ProfileChanges::default())
        .await
        .expect("update missing")
        .is_none());
}

#[tokio::test]
async fn channel_creator_becomes_admin_member() {
    let (storage, alice, channel) = seeded().await;
    let membership = storage
        .membership(channel.id, alice.id)
        .await
        .expect("lookup")
        .expect("creator membership");
    assert_eq!(membership.role, ChannelRole::Admin);
    assert_eq!(storage.count_admins(channel.id).await.expect("count"), 1);
    assert_eq!(
        storage
            .count_channels_created_by(alice.id)
            .await
            .expect("created"),
        1
    );
}

#[tokio::test]
async fn private_channels_are_listed_only_for_members() {
    let (storage, alice, _) = seeded().await;
    let (bob, _) = storage
        .upsert_user("bob@example.com", "Bob")
        .await
        .expect("bob");
    storage
        .create_channel("secret", Some("hush"), true, alice.id)
        .await
        .expect("private");

    let for_alice = storage.list_channels_for_user(alice.id).await.expect("alice");
    let for_bob = storage.list_channels_for_user(bob.id).await.expect("bob");
    assert_eq!(
        for_alice.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["general", "secret"]
    );
    assert_eq!(
        for_bob.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        vec!["general"]
    );
}

#[tokio::test]
async fn add_member_reports_duplicates() {
    let (storage, _, channel) = seeded().await;
    let (bob, _) = storage
        .upsert_user("bob@example.com", "Bob")
        .await
        .expect("bob");
    assert!(storage
        .add_member(channel.id, bob.id, ChannelRole::Member)
        .await
        .expect("join"));
    assert!(!storage
        .add_member(channel.id, bob.id, ChannelRole::Member)
        .await
        .expect("rejoin"));
    let members = storage.list_members(channel.id).await.expect("members");
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].name, "Alice");
    assert_eq!(members[1].membership.role, ChannelRole::Member);
}

#[tokio::test]
async fn last_admin_cannot_be_demoted_or_removed() {
    let (storage, alice, channel) = seeded().await;
    let (bob, _) = storage
        .upsert_user("bob@example.com", "Bob")
        .await
        .expect("bob");
    storage
        .add_member(channel.id, bob.id, ChannelRole::Member)
        .await
        .expect("join");

    assert_eq!(
        storage
            .set_member_role(channel.id, alice.id, ChannelRole::Member)
            .await
            .expect("demote"),
        MemberChange::LastAdmin
    );
    assert_eq!(
        storage
            .remove_member(channel.id, alice.id)
            .await
            .expect("remove"),
        MemberChange::LastAdmin
    );

    assert_eq!(
        storage
            .set_member_role(channel.id, bob.id, ChannelRole::Admin)
            .await
            .expect("promote"),
        MemberChange::Applied
    );
    assert_eq!(
        storage
            .set_member_role(channel.id, alice.id, ChannelRole::Member)
            .await
            .expect("demote with second admin"),
        MemberChange::Applied
    );
    assert_eq!(storage.count_admins(channel.id).await.expect("count"), 1);
    assert_eq!(
        storage
            .remove_member(channel.id, UserId(404))
            .await
            .expect("missing"),
        MemberChange::NotMember
    );
}

#[tokio::test]
async fn message_pages_walk_backwards_and_forwards() {
    let (storage, alice, channel) = seeded().await;
    let mut ids = Vec::new();
    for n in 0..7 {
        ids.push(
            storage
                .insert_message(channel.id, alice.id, &format!("m{n}"), None, &[])
                .await
                .expect("insert"),
        );
    }

    let latest = storage
        .list_messages(channel.id, MessagePage::Latest, 3)
        .await
        .expect("latest");
    assert_eq!(
        latest.iter().map(|m| m.id).collect::<Vec<_>>(),
        ids[4..].to_vec()
    );

    let oldest_loaded = MessageCursor::new(latest[0].created_at, latest[0].id);
    let older = storage
        .list_messages(channel.id, MessagePage::Before(oldest_loaded), 3)
        .await
        .expect("older");
    assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), ids[1..4].to_vec());

    let first = storage.message_by_id(ids[0]).await.expect("lookup").expect("first");
    let newer = storage
        .list_messages(
            channel.id,
            MessagePage::After(MessageCursor::new(first.created_at, first.id)),
            100,
        )
        .await
        .expect("newer");
    assert_eq!(newer.iter().map(|m| m.id).collect::<Vec<_>>(), ids[1..].to_vec());
}

#[tokio::test]
async fn replies_are_excluded_from_channel_pages() {
    let (storage, alice, channel) = seeded().await;
    let parent = storage
        .insert_message(channel.id, alice.id, "question", None, &[])
        .await
        .expect("parent");
    let reply = storage
        .insert_message(channel.id, alice.id, "answer", Some(parent), &[])
        .await
        .expect("reply");

    let page = storage
        .list_messages(channel.id, MessagePage::Latest, 50)
        .await
        .expect("page");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].reply_count, 1);

    let replies = storage.list_replies(parent).await.expect("replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].id, reply);
    assert_eq!(replies[0].parent_id, Some(parent));
}

#[tokio::test]
async fn message_files_round_trip() {
    let (storage, alice, channel) = seeded().await;
    let attachment = AttachmentPayload {
        name: "notes.txt".into(),
        url: "files/notes.txt".into(),
        size_bytes: 42,
        mime_type: Some("text/plain".into()),
    };
    let message = storage
        .insert_message(channel.id, alice.id, "see file", None, &[attachment])
        .await
        .expect("insert");
    let files = storage.files_for_messages(&[message]).await.expect("files");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].size_bytes, 42);
    assert!(storage.files_for_messages(&[]).await.expect("empty").is_empty());
}

#[tokio::test]
async fn reaction_cap_is_checked_by_the_insert() {
    let (storage, alice, channel) = seeded().await;
    let message = storage
        .insert_message(channel.id, alice.id, "hi", None, &[])
        .await
        .expect("insert");

    for emoji in ["👍", "🎉"] {
        assert_eq!(
            storage
                .insert_reaction(message, alice.id, emoji, 2)
                .await
                .expect("react"),
            ReactionInsert::Inserted
        );
    }
    assert_eq!(
        storage
            .insert_reaction(message, alice.id, "🚀", 2)
            .await
            .expect("over cap"),
        ReactionInsert::CapReached
    );
    assert_eq!(
        storage
            .insert_reaction(message, alice.id, "👍", 2)
            .await
            .expect("held"),
        ReactionInsert::AlreadyPresent
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reactions_on_disk_stay_within_the_cap() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root.path().join("chat.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));
    let storage = Storage::new(&database_url).await.expect("db");
    let (alice, _) = storage
        .upsert_user("alice@example.com", "Alice")
        .await
        .expect("alice");
    let channel = storage
        .create_channel("general", None, false, alice.id)
        .await
        .expect("channel");
    let message = storage
        .insert_message(channel.id, alice.id, "hi", None, &[])
        .await
        .expect("insert");

    let user_id = alice.id;
    let tasks: Vec<_> = ["😀", "😂", "😍", "😎", "😭", "😡", "👍", "🎉"]
        .into_iter()
        .map(|emoji| {
            let storage = storage.clone();
            tokio::spawn(async move { storage.insert_reaction(message, user_id, emoji, 2).await })
        })
        .collect();
    let mut inserted = 0;
    for task in tasks {
        match task.await.expect("join").expect("insert") {
            ReactionInsert::Inserted => inserted += 1,
            outcome => assert_eq!(outcome, ReactionInsert::CapReached),
        }
    }
    assert_eq!(inserted, 2);
    assert_eq!(
        storage
            .count_user_reactions(message, alice.id)
            .await
            .expect("count"),
        2
    );
}

#[tokio::test]
async fn channel_cap_is_checked_by_the_insert() {
    let (storage, alice, _) = seeded().await;
    let second = storage
        .create_channel_capped("second", None, false, alice.id, 2)
        .await
        .expect("second");
    assert!(second.is_some());
    let third = storage
        .create_channel_capped("third", None, false, alice.id, 2)
        .await
        .expect("third");
    assert!(third.is_none());
    assert!(storage.channel_by_name("third").await.expect("lookup").is_none());
    assert_eq!(
        storage
            .count_channels_created_by(alice.id)
            .await
            .expect("created"),
        2
    );
}

#[tokio::test]
async fn reactions_are_unique_per_user_and_emoji() {
    let (storage, alice, channel) = seeded().await;
    let message = storage
        .insert_message(channel.id, alice.id, "hi", None, &[])
        .await
        .expect("insert");

    assert_eq!(
        storage
            .insert_reaction(message, alice.id, "👍", 10)
            .await
            .expect("react"),
        ReactionInsert::Inserted
    );
    assert_eq!(
        storage
            .insert_reaction(message, alice.id, "👍", 10)
            .await
            .expect("react twice"),
        ReactionInsert::AlreadyPresent
    );
    assert!(storage
        .reaction_exists(message, alice.id, "👍")
        .await
        .expect("exists"));
    assert_eq!(
        storage
            .count_user_reactions(message, alice.id)
            .await
            .expect("count"),
        1
    );

    let rows = storage
        .reactions_for_messages(&[message])
        .await
        .expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].user_name, "Alice");

    assert!(storage
        .delete_reaction(message, alice.id, "👍")
        .await
        .expect("unreact"));
    assert!(!storage
        .delete_reaction(message, alice.id, "👍")
        .await
        .expect("unreact twice"));
}

#[tokio::test]
async fn deleting_a_message_cascades_to_replies_and_reactions() {
    let (storage, alice, channel) = seeded().await;
    let parent = storage
        .insert_message(channel.id, alice.id, "root", None, &[])
        .await
        .expect("parent");
    let reply = storage
        .insert_message(channel.id, alice.id, "child", Some(parent), &[])
        .await
        .expect("reply");
    storage
        .insert_reaction(reply, alice.id, ":tada:", 10)
        .await
        .expect("react");

    assert!(storage.delete_message(parent).await.expect("delete"));
    assert!(storage.message_by_id(reply).await.expect("lookup").is_none());
    assert!(storage
        .reactions_for_messages(&[reply])
        .await
        .expect("rows")
        .is_empty());
}

#[tokio::test]
async fn deleting_a_channel_removes_members_and_messages() {
    let (storage, alice, _) = seeded().await;
    let scratch = storage
        .create_channel("scratch", None, false, alice.id)
        .await
        .expect("scratch");
    let message = storage
        .insert_message(scratch.id, alice.id, "tmp", None, &[])
        .await
        .expect("insert");

    assert!(storage.delete_channel(scratch.id).await.expect("delete"));
    assert!(storage.channel_by_id(scratch.id).await.expect("lookup").is_none());
    assert!(storage
        .membership(scratch.id, alice.id)
        .await
        .expect("membership")
        .is_none());
    assert!(storage.message_by_id(message).await.expect("message").is_none());
}

#[test]
fn timestamps_format_with_fixed_width() {
    let ts = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
        .expect("ts")
        .with_timezone(&Utc);
    assert_eq!(timestamp_text(ts), "2024-05-01T10:00:00.000000Z");
}
