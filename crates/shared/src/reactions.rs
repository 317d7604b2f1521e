use crate::protocol::{ReactionGroup, ReactionsByEmoji, UserSummary};

/// Buckets reaction rows by emoji, in row order within each bucket.
pub fn group_reactions<I>(rows: I) -> ReactionsByEmoji
where
    I: IntoIterator<Item = (String, UserSummary)>,
{
    let mut grouped = ReactionsByEmoji::new();
    for (emoji, user) in rows {
        let group = grouped
            .entry(emoji.clone())
            .or_insert_with(|| ReactionGroup {
                emoji,
                count: 0,
                users: Vec::new(),
            });
        group.users.push(user);
        group.count = group.users.len();
    }
    grouped
}

/// Applies one toggle by `actor` to an already grouped map and regroups the
/// result the same way the server does.
pub fn toggle_grouped(
    current: &ReactionsByEmoji,
    actor: &UserSummary,
    emoji: &str,
) -> ReactionsByEmoji {
    let mut rows: Vec<(String, UserSummary)> = current
        .values()
        .flat_map(|group| {
            group
                .users
                .iter()
                .map(move |user| (group.emoji.clone(), user.clone()))
        })
        .collect();

    match rows
        .iter()
        .position(|(e, user)| e == emoji && user.id == actor.id)
    {
        Some(index) => {
            rows.remove(index);
        }
        None => rows.push((emoji.to_string(), actor.clone())),
    }

    group_reactions(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UserId;

    fn user(id: i64, name: &str) -> UserSummary {
        UserSummary {
            id: UserId(id),
            name: name.into(),
            avatar_ref: None,
        }
    }

    #[test]
    fn groups_by_emoji_with_counts() {
        let grouped = group_reactions(vec![
            ("👍".to_string(), user(1, "ann")),
            ("🎉".to_string(), user(2, "bo")),
            ("👍".to_string(), user(2, "bo")),
        ]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["👍"].count, 2);
        assert_eq!(grouped["👍"].users[1].name, "bo");
        assert_eq!(grouped["🎉"].count, 1);
    }

    #[test]
    fn toggling_twice_restores_the_map() {
        let start = group_reactions(vec![("🎉".to_string(), user(2, "bo"))]);
        let me = user(1, "You");
        let on = toggle_grouped(&start, &me, "👍");
        assert_eq!(on["👍"].users, vec![me.clone()]);
        let off = toggle_grouped(&on, &me, "👍");
        assert_eq!(off, start);
    }

    #[test]
    fn removing_last_user_drops_the_bucket() {
        let me = user(1, "You");
        let on = toggle_grouped(&ReactionsByEmoji::new(), &me, "👍");
        assert!(toggle_grouped(&on, &me, "👍").is_empty());
    }
}
