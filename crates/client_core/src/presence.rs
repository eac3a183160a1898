use std::collections::BTreeSet;

use shared::domain::UserId;

/// Online set as last reported by the server. Each snapshot replaces the
/// previous one wholesale; the local user is never listed.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    local_user: Option<UserId>,
    online: BTreeSet<UserId>,
}

impl PresenceTracker {
    pub fn set_local_user(&mut self, user: Option<UserId>) {
        if let Some(user) = &user {
            self.online.remove(user);
        }
        self.local_user = user;
    }

    /// Returns `true` when the visible online set changed.
    pub fn on_presence_snapshot(&mut self, users: Vec<UserId>) -> bool {
        let next: BTreeSet<UserId> = users
            .into_iter()
            .filter(|user| Some(user) != self.local_user.as_ref())
            .collect();
        let changed = next != self.online;
        self.online = next;
        changed
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.online.contains(user)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.online.iter().cloned().collect()
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.online.is_empty();
        self.online.clear();
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_replaces_previous_set_and_hides_local_user() {
        let mut presence = PresenceTracker::default();
        presence.set_local_user(Some(UserId::from("alice")));

        assert!(presence.on_presence_snapshot(vec![
            UserId::from("bob"),
            UserId::from("alice"),
            UserId::from("carol"),
        ]));
        assert_eq!(
            presence.online_users(),
            vec![UserId::from("bob"), UserId::from("carol")]
        );

        assert!(presence.on_presence_snapshot(vec![UserId::from("dave")]));
        assert!(!presence.is_online(&UserId::from("bob")));
        assert!(presence.is_online(&UserId::from("dave")));
        assert!(!presence.is_online(&UserId::from("alice")));
    }

    #[test]
    fn identical_snapshot_reports_no_change() {
        let mut presence = PresenceTracker::default();
        assert!(presence.on_presence_snapshot(vec![UserId::from("bob")]));
        assert!(!presence.on_presence_snapshot(vec![UserId::from("bob")]));
        assert!(presence.clear());
        assert!(presence.online_users().is_empty());
    }
}
