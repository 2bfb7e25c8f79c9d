use std::collections::HashSet;
use serde_json::Value;

use crate::protocol::{Participant, Presence, StatusPatch};

/// Client-side "who is online", keyed by session id. A session that left is
/// kept out until it is seen joining again, even if a stale roster still
/// lists it.
#[derive(Debug, Default)]
pub struct PresenceView {
    online:   Vec<Participant>,
    departed: HashSet<String>,
}

impl PresenceView {
    pub fn new() -> Self { Self::default() }

    /// Replaces the view with a fresh roster.
    pub fn replace(&mut self, roster: Vec<Participant>) {
        self.online.clear();
        for p in roster {
            if self.departed.contains(&p.socket_id) || self.contains(&p.socket_id) {
                continue;
            }
            self.online.push(p);
        }
    }

    pub fn join(&mut self, presence: Presence) {
        let Presence { mut user, socket_id, timestamp } = presence;
        self.departed.remove(&socket_id);
        user.status.insert("joined_at".into(), Value::String(timestamp));
        let p = Participant { user, socket_id, is_online: true };
        match self.online.iter_mut().find(|o| o.socket_id == p.socket_id) {
            Some(existing) => *existing = p,
            None => self.online.push(p),
        }
    }

    pub fn leave(&mut self, socket_id: &str) {
        self.online.retain(|p| p.socket_id != socket_id);
        self.departed.insert(socket_id.to_string());
    }

    /// Merges a status change; unknown sessions are ignored.
    pub fn update(&mut self, socket_id: &str, status: &StatusPatch, timestamp: &str) -> bool {
        let Some(p) = self.online.iter_mut().find(|p| p.socket_id == socket_id) else {
            return false;
        };
        p.user.merge_status(status);
        p.user.status.insert("status_updated_at".into(), Value::String(timestamp.to_string()));
        true
    }

    pub fn clear(&mut self) {
        self.online.clear();
        self.departed.clear();
    }

    pub fn list(&self) -> &[Participant] { &self.online }

    pub fn contains(&self, socket_id: &str) -> bool {
        self.online.iter().any(|p| p.socket_id == socket_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UserProfile;
    use serde_json::json;

    fn part(sid: &str) -> Participant {
        Participant { user: UserProfile::placeholder(sid), socket_id: sid.into(), is_online: true }
    }

    fn presence(sid: &str) -> Presence {
        Presence { user: UserProfile::placeholder(sid), socket_id: sid.into(), timestamp: "t0".into() }
    }

    #[test]
    fn departed_sessions_stay_out_of_stale_rosters() {
        let mut v = PresenceView::new();
        v.replace(vec![part("a"), part("b")]);
        v.leave("b");
        assert!(!v.contains("b"));

        // 延遲抵達的舊名冊
        v.replace(vec![part("a"), part("b"), part("a")]);
        assert_eq!(v.list().len(), 1);
        assert!(!v.contains("b"));

        v.join(presence("b"));
        assert!(v.contains("b"));
        assert_eq!(v.list()[1].user.status.get("joined_at"), Some(&json!("t0")));
    }

    #[test]
    fn join_is_idempotent_and_status_merges() {
        let mut v = PresenceView::new();
        v.join(presence("a"));
        v.join(presence("a"));
        assert_eq!(v.list().len(), 1);

        let patch = json!({"is_muted": true}).as_object().cloned().unwrap();
        assert!(v.update("a", &patch, "t1"));
        assert!(!v.update("zz", &patch, "t1"));
        let st = &v.list()[0].user.status;
        assert_eq!(st.get("is_muted"), Some(&json!(true)));
        assert_eq!(st.get("status_updated_at"), Some(&json!("t1")));

        v.clear();
        assert!(v.list().is_empty());
    }
}
