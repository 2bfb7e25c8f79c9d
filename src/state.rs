use std::{collections::HashMap, sync::Arc};
use chrono::Utc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::protocol::{Participant, Presence, ServerEvent, StatusPatch, UserProfile};

pub type Tx = mpsc::UnboundedSender<ServerEvent>;

/* ------------ 連線 session ------------ */
pub struct Session {
    pub id:      String,
    pub user_id: String,
    pub room:    String,
    pub user:    UserProfile,
    pub tx:      Tx,
}

impl Session {
    fn participant(&self) -> Participant {
        Participant { user: self.user.clone(), socket_id: self.id.clone(), is_online: true }
    }

    fn presence(&self) -> Presence {
        Presence { user: self.user.clone(), socket_id: self.id.clone(), timestamp: now() }
    }

    fn send(&self, ev: ServerEvent) {
        // 對方已斷線就算了
        self.tx.send(ev).ok();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("room is full ({limit})")]
    Full { limit: usize },
}

/// What a newly admitted session is told about its room.
#[derive(Debug)]
pub struct Admission {
    pub participants: Vec<Participant>,
    pub peers:        Vec<String>,
}

/* ------------ 房間名冊 ------------ */
/// Every room and session the relay knows about. Each mutating call updates
/// the maps and queues the resulting broadcasts before returning, so a caller
/// holding the write guard performs both as one step.
pub struct RoomRegistry {
    capacity: usize,
    rooms:    HashMap<String, Vec<String>>, // room -> 依加入順序的 session id
    sessions: HashMap<String, Session>,
}

pub type Registry = Arc<RwLock<RoomRegistry>>;

impl RoomRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, rooms: HashMap::new(), sessions: HashMap::new() }
    }

    pub fn shared(capacity: usize) -> Registry { Arc::new(RwLock::new(Self::new(capacity))) }

    pub fn capacity(&self) -> usize { self.capacity }
    pub fn room_count(&self) -> usize { self.rooms.len() }
    pub fn session_count(&self) -> usize { self.sessions.len() }

    pub fn room_size(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, Vec::len)
    }

    pub fn room_sizes(&self) -> Vec<(String, usize)> {
        let mut v: Vec<_> = self.rooms.iter().map(|(id, m)| (id.clone(), m.len())).collect();
        v.sort();
        v
    }

    /// Capacity check, insert, and `presence:join` to the existing members.
    /// A full room is left untouched.
    pub fn admit(&mut self, session: Session) -> Result<Admission, Rejected> {
        let members = self.rooms.get(&session.room).map_or(0, Vec::len);
        if members >= self.capacity {
            info!(room = %session.room, members, limit = self.capacity, "room is full");
            return Err(Rejected::Full { limit: self.capacity });
        }

        let join = ServerEvent::PresenceJoin(session.presence());
        for other in self.members(&session.room) {
            other.send(join.clone());
        }

        let (id, room, uid) = (session.id.clone(), session.room.clone(), session.user_id.clone());
        self.rooms.entry(room.clone()).or_default().push(id.clone());
        self.sessions.insert(id.clone(), session);
        info!(%room, session = %id, user = %uid, size = self.room_size(&room), limit = self.capacity, "joined");

        Ok(Admission { participants: self.participants(&room), peers: self.peers(&id) })
    }

    /// Drops the session, tells the rest of the room, and deletes an emptied
    /// room. Returns `None` if the session was already gone.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        let room = session.room.clone();

        let now_empty = match self.rooms.get_mut(&room) {
            Some(members) => {
                members.retain(|m| m != id);
                members.is_empty()
            }
            None => false,
        };

        let leave = ServerEvent::PresenceLeave(session.presence());
        for other in self.members(&room) {
            other.send(leave.clone());
        }

        if now_empty {
            self.rooms.remove(&room);
            info!(%room, "room deleted (empty)");
        } else {
            info!(%room, session = %id, user = %session.user_id, size = self.room_size(&room), "left");
        }
        Some(session)
    }

    /// Ids of everyone else in the caller's room, in join order.
    pub fn peers(&self, id: &str) -> Vec<String> {
        let Some(s) = self.sessions.get(id) else { return Vec::new() };
        self.rooms
            .get(&s.room)
            .map(|m| m.iter().filter(|other| *other != id).cloned().collect())
            .unwrap_or_default()
    }

    pub fn participants(&self, room: &str) -> Vec<Participant> {
        self.members(room).map(Session::participant).collect()
    }

    pub fn session(&self, id: &str) -> Option<&Session> { self.sessions.get(id) }

    /// Merges the patch into the cached profile and tells everyone but the sender.
    pub fn update_status(&mut self, id: &str, mut patch: StatusPatch) -> bool {
        let Some(s) = self.sessions.get_mut(id) else { return false };
        let dropped = s.user.merge_status(&patch);
        if !dropped.is_empty() {
            debug!(session = %id, ?dropped, "status patch touched reserved fields");
            patch.retain(|k, _| !dropped.contains(k));
        }
        let ev = ServerEvent::StatusChange {
            user:      s.user.clone(),
            socket_id: id.to_string(),
            status:    patch,
            timestamp: now(),
        };
        let room = s.room.clone();
        for other in self.members(&room).filter(|o| o.id != id) {
            other.send(ev.clone());
        }
        true
    }

    /// Best effort delivery to a session in the sender's room.
    pub fn relay(&self, from: &str, to: &str, ev: ServerEvent) -> bool {
        let (Some(src), Some(dst)) = (self.sessions.get(from), self.sessions.get(to)) else {
            return false;
        };
        if src.room != dst.room || from == to {
            return false;
        }
        dst.send(ev);
        true
    }

    /// Sends directly to one session (replies to queries).
    pub fn reply(&self, id: &str, ev: ServerEvent) {
        if let Some(s) = self.sessions.get(id) {
            s.send(ev);
        }
    }

    fn members<'a>(&'a self, room: &str) -> impl Iterator<Item = &'a Session> + 'a {
        self.rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter_map(|id| self.sessions.get(id))
    }
}

fn now() -> String { Utc::now().to_rfc3339() }

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn session(id: &str, room: &str) -> (Session, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let s = Session {
            id: id.into(),
            user_id: format!("u-{id}"),
            room: room.into(),
            user: UserProfile::placeholder(&format!("u-{id}")),
            tx,
        };
        (s, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut v = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            v.push(ev);
        }
        v
    }

    #[test]
    fn admission_reports_roster_and_peers() {
        let mut reg = RoomRegistry::new(10);
        let (a, mut ra) = session("a", "42");
        let first = reg.admit(a).unwrap();
        assert!(first.peers.is_empty());
        assert_eq!(first.participants.len(), 1);

        let (b, _rb) = session("b", "42");
        let second = reg.admit(b).unwrap();
        assert_eq!(second.peers, vec!["a".to_string()]);
        assert_eq!(second.participants.len(), 2);

        // a 收到 b 的 presence:join，且 a 的 peers 即時反映 b
        let evs = drain(&mut ra);
        assert!(matches!(&evs[..], [ServerEvent::PresenceJoin(p)] if p.socket_id == "b"));
        assert_eq!(reg.peers("a"), vec!["b".to_string()]);
    }

    #[test]
    fn full_room_rejects_without_changing_membership() {
        let mut reg = RoomRegistry::new(10);
        let mut rxs = Vec::new();
        for i in 0..10 {
            let (s, rx) = session(&format!("s{i}"), "42");
            reg.admit(s).unwrap();
            rxs.push(rx);
        }
        for rx in rxs.iter_mut() {
            drain(rx);
        }

        let (extra, _rx) = session("s10", "42");
        assert_eq!(reg.admit(extra).unwrap_err(), Rejected::Full { limit: 10 });
        assert_eq!(reg.room_size("42"), 10);
        assert!(reg.session("s10").is_none());
        // 沒有人收到多餘的 presence:join
        assert!(rxs.iter_mut().all(|rx| drain(rx).is_empty()));

        for s in reg.peers("s0") {
            assert_ne!(s, "s0");
        }
        assert_eq!(reg.peers("s0").len(), 9);
    }

    #[test]
    fn leave_is_broadcast_once_and_empty_room_deleted() {
        let mut reg = RoomRegistry::new(10);
        let (a, mut ra) = session("a", "r");
        let (b, _rb) = session("b", "r");
        reg.admit(a).unwrap();
        reg.admit(b).unwrap();
        drain(&mut ra);

        assert!(reg.remove("b").is_some());
        assert!(reg.remove("b").is_none());
        let evs = drain(&mut ra);
        assert_eq!(evs.len(), 1);
        assert!(matches!(&evs[0], ServerEvent::PresenceLeave(p) if p.socket_id == "b"));
        assert!(reg.peers("a").is_empty());

        reg.remove("a");
        assert_eq!(reg.room_count(), 0);
        assert_eq!(reg.session_count(), 0);
    }

    #[test]
    fn status_goes_to_everyone_but_sender() {
        let mut reg = RoomRegistry::new(10);
        let (a, mut ra) = session("a", "r");
        let (b, mut rb) = session("b", "r");
        reg.admit(a).unwrap();
        reg.admit(b).unwrap();
        drain(&mut ra);

        let patch = json!({"is_muted": false}).as_object().cloned().unwrap();
        assert!(reg.update_status("b", patch));
        assert!(drain(&mut rb).is_empty());
        match &drain(&mut ra)[..] {
            [ServerEvent::StatusChange { socket_id, status, user, .. }] => {
                assert_eq!(socket_id, "b");
                assert_eq!(status.get("is_muted"), Some(&json!(false)));
                assert_eq!(user.status.get("is_muted"), Some(&json!(false)));
            }
            other => panic!("unexpected {other:?}"),
        }
        let roster = reg.participants("r");
        assert_eq!(roster[1].user.status.get("is_muted"), Some(&json!(false)));
    }

    #[test]
    fn roster_survives_a_patch_naming_roster_keys() {
        let mut reg = RoomRegistry::new(10);
        let (a, mut ra) = session("a", "r");
        let (b, _rb) = session("b", "r");
        reg.admit(a).unwrap();
        reg.admit(b).unwrap();
        drain(&mut ra);

        let patch = json!({"socket_id": "evil", "is_muted": true}).as_object().cloned().unwrap();
        assert!(reg.update_status("b", patch));
        match &drain(&mut ra)[..] {
            [ServerEvent::StatusChange { status, .. }] => {
                assert!(status.get("socket_id").is_none());
                assert_eq!(status.get("is_muted"), Some(&json!(true)));
            }
            other => panic!("unexpected {other:?}"),
        }

        let wire = serde_json::to_string(&ServerEvent::participants(reg.participants("r"))).unwrap();
        match serde_json::from_str::<ServerEvent>(&wire).unwrap() {
            ServerEvent::ParticipantsList { participants, total } => {
                assert_eq!(total, 2);
                assert_eq!(participants[1].socket_id, "b");
                assert_eq!(participants[1].user.status.get("is_muted"), Some(&json!(true)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn relay_drops_missing_or_foreign_targets() {
        let mut reg = RoomRegistry::new(10);
        let (a, _ra) = session("a", "r1");
        let (b, mut rb) = session("b", "r1");
        let (c, mut rc) = session("c", "r2");
        reg.admit(a).unwrap();
        reg.admit(b).unwrap();
        reg.admit(c).unwrap();

        let ev = ServerEvent::PeerDisconnected("x".into());
        assert!(reg.relay("a", "b", ev.clone()));
        assert!(!reg.relay("a", "c", ev.clone()));
        assert!(!reg.relay("a", "gone", ev));
        assert_eq!(drain(&mut rb).len(), 1);
        assert!(drain(&mut rc).is_empty());
    }
}
