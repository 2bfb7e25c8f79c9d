//! 信令協定：`{"event": "...", "data": ...}` 的 JSON 文字訊框
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type StatusPatch = Map<String, Value>;

/* ------------ 使用者資料 ------------ */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// status flags merged in by `user:status` (e.g. `is_muted`)
    #[serde(flatten)]
    pub status: StatusPatch,
}

fn string_or_number<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected id, got {other}"))),
    }
}

/// Profile fields a status patch may never overwrite.
pub const IDENTITY_FIELDS: [&str; 5] = ["id", "name", "email", "profile", "created_at"];

/// Keys written next to the flattened profile by rosters and the presence view.
/// Letting them into `status` would serialize duplicate keys.
pub const ROSTER_FIELDS: [&str; 5] = ["socket_id", "socketId", "is_online", "joined_at", "status_updated_at"];

fn reserved(key: &str) -> bool {
    IDENTITY_FIELDS.contains(&key) || ROSTER_FIELDS.contains(&key)
}

impl UserProfile {
    /// Stand-in used when the directory cannot be reached.
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: format!("User {id}"),
            email: None,
            profile: None,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            status: Map::new(),
        }
    }

    /// Merges a status patch, returning the keys that were dropped.
    pub fn merge_status(&mut self, patch: &StatusPatch) -> Vec<String> {
        let mut dropped = Vec::new();
        for (k, v) in patch {
            if reserved(k) {
                dropped.push(k.clone());
                continue;
            }
            self.status.insert(k.clone(), v.clone());
        }
        dropped
    }

    /// Removes roster keys a directory profile smuggled into `status`.
    pub fn strip_reserved(&mut self) {
        self.status.retain(|k, _| !ROSTER_FIELDS.contains(&k.as_str()));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(flatten)]
    pub user: UserProfile,
    pub socket_id: String,
    #[serde(default = "online")]
    pub is_online: bool,
}

fn online() -> bool { true }

/* ------------ 協商內容 ------------ */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self { Self { kind: SdpKind::Offer, sdp: sdp.into() } }
    pub fn answer(sdp: impl Into<String>) -> Self { Self { kind: SdpKind::Answer, sdp: sdp.into() } }
}

/// Browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/* ------------ server → client ------------ */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user: UserProfile,
    pub socket_id: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "connected", rename_all = "camelCase")]
    Connected { ok: bool, user: UserProfile, socket_id: String },
    #[serde(rename = "room:full")]
    RoomFull { limit: usize },
    #[serde(rename = "participants:list")]
    ParticipantsList { participants: Vec<Participant>, total: usize },
    #[serde(rename = "presence:join")]
    PresenceJoin(Presence),
    #[serde(rename = "presence:leave")]
    PresenceLeave(Presence),
    #[serde(rename = "user:status:change", rename_all = "camelCase")]
    StatusChange { user: UserProfile, socket_id: String, status: StatusPatch, timestamp: String },
    #[serde(rename = "peers:list")]
    PeersList { peers: Vec<String> },
    #[serde(rename = "webrtc:offer")]
    Offer { from: String, sdp: SessionDescription },
    #[serde(rename = "webrtc:answer")]
    Answer { from: String, sdp: SessionDescription },
    #[serde(rename = "webrtc:ice")]
    Ice { from: String, candidate: IceCandidate },
    #[serde(rename = "peer:disconnected")]
    PeerDisconnected(String),
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerEvent {
    pub fn participants(participants: Vec<Participant>) -> Self {
        let total = participants.len();
        ServerEvent::ParticipantsList { participants, total }
    }
}

/* ------------ client → server ------------ */
fn null_as_empty<'de, D: serde::Deserializer<'de>>(d: D) -> Result<StatusPatch, D::Error> {
    Ok(Option::<StatusPatch>::deserialize(d)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "peers:list")]
    PeersQuery,
    #[serde(rename = "participants:list")]
    ParticipantsQuery,
    #[serde(rename = "user:status")]
    UserStatus {
        #[serde(default, deserialize_with = "null_as_empty")]
        status: StatusPatch,
    },
    #[serde(rename = "webrtc:offer")]
    Offer {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: SessionDescription,
    },
    #[serde(rename = "webrtc:answer")]
    Answer {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        sdp: SessionDescription,
    },
    #[serde(rename = "webrtc:ice")]
    Ice {
        to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        candidate: IceCandidate,
    },
    #[serde(rename = "leave:room")]
    LeaveRoom,
}

impl ClientMessage {
    /// Rewrites a directed message into what its target receives,
    /// tagged with the real sender. `None` for undirected messages.
    pub fn into_relayed(self, sender: &str) -> Option<(String, ServerEvent)> {
        let from = sender.to_string();
        match self {
            ClientMessage::Offer { to, sdp, .. } => Some((to, ServerEvent::Offer { from, sdp })),
            ClientMessage::Answer { to, sdp, .. } => Some((to, ServerEvent::Answer { from, sdp })),
            ClientMessage::Ice { to, candidate, .. } => Some((to, ServerEvent::Ice { from, candidate })),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_parse_from_browser_shapes() {
        let raw = json!({
            "event": "webrtc:ice",
            "data": {
                "to": "b",
                "from": "spoofed",
                "candidate": {
                    "candidate": "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host",
                    "sdpMid": "0",
                    "sdpMLineIndex": 0
                }
            }
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        let (to, ev) = msg.into_relayed("a").unwrap();
        assert_eq!(to, "b");
        match ev {
            ServerEvent::Ice { from, candidate } => {
                assert_eq!(from, "a");
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn query_frames_need_no_body() {
        let q: ClientMessage = serde_json::from_str(r#"{"event":"peers:list"}"#).unwrap();
        assert_eq!(q, ClientMessage::PeersQuery);
        let leave: ClientMessage = serde_json::from_str(r#"{"event":"leave:room"}"#).unwrap();
        assert_eq!(leave, ClientMessage::LeaveRoom);
    }

    #[test]
    fn offer_without_target_is_rejected() {
        let raw = r#"{"event":"webrtc:offer","data":{"sdp":{"type":"offer","sdp":"v=0"}}}"#;
        assert!(serde_json::from_str::<ClientMessage>(raw).is_err());
    }

    #[test]
    fn server_events_use_wire_names() {
        let full = serde_json::to_value(ServerEvent::RoomFull { limit: 10 }).unwrap();
        assert_eq!(full, json!({"event": "room:full", "data": {"limit": 10}}));

        let gone = serde_json::to_value(ServerEvent::PeerDisconnected("x".into())).unwrap();
        assert_eq!(gone, json!({"event": "peer:disconnected", "data": "x"}));

        let user = UserProfile::placeholder("7");
        let hello = serde_json::to_value(ServerEvent::Connected {
            ok: true,
            user,
            socket_id: "s1".into(),
        })
        .unwrap();
        assert_eq!(hello["data"]["socketId"], "s1");
        assert_eq!(hello["data"]["user"]["name"], "User 7");
    }

    #[test]
    fn status_patch_keeps_identity() {
        let mut user = UserProfile::placeholder("7");
        let patch = json!({"is_muted": true, "name": "mallory"});
        let dropped = user.merge_status(patch.as_object().unwrap());
        assert_eq!(dropped, vec!["name".to_string()]);
        assert_eq!(user.name, "User 7");
        assert_eq!(user.status.get("is_muted"), Some(&json!(true)));
    }

    #[test]
    fn status_patch_cannot_shadow_roster_keys() {
        let mut user = UserProfile::placeholder("7");
        let patch = json!({"socket_id": "evil", "is_online": false, "is_muted": true});
        let mut dropped = user.merge_status(patch.as_object().unwrap());
        dropped.sort();
        assert_eq!(dropped, vec!["is_online".to_string(), "socket_id".to_string()]);

        let roster = ServerEvent::participants(vec![Participant { user, socket_id: "b".into(), is_online: true }]);
        let wire = serde_json::to_string(&roster).unwrap();
        match serde_json::from_str::<ServerEvent>(&wire).unwrap() {
            ServerEvent::ParticipantsList { participants, .. } => {
                assert_eq!(participants[0].socket_id, "b");
                assert!(participants[0].is_online);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn directory_profile_loses_roster_keys() {
        let mut user: UserProfile =
            serde_json::from_value(json!({"id": 3, "name": "Cy", "socket_id": "x", "team": "blue"})).unwrap();
        user.strip_reserved();
        assert!(user.status.get("socket_id").is_none());
        assert_eq!(user.status.get("team"), Some(&json!("blue")));
    }

    #[test]
    fn null_or_missing_status_is_empty() {
        for raw in [r#"{"event":"user:status","data":{"status":null}}"#, r#"{"event":"user:status","data":{}}"#] {
            let msg: ClientMessage = serde_json::from_str(raw).unwrap();
            assert_eq!(msg, ClientMessage::UserStatus { status: StatusPatch::new() });
        }
    }
}
