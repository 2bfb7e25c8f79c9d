use axum::{Router, routing::get, response::Response,
           extract::{ws::{WebSocketUpgrade, WebSocket, Message}, Query, Extension}};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    directory::{self, Directory},
    error::{bad, AppResult},
    protocol::{ClientMessage, ServerEvent, UserProfile},
    state::{Registry, Rejected, Session},
    utils::jwt::{self, Secret},
};

const MAX_FRAME: usize = 64 * 1024;

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "roomId")]
    room:  Option<String>,
    token: Option<String>,
}

pub fn router() -> Router {
    Router::new().route("/signal", get(ws_handler))
}

/* ---------------- 握手：驗證 → 查目錄 → 升級 ---------------- */
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(q): Query<WsQuery>,
    Extension(secret): Extension<Secret>,
    Extension(rooms): Extension<Registry>,
    Extension(dir): Extension<Directory>,
) -> AppResult<Response> {
    let room = q.room
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| {
            info!("no room id provided, refusing");
            bad("missing roomId")
        })?;
    let uid = jwt::verify(q.token.as_deref(), secret.as_str()).map_err(|e| {
        info!(%room, error = %e, "credential rejected");
        e
    })?;
    let user = directory::resolve(dir.as_ref(), &uid, q.token.as_deref().unwrap_or_default()).await;

    Ok(ws
        .max_message_size(MAX_FRAME)
        .on_upgrade(move |s| user_ws(s, uid, user, room, rooms)))
}

/* ---------------- per session ---------------- */
async fn user_ws(sock: WebSocket, uid: String, user: UserProfile, room: String, rooms: Registry) {
    let id = nanoid::nanoid!();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (mut sink, mut stream) = sock.split();

    /* 寫出：channel → socket；所有 sender 消失就關線 */
    let writer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            let txt = match serde_json::to_string(&ev) {
                Ok(t) => t,
                Err(e) => { warn!(error = %e, "unserializable event"); continue; }
            };
            if sink.send(Message::Text(txt)).await.is_err() { break; }
        }
        sink.send(Message::Close(None)).await.ok();
    });

    /* 進房：admit 與初始名冊在同一把寫鎖內送出 */
    let session = Session { id: id.clone(), user_id: uid, room: room.clone(), user: user.clone(), tx: tx.clone() };
    {
        let mut reg = rooms.write().await;
        match reg.admit(session) {
            Ok(adm) => {
                tx.send(ServerEvent::Connected { ok: true, user, socket_id: id.clone() }).ok();
                tx.send(ServerEvent::participants(adm.participants)).ok();
                tx.send(ServerEvent::PeersList { peers: adm.peers }).ok();
            }
            Err(Rejected::Full { limit }) => {
                tx.send(ServerEvent::RoomFull { limit }).ok();
                drop(reg);
                drop(tx);
                writer.await.ok();
                return;
            }
        }
    }

    while let Some(Ok(msg)) = stream.next().await {
        let raw = match msg {
            Message::Text(t)  => t,
            Message::Close(_) => break,
            _                 => continue,
        };
        let cmd = match serde_json::from_str::<ClientMessage>(&raw) {
            Ok(c) => c,
            Err(e) => {
                warn!(session = %id, error = %e, "malformed frame rejected");
                tx.send(ServerEvent::Error { message: format!("malformed message: {e}") }).ok();
                continue;
            }
        };
        if !handle(&rooms, &id, cmd).await { break; }
    }

    /* 離房 */
    rooms.write().await.remove(&id);
    drop(tx);
    writer.await.ok();
    info!(session = %id, %room, "disconnected");
}

/// Returns `false` when the session asked to leave.
async fn handle(rooms: &Registry, id: &str, cmd: ClientMessage) -> bool {
    match cmd {
        ClientMessage::PeersQuery => {
            let reg = rooms.read().await;
            let peers = reg.peers(id);
            debug!(session = %id, ?peers, "peer list");
            reg.reply(id, ServerEvent::PeersList { peers });
        }
        ClientMessage::ParticipantsQuery => {
            let reg = rooms.read().await;
            if let Some(room) = reg.session(id).map(|s| s.room.clone()) {
                reg.reply(id, ServerEvent::participants(reg.participants(&room)));
            }
        }
        ClientMessage::UserStatus { status } => {
            rooms.write().await.update_status(id, status);
        }
        ClientMessage::LeaveRoom => {
            info!(session = %id, "leaving room");
            return false;
        }
        directed => {
            if let Some((to, ev)) = directed.into_relayed(id) {
                if rooms.read().await.relay(id, &to, ev) {
                    debug!(from = %id, %to, "relayed");
                } else {
                    debug!(from = %id, %to, "relay target gone, dropped");
                }
            }
        }
    }
    true
}
