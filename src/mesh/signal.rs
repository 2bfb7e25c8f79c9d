//! Client side of the relay connection.
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::MeshErr;
use crate::protocol::{ClientMessage, ServerEvent};

/// One live relay session. Dropping `tx` closes the socket.
pub struct SignalChannel {
    pub tx: mpsc::UnboundedSender<ClientMessage>,
    pub rx: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
pub trait SignalConnector: Send + Sync {
    async fn connect(&self, room: &str, credential: &str) -> Result<SignalChannel, MeshErr>;
}

/// WebSocket connector for `GET {base}/ws/signal?roomId=..&token=..`.
pub struct WsConnector {
    base: String,
}

impl WsConnector {
    pub fn new(base: impl Into<String>) -> Self { Self { base: base.into() } }

    pub fn url(&self, room: &str, credential: &str) -> Result<Url, MeshErr> {
        let mut url = Url::parse_with_params(
            &format!("{}/ws/signal", self.base.trim_end_matches('/')),
            [("roomId", room), ("token", credential)],
        )
        .map_err(|e| MeshErr::Signaling(format!("bad relay url: {e}")))?;
        let scheme = match url.scheme() {
            "http"  => Some("ws"),
            "https" => Some("wss"),
            _       => None,
        };
        if let Some(s) = scheme {
            url.set_scheme(s).map_err(|_| MeshErr::Signaling("bad relay scheme".into()))?;
        }
        Ok(url)
    }
}

#[async_trait]
impl SignalConnector for WsConnector {
    async fn connect(&self, room: &str, credential: &str) -> Result<SignalChannel, MeshErr> {
        let url = self.url(room, credential)?;
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| MeshErr::Signaling(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let txt = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => { warn!(error = %e, "unserializable message"); continue; }
                };
                if sink.send(Message::Text(txt)).await.is_err() { break; }
            }
            sink.send(Message::Close(None)).await.ok();
        });

        tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                let raw = match msg {
                    Message::Text(t)  => t,
                    Message::Close(_) => break,
                    _                 => continue,
                };
                match serde_json::from_str::<ServerEvent>(&raw) {
                    Ok(ev) => { if in_tx.send(ev).is_err() { break; } }
                    Err(e) => debug!(error = %e, "unknown relay frame skipped"),
                }
            }
        });

        Ok(SignalChannel { tx: out_tx, rx: in_rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_url_carries_handshake() {
        let url = WsConnector::new("http://localhost:5000/").url("room 1", "a.b.c").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/ws/signal");
        let q: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(q, vec![("roomId".into(), "room 1".into()), ("token".into(), "a.b.c".into())]);

        let tls = WsConnector::new("https://relay.example").url("r", "t").unwrap();
        assert_eq!(tls.scheme(), "wss");
    }
}
