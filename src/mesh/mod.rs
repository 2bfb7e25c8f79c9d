//! Client-side mesh: one task per room session owns every peer link, the
//! local audio pipeline and the relay connection.
pub mod audio;
#[cfg(feature = "device")]
pub mod device;
pub mod link;
pub mod presence;
pub mod sdp;
pub mod signal;
pub mod transport;


use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::{AbortHandle, JoinHandle},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::{
    config::ROOM_CAPACITY,
    protocol::{ClientMessage, IceCandidate, Participant, ServerEvent, SessionDescription, StatusPatch},
};
use audio::{AudioOutput, AudioPipeline, CaptureConstraints, FrameSink, GainStage, MediaDevices};
use link::{LinkState, PeerLink, Role};
use presence::PresenceView;
use sdp::OpusShape;
use signal::{SignalChannel, SignalConnector};
use transport::{LinkEvent, LinkEventKind, LinkEvents, PeerConnector, PeerTransport, TransportState, WebRtcConnector};

#[derive(thiserror::Error, Debug)]
pub enum MeshErr {
    #[error("media unavailable: {0}")]
    Media(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error(transparent)]
    Transport(#[from] webrtc::Error),
    #[error("signaling: {0}")]
    Signaling(String),
}

/* ------------ 設定 ------------ */
/// candidates kept per remote that has not offered yet
const EARLY_CANDIDATES: usize = 32;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// room size the mesh is built for; links are bounded by `mesh_cap - 1`
    pub mesh_cap:    usize,
    pub ice_servers: Vec<String>,
    pub start_muted: bool,
    pub shape_sdp:   bool,
    pub opus:        OpusShape,
    pub constraints: CaptureConstraints,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mesh_cap:    ROOM_CAPACITY,
            ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            start_muted: true,
            shape_sdp:   true,
            opus:        OpusShape::default(),
            constraints: CaptureConstraints::voice(),
        }
    }
}

/// What a UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshStatus {
    pub status:          String,
    pub muted:           bool,
    pub connected_peers: usize,
    pub participants:    Vec<Participant>,
    pub links:           BTreeMap<String, LinkState>,
    pub local_id:        Option<String>,
}

impl MeshStatus {
    fn initial(muted: bool) -> Self {
        Self {
            status: "connecting".into(),
            muted,
            connected_peers: 0,
            participants: Vec::new(),
            links: BTreeMap::new(),
            local_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleMute,
    RefreshParticipants,
    Leave,
}

/// The collaborators a session is built from.
pub struct MeshParts {
    pub devices:   Arc<dyn MediaDevices>,
    pub signaling: Arc<dyn SignalConnector>,
    pub connector: Arc<dyn PeerConnector>,
    pub sink:      Arc<dyn FrameSink>,
    pub output:    Arc<dyn AudioOutput>,
}

impl MeshParts {
    /// webrtc-rs links sharing one published PCMU track.
    pub fn webrtc(
        cfg: &MeshConfig,
        devices: Arc<dyn MediaDevices>,
        signaling: Arc<dyn SignalConnector>,
        output: Arc<dyn AudioOutput>,
    ) -> Result<Self, MeshErr> {
        let track = audio::published_track();
        let connector = WebRtcConnector::new(cfg.ice_servers.clone(), track.clone(), output.clone())?;
        Ok(Self { devices, signaling, connector: Arc::new(connector), sink: track, output })
    }
}

/* ------------ handle ------------ */
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<Command>,
    disposed: CancellationToken,
    status:   watch::Receiver<MeshStatus>,
    task:     JoinHandle<()>,
    _guard:   DropGuard,
}

impl MeshHandle {
    pub fn toggle_mute(&self) { self.commands.send(Command::ToggleMute).ok(); }
    pub fn refresh_participants(&self) { self.commands.send(Command::RefreshParticipants).ok(); }
    pub fn leave(&self) { self.commands.send(Command::Leave).ok(); }

    pub fn status(&self) -> MeshStatus { self.status.borrow().clone() }
    pub fn watch(&self) -> watch::Receiver<MeshStatus> { self.status.clone() }
    pub fn is_disposed(&self) -> bool { self.disposed.is_cancelled() }

    /// Sets the disposed flag and waits for teardown to finish.
    pub async fn dispose(self) {
        self.disposed.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "mesh task ended abnormally");
        }
    }

    /// Resolves once the session has torn down, for whatever reason.
    pub async fn finished(&self) {
        self.disposed.cancelled().await;
    }
}

/// Starts a session in `room`. Media is acquired first; the relay is only
/// contacted once the microphone is live.
pub fn spawn(cfg: MeshConfig, room: impl Into<String>, credential: impl Into<String>, parts: MeshParts) -> MeshHandle {
    let disposed = CancellationToken::new();
    let (commands, cmd_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(MeshStatus::initial(cfg.start_muted));

    let mesh = Mesh {
        gain: GainStage::new(cfg.start_muted),
        cfg,
        parts,
        disposed: disposed.clone(),
        status: status_tx,
        status_text: "connecting".into(),
        local_id: None,
        out: None,
        pipeline: None,
        links: HashMap::new(),
        sinks: HashMap::new(),
        early: HashMap::new(),
        presence: PresenceView::new(),
        serial: 0,
        link_tx,
    };
    let task = tokio::spawn(mesh.run(room.into(), credential.into(), cmd_rx, link_rx));
    MeshHandle { commands, _guard: disposed.clone().drop_guard(), disposed, status, task }
}

/* ------------ orchestrator ------------ */
struct Mesh {
    cfg:         MeshConfig,
    parts:       MeshParts,
    gain:        GainStage,
    disposed:    CancellationToken,
    status:      watch::Sender<MeshStatus>,
    status_text: String,
    local_id:    Option<String>,
    out:         Option<mpsc::UnboundedSender<ClientMessage>>,
    pipeline:    Option<AudioPipeline>,
    links:       HashMap<String, PeerLink>,
    sinks:       HashMap<String, AbortHandle>, // remote -> 播放中的音軌
    early:       HashMap<String, Vec<IceCandidate>>, // 尚無連線的對端先送來的 candidate
    presence:    PresenceView,
    serial:      u64,
    link_tx:     mpsc::UnboundedSender<LinkEvent>,
}

impl Mesh {
    async fn run(
        mut self,
        room: String,
        credential: String,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        self.publish();
        let mut relay = match self.boot(&room, &credential).await {
            Ok(Some(rx)) => rx,
            Ok(None) => {
                debug!("disposed during startup");
                return self.teardown().await;
            }
            Err(e) => {
                warn!(%room, error = %e, "mesh startup failed");
                self.status_text = format!("error: {e}");
                return self.teardown().await;
            }
        };

        let disposed = self.disposed.clone();
        loop {
            tokio::select! {
                biased;
                _ = disposed.cancelled() => break,
                ev = relay.recv() => match ev {
                    Some(ev) => { if !self.on_server(ev).await { break } }
                    None => { info!(%room, "relay connection closed"); break }
                },
                Some(ev) = link_events.recv() => self.on_link_event(ev).await,
                cmd = commands.recv() => match cmd {
                    Some(Command::Leave) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
            }
            self.publish();
        }
        self.teardown().await;
    }

    /// Microphone, pipeline, then relay. `None` when disposed part way.
    async fn boot(
        &mut self,
        room: &str,
        credential: &str,
    ) -> Result<Option<mpsc::UnboundedReceiver<ServerEvent>>, MeshErr> {
        let constraints = self.cfg.constraints;
        let stream = tokio::select! {
            _ = self.disposed.cancelled() => return Ok(None),
            r = self.parts.devices.acquire(&constraints) => r?,
        };
        if self.disposed.is_cancelled() {
            // 取得麥克風時已被釋放
            drop(stream);
            return Ok(None);
        }
        self.pipeline = Some(AudioPipeline::start(stream, &constraints, self.gain.clone(), self.parts.sink.clone()));

        let SignalChannel { tx, rx } = tokio::select! {
            _ = self.disposed.cancelled() => return Ok(None),
            r = self.parts.signaling.connect(room, credential) => r?,
        };
        self.out = Some(tx);
        info!(%room, "relay connected");
        Ok(Some(rx))
    }

    /* ---- relay events ---- */
    /// `false` ends the session.
    async fn on_server(&mut self, ev: ServerEvent) -> bool {
        match ev {
            ServerEvent::Connected { user, socket_id, .. } => {
                info!(session = %socket_id, user = %user.id, "joined room");
                self.local_id = Some(socket_id);
                self.status_text = "connected".into();
            }
            ServerEvent::RoomFull { limit } => {
                warn!(limit, "room is full");
                self.status_text = format!("room full ({limit})");
                return false;
            }
            ServerEvent::ParticipantsList { participants, .. } => self.presence.replace(participants),
            ServerEvent::PresenceJoin(p) => self.presence.join(p),
            ServerEvent::PresenceLeave(p) => {
                self.presence.leave(&p.socket_id);
                self.drop_link(&p.socket_id, LinkState::RemoteDisconnected).await;
            }
            ServerEvent::StatusChange { socket_id, status, timestamp, .. } => {
                self.presence.update(&socket_id, &status, &timestamp);
            }
            ServerEvent::PeersList { peers } => self.form_mesh(peers).await,
            ServerEvent::Offer { from, sdp } => self.on_offer(from, sdp).await,
            ServerEvent::Answer { from, sdp } => self.on_answer(from, sdp).await,
            ServerEvent::Ice { from, candidate } => self.on_remote_candidate(from, candidate).await,
            ServerEvent::PeerDisconnected(id) => self.drop_link(&id, LinkState::RemoteDisconnected).await,
            ServerEvent::Error { message } => warn!(%message, "relay rejected a message"),
        }
        true
    }

    async fn form_mesh(&mut self, peers: Vec<String>) {
        let targets = link::select_targets(
            self.local_id.as_deref(),
            self.cfg.mesh_cap,
            self.links.len(),
            &peers,
            |id| self.links.contains_key(id),
        );
        debug!(offered = peers.len(), ?targets, "forming mesh");
        for remote in targets {
            self.initiate(remote).await;
        }
    }

    async fn initiate(&mut self, remote: String) {
        let Some(t) = self.open_link(&remote, Role::Initiator).await else { return };
        match self.local_offer(t.as_ref()).await {
            Ok(sdp) => {
                self.send(ClientMessage::Offer { to: remote.clone(), from: self.local_id.clone(), sdp });
                if let Some(l) = self.links.get_mut(&remote) {
                    l.advance(LinkState::OfferSent);
                }
                debug!(%remote, "offer sent");
            }
            Err(e) => warn!(%remote, error = %e, "offer failed, link left to its transport"),
        }
    }

    async fn on_offer(&mut self, from: String, offer: SessionDescription) {
        if let Some(link) = self.links.get_mut(&from) {
            if link.role == Role::Initiator && link.state == LinkState::OfferSent {
                let local = self.local_id.as_deref().unwrap_or_default();
                if link::keeps_offer(local, &from) {
                    // 對方那條連線會被關掉，它的 candidate 不能留
                    let stale = link.discard_pending();
                    debug!(remote = %from, stale, "glare, keeping our offer");
                    return;
                }
                debug!(remote = %from, "glare, yielding to remote offer");
                self.drop_link(&from, LinkState::Closed).await;
            }
        }

        if !self.links.contains_key(&from) {
            if self.links.len() >= self.cfg.mesh_cap.saturating_sub(1) {
                info!(remote = %from, links = self.links.len(), "mesh is full, offer ignored");
                self.early.remove(&from);
                return;
            }
            if self.open_link(&from, Role::Responder).await.is_none() {
                return;
            }
        }

        let Some(link) = self.links.get_mut(&from) else { return };
        if !link.advance(LinkState::AwaitingAnswer) {
            return;
        }
        let t = link.transport.clone();
        if let Err(e) = self.answer(&from, t.as_ref(), offer).await {
            warn!(remote = %from, error = %e, "answer failed, link left to its transport");
        }
    }

    async fn answer(&mut self, remote: &str, t: &dyn PeerTransport, offer: SessionDescription) -> Result<(), MeshErr> {
        let ufrag = sdp::ice_ufrag(&offer.sdp).map(str::to_string);
        t.set_remote_description(offer).await?;
        self.flush_candidates(remote, t, ufrag.as_deref()).await;
        let answer = self.shaped(t.create_answer().await?);
        t.set_local_description(answer.clone()).await?;
        self.send(ClientMessage::Answer { to: remote.to_string(), from: self.local_id.clone(), sdp: answer });
        if let Some(l) = self.links.get_mut(remote) {
            l.settle();
        }
        Ok(())
    }

    async fn on_answer(&mut self, from: String, answer: SessionDescription) {
        let Some(link) = self.links.get(&from) else {
            debug!(remote = %from, "answer for unknown link dropped");
            return;
        };
        if link.state != LinkState::OfferSent {
            debug!(remote = %from, state = ?link.state, "unexpected answer ignored");
            return;
        }
        let t = link.transport.clone();
        let ufrag = sdp::ice_ufrag(&answer.sdp).map(str::to_string);
        if let Err(e) = t.set_remote_description(answer).await {
            warn!(remote = %from, error = %e, "remote answer rejected");
            return;
        }
        self.flush_candidates(&from, t.as_ref(), ufrag.as_deref()).await;
        if let Some(l) = self.links.get_mut(&from) {
            l.settle();
        }
    }

    async fn on_remote_candidate(&mut self, from: String, candidate: IceCandidate) {
        let Some(link) = self.links.get_mut(&from) else {
            self.hold_early(from, candidate);
            return;
        };
        let Some(c) = link.accept_candidate(candidate) else {
            debug!(remote = %from, pending = link.pending_candidates(), "candidate buffered");
            return;
        };
        let t = link.transport.clone();
        if let Err(e) = t.add_ice_candidate(c).await {
            debug!(remote = %from, error = %e, "candidate rejected");
        }
    }

    /// Candidates racing ahead of their offer. Bounded per remote and by the
    /// mesh size.
    fn hold_early(&mut self, from: String, candidate: IceCandidate) {
        if !self.early.contains_key(&from) && self.early.len() >= self.cfg.mesh_cap {
            debug!(remote = %from, "too many unknown remotes, candidate dropped");
            return;
        }
        let held = self.early.entry(from.clone()).or_default();
        if held.len() >= EARLY_CANDIDATES {
            debug!(remote = %from, "early candidate queue full, dropped");
            return;
        }
        held.push(candidate);
        debug!(remote = %from, held = held.len(), "candidate held until the offer arrives");
    }

    async fn flush_candidates(&mut self, remote: &str, t: &dyn PeerTransport, ufrag: Option<&str>) {
        let pending = match self.links.get_mut(remote) {
            Some(l) => l.remote_described(ufrag),
            None => return,
        };
        for c in pending {
            if let Err(e) = t.add_ice_candidate(c).await {
                debug!(%remote, error = %e, "buffered candidate rejected");
            }
        }
    }

    /* ---- transport events ---- */
    async fn on_link_event(&mut self, ev: LinkEvent) {
        if self.links.get(&ev.remote).map(|l| l.serial) != Some(ev.serial) {
            // 已被取代或拆掉的連線
            if let LinkEventKind::RemoteTrack(h) = ev.kind {
                h.abort();
            }
            return;
        }
        match ev.kind {
            LinkEventKind::LocalCandidate(candidate) => {
                self.send(ClientMessage::Ice { to: ev.remote, from: self.local_id.clone(), candidate });
            }
            LinkEventKind::State(TransportState::Connected) => {
                if let Some(l) = self.links.get_mut(&ev.remote) {
                    l.transport_connected();
                    info!(remote = %ev.remote, "peer connected");
                }
            }
            LinkEventKind::State(TransportState::Failed | TransportState::Disconnected) => {
                self.drop_link(&ev.remote, LinkState::Failed).await;
            }
            LinkEventKind::State(TransportState::Closed) => {
                self.drop_link(&ev.remote, LinkState::Closed).await;
            }
            LinkEventKind::State(_) => {}
            LinkEventKind::RemoteTrack(h) => {
                if let Some(old) = self.sinks.insert(ev.remote.clone(), h) {
                    old.abort();
                }
                info!(remote = %ev.remote, connected_peers = self.sinks.len(), "receiving audio");
            }
        }
    }

    async fn drop_link(&mut self, remote: &str, reason: LinkState) {
        self.early.remove(remote);
        if let Some(h) = self.sinks.remove(remote) {
            h.abort();
            self.parts.output.release(remote);
        }
        let Some(mut link) = self.links.remove(remote) else { return };
        link.advance(reason);
        info!(%remote, state = ?link.state, role = ?link.role, "peer link torn down");
        link.transport.close().await;
    }

    /* ---- commands ---- */
    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::ToggleMute => {
                let muted = !self.gain.is_muted();
                self.gain.set_muted(muted);
                let mut status = StatusPatch::new();
                status.insert("is_muted".into(), Value::Bool(muted));
                self.send(ClientMessage::UserStatus { status });
                info!(muted, "mute toggled");
            }
            Command::RefreshParticipants => self.send(ClientMessage::ParticipantsQuery),
            Command::Leave => {}
        }
    }

    /* ---- helpers ---- */
    async fn open_link(&mut self, remote: &str, role: Role) -> Option<Arc<dyn PeerTransport>> {
        if self.disposed.is_cancelled() {
            return None;
        }
        self.serial += 1;
        let events = LinkEvents::new(remote, self.serial, self.link_tx.clone());
        match self.parts.connector.open(events).await {
            Ok(t) => {
                let mut link = PeerLink::new(remote.to_string(), role, self.serial, t.clone());
                if let Some(early) = self.early.remove(remote) {
                    if role == Role::Responder {
                        link.adopt(early);
                    }
                }
                self.links.insert(remote.to_string(), link);
                debug!(%remote, ?role, links = self.links.len(), "peer link opened");
                Some(t)
            }
            Err(e) => {
                warn!(%remote, error = %e, "could not open peer transport");
                None
            }
        }
    }

    async fn local_offer(&self, t: &dyn PeerTransport) -> Result<SessionDescription, MeshErr> {
        let offer = self.shaped(t.create_offer().await?);
        t.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    fn shaped(&self, mut desc: SessionDescription) -> SessionDescription {
        if self.cfg.shape_sdp {
            desc.sdp = sdp::shape(&desc.sdp, &self.cfg.opus);
        }
        desc
    }

    fn send(&self, msg: ClientMessage) {
        if let Some(out) = &self.out {
            if out.send(msg).is_err() {
                debug!("relay channel closed, message dropped");
            }
        }
    }

    fn publish(&self) {
        self.status.send_replace(MeshStatus {
            status:          self.status_text.clone(),
            muted:           self.gain.is_muted(),
            connected_peers: self.sinks.len(),
            participants:    self.presence.list().to_vec(),
            links:           self.links.iter().map(|(id, l)| (id.clone(), l.state)).collect(),
            local_id:        self.local_id.clone(),
        });
    }

    async fn teardown(&mut self) {
        let remotes: Vec<String> = self.links.keys().cloned().collect();
        for remote in remotes {
            self.drop_link(&remote, LinkState::Closed).await;
        }
        for (remote, h) in self.sinks.drain() {
            h.abort();
            self.parts.output.release(&remote);
        }
        if let Some(p) = self.pipeline.take() {
            p.stop();
        }
        if let Some(out) = self.out.take() {
            out.send(ClientMessage::LeaveRoom).ok();
        }
        self.early.clear();
        self.presence.clear();
        if !(self.status_text.starts_with("room full") || self.status_text.starts_with("error")) {
            self.status_text = "disconnected".into();
        }
        self.publish();
        info!(status = %self.status_text, "mesh session closed");
        self.disposed.cancel();
    }
}
