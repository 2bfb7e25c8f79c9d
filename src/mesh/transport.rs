//! Peer transport seam. The orchestrator only sees [`PeerTransport`]; the
//! webrtc-rs implementation lives here too.
use std::sync::Arc;
use async_trait::async_trait;
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder, API,
    },
    ice_transport::{ice_candidate::{RTCIceCandidate, RTCIceCandidateInit}, ice_server::RTCIceServer},
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{rtp_codec::RTPCodecType, rtp_receiver::RTCRtpReceiver, RTCRtpTransceiver},
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use super::{audio::{self, AudioOutput}, MeshErr};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug)]
pub enum LinkEventKind {
    LocalCandidate(IceCandidate),
    State(TransportState),
    /// a remote audio track is being drained into the output
    RemoteTrack(AbortHandle),
}

#[derive(Debug)]
pub struct LinkEvent {
    pub remote: String,
    pub serial: u64,
    pub kind:   LinkEventKind,
}

/// Where a transport reports back to the orchestrator. Events carry the
/// link serial so a replaced link's stragglers can be told apart.
#[derive(Clone)]
pub struct LinkEvents {
    remote: String,
    serial: u64,
    tx:     mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEvents {
    pub fn new(remote: &str, serial: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { remote: remote.to_string(), serial, tx }
    }

    pub fn remote(&self) -> &str { &self.remote }

    pub fn emit(&self, kind: LinkEventKind) {
        self.tx.send(LinkEvent { remote: self.remote.clone(), serial: self.serial, kind }).ok();
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MeshErr>;
    async fn create_answer(&self) -> Result<SessionDescription, MeshErr>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MeshErr>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MeshErr>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MeshErr>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Opens a transport to `events.remote()` already carrying the published track.
    async fn open(&self, events: LinkEvents) -> Result<Arc<dyn PeerTransport>, MeshErr>;
}

/* ------------ webrtc-rs ------------ */
pub struct WebRtcConnector {
    api:         API,
    ice_servers: Vec<String>,
    track:       Arc<TrackLocalStaticSample>,
    output:      Arc<dyn AudioOutput>,
}

impl WebRtcConnector {
    pub fn new(
        ice_servers: Vec<String>,
        track: Arc<TrackLocalStaticSample>,
        output: Arc<dyn AudioOutput>,
    ) -> Result<Self, MeshErr> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers, track, output })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn open(&self, events: LinkEvents) -> Result<Arc<dyn PeerTransport>, MeshErr> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer { urls: self.ice_servers.clone(), ..Default::default() }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        // 每條連線共用同一條已發佈的音軌
        let sender = pc
            .add_track(Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        tokio::spawn(async move {
            let mut rtcp = vec![0u8; 1500];
            while sender.read(&mut rtcp).await.is_ok() {}
        });

        let ev = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let ev = ev.clone();
            Box::pin(async move {
                let Some(c) = c else { return };
                match c.to_json() {
                    Ok(init) => ev.emit(LinkEventKind::LocalCandidate(IceCandidate {
                        candidate:         init.candidate,
                        sdp_mid:           init.sdp_mid,
                        sdp_mline_index:   init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!(remote = %ev.remote(), error = %e, "unserializable local candidate"),
                }
            })
        }));

        let ev = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let ev = ev.clone();
            Box::pin(async move {
                debug!(remote = %ev.remote(), state = %s, "peer connection state");
                let state = match s {
                    RTCPeerConnectionState::Connecting   => TransportState::Connecting,
                    RTCPeerConnectionState::Connected    => TransportState::Connected,
                    RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                    RTCPeerConnectionState::Failed       => TransportState::Failed,
                    RTCPeerConnectionState::Closed       => TransportState::Closed,
                    _                                    => TransportState::New,
                };
                ev.emit(LinkEventKind::State(state));
            })
        }));

        let (ev, output) = (events.clone(), self.output.clone());
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let (ev, output) = (ev.clone(), output.clone());
                Box::pin(async move {
                    if track.kind() != RTPCodecType::Audio {
                        return;
                    }
                    info!(remote = %ev.remote(), "remote audio track");
                    let task = tokio::spawn(play_remote(track, ev.remote().to_string(), output));
                    ev.emit(LinkEventKind::RemoteTrack(task.abort_handle()));
                })
            },
        ));

        Ok(Arc::new(WebRtcTransport { pc }))
    }
}

/// Drains a remote track into the output until the track ends or the task is aborted.
async fn play_remote(track: Arc<TrackRemote>, remote: String, output: Arc<dyn AudioOutput>) {
    let mut warned = false;
    while let Ok((pkt, _)) = track.read_rtp().await {
        if pkt.header.payload_type != audio::PCMU_PAYLOAD_TYPE {
            if !warned {
                debug!(%remote, pt = pkt.header.payload_type, "skipping non-PCMU payload");
                warned = true;
            }
            continue;
        }
        output.play(&remote, &audio::decode_pcmu(&pkt.payload));
    }
    debug!(%remote, "remote track ended");
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, MeshErr> {
    Ok(match desc.kind {
        SdpKind::Offer    => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer   => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => return Err(MeshErr::Negotiation("rollback is not supported".into())),
    })
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, MeshErr> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MeshErr> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), MeshErr> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), MeshErr> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, c: IceCandidate) -> Result<(), MeshErr> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate:         c.candidate,
                sdp_mid:           c.sdp_mid,
                sdp_mline_index:   c.sdp_mline_index,
                username_fragment: c.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "closing peer connection");
        }
    }
}
