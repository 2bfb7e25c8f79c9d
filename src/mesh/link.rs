use std::{collections::HashSet, sync::Arc};
use serde::Serialize;
use tracing::debug;

use super::transport::PeerTransport;
use crate::protocol::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// found through a `peers:list`
    Initiator,
    /// found through an inbound offer
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    New,
    OfferSent,
    AwaitingAnswer,
    Negotiating,
    Connected,
    Failed,
    Closed,
    RemoteDisconnected,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed | LinkState::RemoteDisconnected)
    }

    fn can_become(self, next: LinkState) -> bool {
        use LinkState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            New            => false,
            OfferSent      => self == New,
            AwaitingAnswer => matches!(self, New | Negotiating | Connected),
            Negotiating    => matches!(self, OfferSent | AwaitingAnswer | Connected),
            Connected      => matches!(self, Negotiating | Connected | AwaitingAnswer),
            Failed | Closed | RemoteDisconnected => true,
        }
    }
}

/* ------------ 一條對端連線 ------------ */
pub struct PeerLink {
    pub remote:    String,
    pub role:      Role,
    pub state:     LinkState,
    pub serial:    u64,
    pub transport: Arc<dyn PeerTransport>,
    transport_up:  bool,
    described:     bool,
    remote_ufrag:  Option<String>,
    pending:       Vec<IceCandidate>,
}

impl PeerLink {
    pub fn new(remote: String, role: Role, serial: u64, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            remote,
            role,
            state: LinkState::New,
            serial,
            transport,
            transport_up: false,
            described: false,
            remote_ufrag: None,
            pending: Vec::new(),
        }
    }

    /// Applies a transition; illegal ones are ignored and reported as `false`.
    pub fn advance(&mut self, next: LinkState) -> bool {
        if !self.state.can_become(next) {
            debug!(remote = %self.remote, from = ?self.state, to = ?next, "ignored link transition");
            return false;
        }
        self.state = next;
        true
    }

    /// Description exchange finished. A transport that is already up goes
    /// straight back to connected.
    pub fn settle(&mut self) {
        if self.advance(LinkState::Negotiating) && self.transport_up {
            self.advance(LinkState::Connected);
        }
    }

    pub fn transport_connected(&mut self) -> bool {
        self.transport_up = true;
        self.advance(LinkState::Connected)
    }

    /// Hands the candidate back if it can be applied now, otherwise queues it
    /// until the remote description lands. Candidates from a different ICE
    /// session than the applied description are dropped.
    pub fn accept_candidate(&mut self, c: IceCandidate) -> Option<IceCandidate> {
        if !self.described {
            self.pending.push(c);
            return None;
        }
        if !self.same_session(&c) {
            debug!(remote = %self.remote, ufrag = ?c.username_fragment, "candidate from a stale ICE session");
            return None;
        }
        Some(c)
    }

    /// Queues candidates that arrived before this link existed.
    pub fn adopt(&mut self, early: Vec<IceCandidate>) {
        self.pending.extend(early);
    }

    /// Forgets queued candidates; they belong to a remote session we refused.
    pub fn discard_pending(&mut self) -> usize {
        std::mem::take(&mut self.pending).len()
    }

    /// Marks the remote description as applied and drains the queued
    /// candidates that belong to it.
    pub fn remote_described(&mut self, ufrag: Option<&str>) -> Vec<IceCandidate> {
        self.described = true;
        self.remote_ufrag = ufrag.map(str::to_string);
        let pending = std::mem::take(&mut self.pending);
        let (keep, stale): (Vec<_>, Vec<_>) = pending.into_iter().partition(|c| self.same_session(c));
        if !stale.is_empty() {
            debug!(remote = %self.remote, dropped = stale.len(), "queued candidates from a stale ICE session");
        }
        keep
    }

    fn same_session(&self, c: &IceCandidate) -> bool {
        match (&self.remote_ufrag, &c.username_fragment) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    pub fn pending_candidates(&self) -> usize { self.pending.len() }
}

/// Mesh formation: the first `meshCap - 1 - current` candidates that are
/// neither us nor already linked.
pub fn select_targets<'a>(
    local:     Option<&str>,
    mesh_cap:  usize,
    current:   usize,
    candidates: &'a [String],
    linked:    impl Fn(&str) -> bool,
) -> Vec<String> {
    let free = mesh_cap.saturating_sub(1).saturating_sub(current);
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter(|c| Some(c.as_str()) != local && !linked(c.as_str()) && seen.insert(c.as_str()))
        .take(free)
        .cloned()
        .collect()
}

/// Glare tie-break: the lower session id keeps its offer.
pub fn keeps_offer(local: &str, remote: &str) -> bool {
    local < remote
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mesh::MeshErr, protocol::SessionDescription};

    fn ids(v: &[&str]) -> Vec<String> { v.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn free_slots_bound_fan_out() {
        let cands: Vec<String> = (0..15).map(|i| format!("p{i:02}")).collect();
        let picked = select_targets(Some("me"), 10, 0, &cands, |_| false);
        assert_eq!(picked.len(), 9);
        assert_eq!(picked[0], "p00");

        let picked = select_targets(Some("me"), 10, 7, &cands, |_| false);
        assert_eq!(picked, ids(&["p00", "p01"]));

        assert!(select_targets(Some("me"), 10, 9, &cands, |_| false).is_empty());
        assert!(select_targets(Some("me"), 10, 12, &cands, |_| false).is_empty());
    }

    #[test]
    fn linked_self_and_duplicates_are_skipped() {
        let cands = ids(&["me", "a", "b", "a", "c"]);
        let picked = select_targets(Some("me"), 10, 0, &cands, |id| id == "b");
        assert_eq!(picked, ids(&["a", "c"]));
    }

    #[test]
    fn lower_id_wins_glare() {
        assert!(keeps_offer("a", "b"));
        assert!(!keeps_offer("b", "a"));
    }

    #[test]
    fn transitions_follow_the_negotiation_order() {
        use LinkState::*;
        assert!(New.can_become(OfferSent));
        assert!(New.can_become(AwaitingAnswer));
        assert!(!New.can_become(Connected));
        assert!(OfferSent.can_become(Negotiating));
        assert!(!OfferSent.can_become(AwaitingAnswer));
        assert!(Negotiating.can_become(Connected));
        assert!(Connected.can_become(RemoteDisconnected));
        assert!(!Closed.can_become(Connected));
        assert!(!Failed.can_become(Closed));
    }

    struct Inert;

    #[async_trait::async_trait]
    impl PeerTransport for Inert {
        async fn create_offer(&self) -> Result<SessionDescription, MeshErr> {
            unreachable!()
        }
        async fn create_answer(&self) -> Result<SessionDescription, MeshErr> {
            unreachable!()
        }
        async fn set_local_description(&self, _: SessionDescription) -> Result<(), MeshErr> { Ok(()) }
        async fn set_remote_description(&self, _: SessionDescription) -> Result<(), MeshErr> { Ok(()) }
        async fn add_ice_candidate(&self, _: IceCandidate) -> Result<(), MeshErr> { Ok(()) }
        async fn close(&self) {}
    }

    fn cand(n: u16) -> IceCandidate {
        IceCandidate { candidate: format!("c{n}"), sdp_mid: None, sdp_mline_index: Some(n), username_fragment: None }
    }

    #[test]
    fn candidates_wait_for_the_remote_description() {
        let mut l = PeerLink::new("b".into(), Role::Responder, 1, Arc::new(Inert));
        assert!(l.accept_candidate(cand(0)).is_none());
        assert!(l.accept_candidate(cand(1)).is_none());
        assert_eq!(l.pending_candidates(), 2);

        let flushed = l.remote_described(None);
        assert_eq!(flushed.iter().map(|c| c.sdp_mline_index).collect::<Vec<_>>(), vec![Some(0), Some(1)]);
        assert_eq!(l.accept_candidate(cand(2)).map(|c| c.candidate), Some("c2".to_string()));
        assert_eq!(l.pending_candidates(), 0);
    }

    fn frag(n: u16, ufrag: &str) -> IceCandidate {
        IceCandidate { username_fragment: Some(ufrag.into()), ..cand(n) }
    }

    #[test]
    fn candidates_from_another_ice_session_are_dropped() {
        let mut l = PeerLink::new("b".into(), Role::Initiator, 1, Arc::new(Inert));
        l.accept_candidate(frag(0, "old"));
        l.accept_candidate(frag(1, "new"));
        l.accept_candidate(cand(2));

        let flushed = l.remote_described(Some("new"));
        assert_eq!(flushed.iter().map(|c| c.sdp_mline_index).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
        assert!(l.accept_candidate(frag(3, "old")).is_none());
        assert!(l.accept_candidate(frag(4, "new")).is_some());
    }

    #[test]
    fn discarded_and_adopted_candidates() {
        let mut l = PeerLink::new("b".into(), Role::Responder, 1, Arc::new(Inert));
        l.adopt(vec![cand(0), cand(1)]);
        assert_eq!(l.pending_candidates(), 2);
        assert_eq!(l.discard_pending(), 2);
        assert!(l.remote_described(None).is_empty());
    }

    #[test]
    fn early_transport_connect_lands_after_settle() {
        let mut l = PeerLink::new("b".into(), Role::Initiator, 1, Arc::new(Inert));
        assert!(l.advance(LinkState::OfferSent));
        assert!(!l.transport_connected());
        assert_eq!(l.state, LinkState::OfferSent);
        l.settle();
        assert_eq!(l.state, LinkState::Connected);
    }
}
