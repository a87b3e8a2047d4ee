use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::Role;
use crate::driver::ConnectionDriver;
use crate::error::PeerError;
use crate::signaling::{Candidate, DescriptionKind, SessionDescription, SignalingChannel};

/// Negotiation progress of one peer link. Transitions move forward only,
/// except that close is reachable from every state and failures land in
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AwaitingLocalDescription,
    AwaitingRemoteDescription,
    NegotiatingCandidates,
    Open,
    Failed,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Observed network path of one end of the link, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointInfo {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub protocol: Option<String>,
    pub family: Option<IpFamily>,
}

impl EndpointInfo {
    fn from_candidate(candidate: &Candidate) -> Self {
        let family = candidate.address.as_deref().map(|address| {
            if address.contains(':') {
                IpFamily::V6
            } else {
                IpFamily::V4
            }
        });
        Self {
            address: candidate.address.clone(),
            port: candidate.port,
            protocol: candidate.protocol.clone(),
            family,
        }
    }
}

struct NegotiationInner {
    state: NegotiationState,
    remote_description: Option<DescriptionKind>,
    pending_candidates: Vec<Candidate>,
    seen_candidates: HashSet<String>,
    local_endpoint: Option<EndpointInfo>,
    remote_endpoint: Option<EndpointInfo>,
    failure: Option<String>,
}

/// Produces and consumes session descriptions and candidates, and drives
/// the connection driver to an open channel.
pub(crate) struct Negotiator {
    role: Role,
    driver: Arc<dyn ConnectionDriver>,
    signaling: SignalingChannel,
    state_changed: Arc<Notify>,
    inner: Mutex<NegotiationInner>,
}

impl Negotiator {
    pub fn new(
        role: Role,
        driver: Arc<dyn ConnectionDriver>,
        signaling: SignalingChannel,
        state_changed: Arc<Notify>,
    ) -> Self {
        // A responder must be ready for an offer the moment it exists; its
        // signaling subscription is live before start() is called.
        let state = match role {
            Role::Initiator => NegotiationState::Idle,
            Role::Responder => NegotiationState::AwaitingRemoteDescription,
        };
        Self {
            role,
            driver,
            signaling,
            state_changed,
            inner: Mutex::new(NegotiationInner {
                state,
                remote_description: None,
                pending_candidates: Vec::new(),
                seen_candidates: HashSet::new(),
                local_endpoint: None,
                remote_endpoint: None,
                failure: None,
            }),
        }
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.signaling
    }

    pub fn state(&self) -> NegotiationState {
        self.inner.lock().state
    }

    pub fn failure(&self) -> Option<String> {
        self.inner.lock().failure.clone()
    }

    pub fn local_endpoint(&self) -> Option<EndpointInfo> {
        self.inner.lock().local_endpoint.clone()
    }

    pub fn remote_endpoint(&self) -> Option<EndpointInfo> {
        self.inner.lock().remote_endpoint.clone()
    }

    /// Kick off negotiation. The initiator produces and sends its offer
    /// here, exactly once; the responder just confirms it is waiting.
    pub async fn start(&self) -> Result<(), PeerError> {
        match self.role {
            Role::Initiator => {
                self.transition(
                    NegotiationState::Idle,
                    NegotiationState::AwaitingLocalDescription,
                )?;
                let offer = match self.driver.create_offer().await {
                    Ok(offer) => offer,
                    Err(err) => {
                        self.fail(format!("offer creation failed: {err}"));
                        return Err(PeerError::Negotiation(err.to_string()));
                    }
                };
                self.signaling.send_description(&offer)?;
                self.transition(
                    NegotiationState::AwaitingLocalDescription,
                    NegotiationState::AwaitingRemoteDescription,
                )?;
                Ok(())
            }
            Role::Responder => match self.state() {
                NegotiationState::AwaitingRemoteDescription
                | NegotiationState::NegotiatingCandidates
                | NegotiationState::Open => Ok(()),
                NegotiationState::Closing | NegotiationState::Closed => Err(PeerError::Closed),
                NegotiationState::Failed => Err(PeerError::Negotiation(
                    self.failure().unwrap_or_else(|| "negotiation failed".into()),
                )),
                state => Err(PeerError::InvalidTransition {
                    state,
                    detail: "responder cannot start from here".into(),
                }),
            },
        }
    }

    /// Apply a remote offer or answer. Offers are answered in place;
    /// out-of-order and duplicate descriptions are rejected.
    pub async fn handle_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.check_inbound_description(description.kind)?;
        let kind = description.kind;
        if let Err(err) = self.driver.apply_remote_description(description).await {
            self.fail(format!("applying remote {kind:?} failed: {err}"));
            return Err(PeerError::Negotiation(err.to_string()));
        }
        self.inner.lock().remote_description = Some(kind);

        if kind == DescriptionKind::Offer {
            let answer = match self.driver.create_answer().await {
                Ok(answer) => answer,
                Err(err) => {
                    self.fail(format!("answer creation failed: {err}"));
                    return Err(PeerError::Negotiation(err.to_string()));
                }
            };
            self.signaling.send_description(&answer)?;
        }

        self.transition(
            NegotiationState::AwaitingRemoteDescription,
            NegotiationState::NegotiatingCandidates,
        )?;
        self.flush_pending_candidates().await;
        Ok(())
    }

    fn check_inbound_description(&self, kind: DescriptionKind) -> Result<(), PeerError> {
        let inner = self.inner.lock();
        if matches!(
            inner.state,
            NegotiationState::Closing | NegotiationState::Closed
        ) {
            return Err(PeerError::Closed);
        }
        if inner.remote_description.is_some() {
            return Err(PeerError::InvalidTransition {
                state: inner.state,
                detail: format!("duplicate {kind:?}: a remote description is already applied"),
            });
        }
        let expected = match self.role {
            Role::Initiator => DescriptionKind::Answer,
            Role::Responder => DescriptionKind::Offer,
        };
        if kind != expected {
            return Err(PeerError::InvalidTransition {
                state: inner.state,
                detail: format!("{kind:?} is not valid for a {:?}", self.role),
            });
        }
        if inner.state != NegotiationState::AwaitingRemoteDescription {
            return Err(PeerError::InvalidTransition {
                state: inner.state,
                detail: format!("{kind:?} arrived before a remote description was expected"),
            });
        }
        Ok(())
    }

    /// Add a remote connectivity candidate. Candidates arriving before the
    /// remote description are buffered and flushed once it is applied;
    /// duplicates are ignored.
    pub async fn handle_remote_candidate(&self, candidate: Candidate) -> Result<(), PeerError> {
        {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                NegotiationState::Closing | NegotiationState::Closed
            ) {
                return Err(PeerError::Closed);
            }
            if !inner.seen_candidates.insert(candidate.candidate.clone()) {
                tracing::trace!(
                    target = "peer",
                    candidate = %candidate.candidate,
                    "duplicate candidate ignored"
                );
                return Ok(());
            }
            inner.remote_endpoint = Some(EndpointInfo::from_candidate(&candidate));
            if inner.remote_description.is_none() {
                tracing::debug!(
                    target = "peer",
                    candidate = %candidate.candidate,
                    "buffering candidate until the remote description is applied"
                );
                inner.pending_candidates.push(candidate);
                return Ok(());
            }
        }
        self.driver
            .add_remote_candidate(candidate)
            .await
            .map_err(|err| PeerError::Negotiation(format!("candidate rejected: {err}")))
    }

    async fn flush_pending_candidates(&self) {
        let queued: Vec<Candidate> = {
            let mut inner = self.inner.lock();
            inner.pending_candidates.drain(..).collect()
        };
        for candidate in queued {
            if let Err(err) = self.driver.add_remote_candidate(candidate.clone()).await {
                tracing::warn!(
                    target = "peer",
                    error = %err,
                    candidate = %candidate.candidate,
                    "buffered candidate rejected"
                );
            }
        }
    }

    /// Forward a locally discovered candidate to the remote peer and keep
    /// the observed path for diagnostics.
    pub fn handle_local_candidate(&self, candidate: &Candidate) -> Result<(), PeerError> {
        self.inner.lock().local_endpoint = Some(EndpointInfo::from_candidate(candidate));
        self.signaling.send_candidate(candidate)
    }

    /// Channel opened underneath us. Returns true only on the first call
    /// that actually advances the state.
    pub fn mark_open(&self) -> bool {
        let advanced = {
            let mut inner = self.inner.lock();
            match inner.state {
                NegotiationState::AwaitingRemoteDescription
                | NegotiationState::NegotiatingCandidates => {
                    inner.state = NegotiationState::Open;
                    true
                }
                _ => false,
            }
        };
        if advanced {
            tracing::debug!(target = "peer", "channel open; negotiation complete");
            self.state_changed.notify_waiters();
        }
        advanced
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut inner = self.inner.lock();
            if matches!(
                inner.state,
                NegotiationState::Failed | NegotiationState::Closing | NegotiationState::Closed
            ) {
                return;
            }
            inner.state = NegotiationState::Failed;
            inner.failure = Some(reason.clone());
        }
        tracing::warn!(target = "peer", %reason, "negotiation failed");
        self.state_changed.notify_waiters();
    }

    /// First step of shutdown. Returns false when already closing/closed,
    /// making close idempotent.
    pub fn begin_close(&self) -> bool {
        let begun = {
            let mut inner = self.inner.lock();
            match inner.state {
                NegotiationState::Closing | NegotiationState::Closed => false,
                _ => {
                    inner.state = NegotiationState::Closing;
                    true
                }
            }
        };
        if begun {
            self.state_changed.notify_waiters();
        }
        begun
    }

    pub fn finish_close(&self) {
        self.inner.lock().state = NegotiationState::Closed;
        self.state_changed.notify_waiters();
    }

    fn transition(
        &self,
        from: NegotiationState,
        to: NegotiationState,
    ) -> Result<(), PeerError> {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                state if state == from => inner.state = to,
                NegotiationState::Closing | NegotiationState::Closed => {
                    return Err(PeerError::Closed);
                }
                state => {
                    return Err(PeerError::InvalidTransition {
                        state,
                        detail: format!("expected {from:?}"),
                    });
                }
            }
        }
        tracing::debug!(target = "peer", from = ?from, to = ?to, "negotiation state advanced");
        self.state_changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;
    use crate::signaling::SignalEnvelope;
    use swarm_bus::{Bus, LocalBus, topics};

    fn negotiator(role: Role, driver: Arc<MemoryDriver>, bus: Arc<LocalBus>) -> Negotiator {
        let (local, remote) = match role {
            Role::Initiator => ("a", "b"),
            Role::Responder => ("b", "a"),
        };
        let signaling = SignalingChannel::new(
            bus as Arc<dyn Bus>,
            local.into(),
            remote.into(),
            "a:b".into(),
        );
        Negotiator::new(role, driver, signaling, Arc::new(Notify::new()))
    }

    fn offer() -> SessionDescription {
        SessionDescription {
            kind: DescriptionKind::Offer,
            sdp: "v=memory o=- test offer".into(),
        }
    }

    fn answer() -> SessionDescription {
        SessionDescription {
            kind: DescriptionKind::Answer,
            sdp: "v=memory o=- test answer".into(),
        }
    }

    fn candidate(tag: &str) -> Candidate {
        Candidate {
            candidate: format!("candidate:{tag} 1 udp 1 192.0.2.7 40000 typ host"),
            address: Some("192.0.2.7".into()),
            port: Some(40000),
            protocol: Some("udp".into()),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn initiator_sends_offer_exactly_once() {
        let bus = Arc::new(LocalBus::new());
        let mut signals = bus.subscribe(topics::SIGNAL);
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Initiator, driver, bus);

        negotiator.start().await.expect("start");
        assert_eq!(
            negotiator.state(),
            NegotiationState::AwaitingRemoteDescription
        );

        let message = signals.try_recv().expect("offer published");
        let envelope: SignalEnvelope =
            serde_json::from_slice(&message.payload).expect("decode envelope");
        assert_eq!(envelope.to, "b");
        assert_eq!(envelope.channel_name, "a:b");
        assert_eq!(envelope.sdp.expect("sdp").kind, DescriptionKind::Offer);
        assert!(signals.try_recv().is_err(), "exactly one offer");

        // a second start must not produce a second offer
        assert!(matches!(
            negotiator.start().await,
            Err(PeerError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn responder_answers_offer_on_same_channel() {
        let bus = Arc::new(LocalBus::new());
        let mut signals = bus.subscribe(topics::SIGNAL);
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Responder, driver, bus);

        negotiator
            .handle_remote_description(offer())
            .await
            .expect("offer applied");
        assert_eq!(negotiator.state(), NegotiationState::NegotiatingCandidates);

        let message = signals.try_recv().expect("answer published");
        let envelope: SignalEnvelope =
            serde_json::from_slice(&message.payload).expect("decode envelope");
        assert_eq!(envelope.channel_name, "a:b");
        assert_eq!(envelope.to, "a");
        assert_eq!(envelope.sdp.expect("sdp").kind, DescriptionKind::Answer);
        assert!(signals.try_recv().is_err(), "exactly one answer");
    }

    #[tokio::test]
    async fn duplicate_remote_description_is_rejected() {
        let bus = Arc::new(LocalBus::new());
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Responder, driver, bus);

        negotiator
            .handle_remote_description(offer())
            .await
            .expect("first offer");
        let err = negotiator
            .handle_remote_description(offer())
            .await
            .expect_err("duplicate rejected");
        assert!(matches!(err, PeerError::InvalidTransition { .. }));
        assert_eq!(negotiator.state(), NegotiationState::NegotiatingCandidates);
    }

    #[tokio::test]
    async fn answer_without_prior_offer_is_rejected() {
        let bus = Arc::new(LocalBus::new());
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Responder, driver, bus);

        let err = negotiator
            .handle_remote_description(answer())
            .await
            .expect_err("answer to nobody");
        assert!(matches!(err, PeerError::InvalidTransition { .. }));
        assert_eq!(
            negotiator.state(),
            NegotiationState::AwaitingRemoteDescription
        );
    }

    #[tokio::test]
    async fn initiator_rejects_answer_before_its_own_offer() {
        let bus = Arc::new(LocalBus::new());
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Initiator, driver, bus);

        let err = negotiator
            .handle_remote_description(answer())
            .await
            .expect_err("no local offer yet");
        assert!(matches!(err, PeerError::InvalidTransition { .. }));
        assert_eq!(negotiator.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn early_candidates_buffer_and_flush() {
        let bus = Arc::new(LocalBus::new());
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Responder, Arc::clone(&driver), bus);

        negotiator
            .handle_remote_candidate(candidate("early"))
            .await
            .expect("buffered, not applied");
        assert_eq!(driver.remote_candidate_count(), 0);
        assert!(negotiator.remote_endpoint().is_some());

        negotiator
            .handle_remote_description(offer())
            .await
            .expect("offer applied");
        assert_eq!(driver.remote_candidate_count(), 1, "buffered candidate flushed");

        negotiator
            .handle_remote_candidate(candidate("late"))
            .await
            .expect("applied directly");
        assert_eq!(driver.remote_candidate_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_candidates_are_idempotent() {
        let bus = Arc::new(LocalBus::new());
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Responder, Arc::clone(&driver), bus);

        negotiator
            .handle_remote_description(offer())
            .await
            .expect("offer applied");
        negotiator
            .handle_remote_candidate(candidate("dup"))
            .await
            .expect("first");
        negotiator
            .handle_remote_candidate(candidate("dup"))
            .await
            .expect("second is a no-op");
        assert_eq!(driver.remote_candidate_count(), 1);
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_and_recorded() {
        let bus = Arc::new(LocalBus::new());
        let mut signals = bus.subscribe(topics::SIGNAL);
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Initiator, driver, bus);

        let local = Candidate {
            address: Some("2001:db8::1".into()),
            ..candidate("local")
        };
        negotiator
            .handle_local_candidate(&local)
            .expect("forwarded");
        let endpoint = negotiator.local_endpoint().expect("recorded");
        assert_eq!(endpoint.family, Some(IpFamily::V6));
        assert_eq!(endpoint.port, Some(40000));

        let message = signals.try_recv().expect("candidate published");
        let envelope: SignalEnvelope =
            serde_json::from_slice(&message.payload).expect("decode envelope");
        assert_eq!(envelope.to, "b");
        assert!(envelope.candidate.is_some());
    }

    #[tokio::test]
    async fn close_wins_from_any_state_and_only_once() {
        let bus = Arc::new(LocalBus::new());
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Initiator, driver, bus);

        negotiator.start().await.expect("start");
        assert!(negotiator.begin_close());
        assert!(!negotiator.begin_close(), "second close is a no-op");
        negotiator.finish_close();
        assert_eq!(negotiator.state(), NegotiationState::Closed);

        let err = negotiator
            .handle_remote_description(answer())
            .await
            .expect_err("closed peers reject input");
        assert!(matches!(err, PeerError::Closed));
    }

    #[tokio::test]
    async fn failure_is_typed_and_observable() {
        let bus = Arc::new(LocalBus::new());
        let (driver, _other) = MemoryDriver::pair();
        let negotiator = negotiator(Role::Initiator, driver, bus);

        negotiator.fail("no route to peer");
        assert_eq!(negotiator.state(), NegotiationState::Failed);
        assert_eq!(negotiator.failure().as_deref(), Some("no route to peer"));

        // first reason sticks
        negotiator.fail("later noise");
        assert_eq!(negotiator.failure().as_deref(), Some("no route to peer"));
    }
}
