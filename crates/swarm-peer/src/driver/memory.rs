//! Loopback driver pair for tests.
//!
//! Mimics the observable behavior of a real connection primitive without
//! touching the network: descriptions must be exchanged, a candidate is
//! emitted when a local description is created, candidates are rejected
//! until a remote description is applied, and the channel opens only after
//! both sides hold both descriptions and at least one remote candidate.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ChannelState, ConnectionDriver, DriverError, DriverEvent};
use crate::signaling::{Candidate, DescriptionKind, SessionDescription};

struct EndpointState {
    local_description: Option<DescriptionKind>,
    remote_description: Option<DescriptionKind>,
    remote_candidates: Vec<Candidate>,
    events: mpsc::UnboundedSender<DriverEvent>,
}

impl EndpointState {
    fn new(events: mpsc::UnboundedSender<DriverEvent>) -> Self {
        Self {
            local_description: None,
            remote_description: None,
            remote_candidates: Vec::new(),
            events,
        }
    }

    fn negotiated(&self) -> bool {
        self.local_description.is_some()
            && self.remote_description.is_some()
            && !self.remote_candidates.is_empty()
    }
}

struct LinkState {
    endpoints: [EndpointState; 2],
    open: bool,
    closed: bool,
}

pub struct MemoryDriver {
    index: usize,
    link: Arc<Mutex<LinkState>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
}

impl MemoryDriver {
    pub fn pair() -> (Arc<MemoryDriver>, Arc<MemoryDriver>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(LinkState {
            endpoints: [EndpointState::new(tx_a), EndpointState::new(tx_b)],
            open: false,
            closed: false,
        }));
        let a = Arc::new(MemoryDriver {
            index: 0,
            link: Arc::clone(&link),
            events_rx: Mutex::new(Some(rx_a)),
        });
        let b = Arc::new(MemoryDriver {
            index: 1,
            link,
            events_rx: Mutex::new(Some(rx_b)),
        });
        (a, b)
    }

    /// Remote candidates this endpoint has accepted so far.
    pub fn remote_candidate_count(&self) -> usize {
        self.link.lock().endpoints[self.index].remote_candidates.len()
    }

    fn emit_local_candidate(&self, link: &mut LinkState) {
        let port = 42000 + self.index as u16;
        let candidate = Candidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {port} typ host",
                self.index
            ),
            address: Some("127.0.0.1".to_string()),
            port: Some(port),
            protocol: Some("udp".to_string()),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let _ = link.endpoints[self.index]
            .events
            .send(DriverEvent::LocalCandidate(candidate));
    }

    fn try_open(link: &mut LinkState) {
        if link.open || link.closed {
            return;
        }
        if link.endpoints.iter().all(EndpointState::negotiated) {
            link.open = true;
            for endpoint in &link.endpoints {
                let _ = endpoint.events.send(DriverEvent::ChannelOpen);
            }
        }
    }
}

#[async_trait]
impl ConnectionDriver for MemoryDriver {
    async fn create_offer(&self) -> Result<SessionDescription, DriverError> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(DriverError::Failed("connection closed".into()));
        }
        if link.endpoints[self.index].local_description.is_some() {
            return Err(DriverError::Failed(
                "local description already created".into(),
            ));
        }
        link.endpoints[self.index].local_description = Some(DescriptionKind::Offer);
        self.emit_local_candidate(&mut link);
        Ok(SessionDescription {
            kind: DescriptionKind::Offer,
            sdp: format!("v=memory o=- {} offer", Uuid::new_v4()),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, DriverError> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(DriverError::Failed("connection closed".into()));
        }
        if link.endpoints[self.index].remote_description != Some(DescriptionKind::Offer) {
            return Err(DriverError::NoRemoteDescription);
        }
        if link.endpoints[self.index].local_description.is_some() {
            return Err(DriverError::Failed(
                "local description already created".into(),
            ));
        }
        link.endpoints[self.index].local_description = Some(DescriptionKind::Answer);
        self.emit_local_candidate(&mut link);
        MemoryDriver::try_open(&mut link);
        Ok(SessionDescription {
            kind: DescriptionKind::Answer,
            sdp: format!("v=memory o=- {} answer", Uuid::new_v4()),
        })
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), DriverError> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(DriverError::Failed("connection closed".into()));
        }
        if link.endpoints[self.index].remote_description.is_some() {
            return Err(DriverError::Failed(
                "remote description already applied".into(),
            ));
        }
        link.endpoints[self.index].remote_description = Some(desc.kind);
        MemoryDriver::try_open(&mut link);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), DriverError> {
        let mut link = self.link.lock();
        if link.closed {
            return Err(DriverError::Failed("connection closed".into()));
        }
        if link.endpoints[self.index].remote_description.is_none() {
            return Err(DriverError::NoRemoteDescription);
        }
        link.endpoints[self.index].remote_candidates.push(candidate);
        MemoryDriver::try_open(&mut link);
        Ok(())
    }

    fn channel_state(&self) -> ChannelState {
        let link = self.link.lock();
        if link.closed {
            ChannelState::Closed
        } else if link.open {
            ChannelState::Open
        } else if link.endpoints[self.index].local_description.is_some() {
            ChannelState::Connecting
        } else {
            ChannelState::NotCreated
        }
    }

    async fn send(&self, payload: Bytes) -> Result<(), DriverError> {
        let link = self.link.lock();
        if link.closed || !link.open {
            return Err(DriverError::ChannelNotOpen);
        }
        link.endpoints[1 - self.index]
            .events
            .send(DriverEvent::Message(payload))
            .map_err(|_| DriverError::Failed("peer event stream dropped".into()))
    }

    async fn close(&self) {
        let mut link = self.link.lock();
        if link.closed {
            return;
        }
        link.closed = true;
        if link.open {
            link.open = false;
            let _ = link.endpoints[1 - self.index]
                .events
                .send(DriverEvent::ChannelClosed);
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>> {
        self.events_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn candidate_before_remote_description_is_rejected() {
        let (a, _b) = MemoryDriver::pair();
        let candidate = Candidate {
            candidate: "candidate:x".into(),
            address: None,
            port: None,
            protocol: None,
            sdp_mid: None,
            sdp_mline_index: None,
        };
        let err = a.add_remote_candidate(candidate).await.expect_err("early");
        assert!(matches!(err, DriverError::NoRemoteDescription));
    }

    #[tokio::test]
    async fn full_exchange_opens_both_sides() {
        let (a, b) = MemoryDriver::pair();
        let mut events_a = a.take_events().expect("events a");
        let mut events_b = b.take_events().expect("events b");

        let offer = a.create_offer().await.expect("offer");
        b.apply_remote_description(offer).await.expect("apply offer");
        let answer = b.create_answer().await.expect("answer");
        a.apply_remote_description(answer).await.expect("apply answer");

        let candidate_a = match events_a.recv().await.expect("candidate a") {
            DriverEvent::LocalCandidate(candidate) => candidate,
            other => panic!("unexpected event: {other:?}"),
        };
        let candidate_b = match events_b.recv().await.expect("candidate b") {
            DriverEvent::LocalCandidate(candidate) => candidate,
            other => panic!("unexpected event: {other:?}"),
        };
        b.add_remote_candidate(candidate_a).await.expect("add a->b");
        a.add_remote_candidate(candidate_b).await.expect("add b->a");

        assert!(matches!(
            events_a.recv().await.expect("open a"),
            DriverEvent::ChannelOpen
        ));
        assert!(matches!(
            events_b.recv().await.expect("open b"),
            DriverEvent::ChannelOpen
        ));
        assert_eq!(a.channel_state(), ChannelState::Open);
        assert_eq!(b.channel_state(), ChannelState::Open);

        a.send(Bytes::from_static(b"hi")).await.expect("send");
        assert!(matches!(
            events_b.recv().await.expect("message"),
            DriverEvent::Message(payload) if payload == Bytes::from_static(b"hi")
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_notifies_peer() {
        let (a, b) = MemoryDriver::pair();
        let _events_a = a.take_events().expect("events a");
        let mut events_b = b.take_events().expect("events b");

        let offer = a.create_offer().await.expect("offer");
        b.apply_remote_description(offer).await.expect("apply");
        let answer = b.create_answer().await.expect("answer");
        a.apply_remote_description(answer).await.expect("apply");
        // drain candidates through directly
        let candidate = Candidate {
            candidate: "candidate:direct".into(),
            address: None,
            port: None,
            protocol: None,
            sdp_mid: None,
            sdp_mline_index: None,
        };
        a.add_remote_candidate(candidate.clone()).await.expect("a");
        b.add_remote_candidate(candidate).await.expect("b");
        assert_eq!(a.channel_state(), ChannelState::Open);

        a.close().await;
        a.close().await;
        assert_eq!(a.channel_state(), ChannelState::Closed);
        // skip b's candidate + open events, then expect the close
        loop {
            match events_b.recv().await.expect("event") {
                DriverEvent::ChannelClosed => break,
                _ => continue,
            }
        }
    }
}
