use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use swarm_bus::{Bus, BusMessage, topics};

use crate::error::PeerError;

pub type PeerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Wire schema of a relayed negotiation payload. Exactly one of `candidate`
/// and `sdp` is set by this client; payloads carrying neither are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub to: PeerId,
    pub from: PeerId,
    pub channel_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
}

/// Binds one logical session to the shared signaling bus.
///
/// The bus is process-wide shared state: every peer sees every envelope.
/// `accepts` is the sole isolation mechanism between sessions and must be
/// applied before any state mutation.
pub struct SignalingChannel {
    bus: Arc<dyn Bus>,
    local_id: PeerId,
    remote_id: PeerId,
    channel_name: String,
}

impl SignalingChannel {
    pub fn new(
        bus: Arc<dyn Bus>,
        local_id: PeerId,
        remote_id: PeerId,
        channel_name: String,
    ) -> Self {
        Self {
            bus,
            local_id,
            remote_id,
            channel_name,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.bus.subscribe(topics::SIGNAL)
    }

    pub fn accepts(&self, envelope: &SignalEnvelope) -> bool {
        envelope.to == self.local_id
            && envelope.from == self.remote_id
            && envelope.channel_name == self.channel_name
    }

    pub fn send_description(&self, description: &SessionDescription) -> Result<(), PeerError> {
        self.publish(SignalEnvelope {
            to: self.remote_id.clone(),
            from: self.local_id.clone(),
            channel_name: self.channel_name.clone(),
            candidate: None,
            sdp: Some(description.clone()),
        })
    }

    pub fn send_candidate(&self, candidate: &Candidate) -> Result<(), PeerError> {
        self.publish(SignalEnvelope {
            to: self.remote_id.clone(),
            from: self.local_id.clone(),
            channel_name: self.channel_name.clone(),
            candidate: Some(candidate.clone()),
            sdp: None,
        })
    }

    fn publish(&self, envelope: SignalEnvelope) -> Result<(), PeerError> {
        let payload = serde_json::to_vec(&envelope)?;
        let delivered = self.bus.publish(topics::SIGNAL, Bytes::from(payload))?;
        tracing::trace!(
            target = "signaling",
            to = %envelope.to,
            channel = %envelope.channel_name,
            delivered,
            "published signal"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_bus::LocalBus;

    fn channel(bus: Arc<dyn Bus>) -> SignalingChannel {
        SignalingChannel::new(bus, "a".into(), "b".into(), "a:b".into())
    }

    #[test]
    fn envelope_wire_field_names() {
        let envelope = SignalEnvelope {
            to: "b".into(),
            from: "a".into(),
            channel_name: "a:b".into(),
            candidate: None,
            sdp: Some(SessionDescription {
                kind: DescriptionKind::Offer,
                sdp: "v=0".into(),
            }),
        };
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["to"], "b");
        assert_eq!(value["from"], "a");
        assert_eq!(value["channelName"], "a:b");
        assert_eq!(value["sdp"]["type"], "offer");
        assert_eq!(value["sdp"]["sdp"], "v=0");
        assert!(value.get("candidate").is_none());
    }

    #[test]
    fn candidate_wire_field_names() {
        let candidate = Candidate {
            candidate: "candidate:0 1 udp 1 192.0.2.1 40000 typ host".into(),
            address: Some("192.0.2.1".into()),
            port: Some(40000),
            protocol: Some("udp".into()),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let value = serde_json::to_value(&candidate).expect("serialize");
        assert_eq!(value["address"], "192.0.2.1");
        assert_eq!(value["port"], 40000);
        assert_eq!(value["protocol"], "udp");
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMlineIndex"], 0);
    }

    #[tokio::test]
    async fn accepts_filters_recipient_sender_and_session() {
        let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
        let signaling = channel(bus);
        let mut envelope = SignalEnvelope {
            to: "a".into(),
            from: "b".into(),
            channel_name: "a:b".into(),
            candidate: None,
            sdp: None,
        };
        assert!(signaling.accepts(&envelope));

        envelope.to = "c".into();
        assert!(!signaling.accepts(&envelope));
        envelope.to = "a".into();

        envelope.from = "c".into();
        assert!(!signaling.accepts(&envelope));
        envelope.from = "b".into();

        envelope.channel_name = "a:b:2".into();
        assert!(!signaling.accepts(&envelope));
    }

    #[tokio::test]
    async fn send_description_publishes_on_signal_topic() {
        let bus = Arc::new(LocalBus::new());
        let mut sub = bus.subscribe(topics::SIGNAL);
        let signaling = channel(bus.clone());
        signaling
            .send_description(&SessionDescription {
                kind: DescriptionKind::Answer,
                sdp: "v=0".into(),
            })
            .expect("send");
        let message = sub.try_recv().expect("published");
        let decoded: SignalEnvelope = serde_json::from_slice(&message.payload).expect("decode");
        assert_eq!(decoded.to, "b");
        assert_eq!(decoded.sdp.expect("sdp").kind, DescriptionKind::Answer);
    }
}
