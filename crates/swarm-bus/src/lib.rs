//! In-process publish/subscribe bus shared by swarm peers.
//!
//! Signaling envelopes, inbound channel data, and connection notifications
//! travel over named topics. Every subscriber receives every message on a
//! topic; recipient filtering is the subscriber's responsibility (see
//! swarm-peer). The bus is handed to each peer at construction rather than
//! living in a process global.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

/// Topics the swarm client publishes on.
pub mod topics {
    /// Relayed negotiation payloads (offers, answers, candidates).
    pub const SIGNAL: &str = "signal";
    /// Every message received over an open peer channel.
    pub const PEER_DATA: &str = "peer:data";
    /// Emitted once per side when a peer channel opens.
    pub const PEER_CONNECTED: &str = "peer:connected";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    /// Publish is fire-and-forget: delivery to zero subscribers is not an
    /// error. Returns the number of subscribers the message reached.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;
    fn subscriber_count(&self, topic: &str) -> usize;
}

/// In-memory bus carrying all topics of a single process.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(128).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let sender = self.sender_for(topic);
        match sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        }) {
            Ok(delivered) => Ok(delivered),
            // A topic nobody listens on yet drops the message, per bus
            // semantics: no delivery guarantee.
            Err(_) => Ok(0),
        }
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_on_named_topic() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe(topics::SIGNAL);
        let delivered = bus
            .publish(topics::SIGNAL, Bytes::from_static(b"offer"))
            .expect("publish ok");
        assert_eq!(delivered, 1);
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, topics::SIGNAL);
        assert_eq!(msg.payload, Bytes::from_static(b"offer"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = LocalBus::new();
        let delivered = bus
            .publish(topics::PEER_DATA, Bytes::from_static(b"lost"))
            .expect("publish ok");
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn subscriber_count_tracks_receiver_lifetimes() {
        let bus = LocalBus::new();
        assert_eq!(bus.subscriber_count(topics::PEER_DATA), 0);
        let first = bus.subscribe(topics::PEER_DATA);
        let second = bus.subscribe(topics::PEER_DATA);
        assert_eq!(bus.subscriber_count(topics::PEER_DATA), 2);
        drop(first);
        assert_eq!(bus.subscriber_count(topics::PEER_DATA), 1);
        drop(second);
        assert_eq!(bus.subscriber_count(topics::PEER_DATA), 0);
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = LocalBus::new();
        let mut signal = bus.subscribe(topics::SIGNAL);
        let mut data = bus.subscribe(topics::PEER_DATA);
        bus.publish(topics::SIGNAL, Bytes::from_static(b"sdp"))
            .expect("publish ok");
        assert!(signal.try_recv().is_ok());
        assert!(data.try_recv().is_err());
    }
}
