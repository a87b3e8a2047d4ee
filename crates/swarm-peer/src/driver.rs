use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::{Candidate, SessionDescription};

pub mod memory;

/// Readiness of the bidirectional message channel owned by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    NotCreated,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ChannelState::NotCreated => "not yet created",
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// A connectivity candidate discovered locally, to be relayed to the
    /// remote side.
    LocalCandidate(Candidate),
    ChannelOpen,
    ChannelClosed,
    /// An inbound message from the open channel.
    Message(Bytes),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no remote description has been applied")]
    NoRemoteDescription,
    #[error("channel is not open")]
    ChannelNotOpen,
    #[error("{0}")]
    Failed(String),
}

/// The external negotiation primitive this layer drives.
///
/// Implementations own the actual connection machinery and surface its
/// callbacks as a [`DriverEvent`] stream. All session/candidate ordering
/// rules live above this trait, in the negotiator.
#[async_trait]
pub trait ConnectionDriver: Send + Sync {
    /// Create and store the local offer.
    async fn create_offer(&self) -> Result<SessionDescription, DriverError>;
    /// Create and store the local answer; requires a remote offer.
    async fn create_answer(&self) -> Result<SessionDescription, DriverError>;
    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), DriverError>;
    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), DriverError>;
    fn channel_state(&self) -> ChannelState;
    async fn send(&self, payload: Bytes) -> Result<(), DriverError>;
    /// Release the channel and the underlying connection. Idempotent.
    async fn close(&self);
    /// Hand out the event stream. Yields `Some` exactly once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>>;
}
