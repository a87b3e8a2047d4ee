use thiserror::Error;

use crate::driver::{ChannelState, DriverError};
use crate::negotiation::NegotiationState;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("negotiation message rejected in state {state:?}: {detail}")]
    InvalidTransition {
        state: NegotiationState,
        detail: String,
    },
    #[error("channel is {state}; messages require an open channel")]
    ChannelNotOpen { state: ChannelState },
    #[error("peer is closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("pending request limit reached ({0})")]
    RequestLimit(usize),
    #[error("signaling bus error: {0}")]
    Bus(#[from] swarm_bus::BusError),
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("connection driver error: {0}")]
    Driver(#[from] DriverError),
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}
