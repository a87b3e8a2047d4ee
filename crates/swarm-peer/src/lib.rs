//! Peer-link negotiation and data-channel transport for the swarm client.
//!
//! Responsibilities:
//! - exchanging session descriptions and connectivity candidates over a
//!   relayed signaling bus
//! - driving an external connection primitive to an open message channel
//! - guarding channel access by readiness state
//! - correlating request/response traffic multiplexed over the channel
//! - accounting sent/received bytes per connection
//!
//! The connection primitive itself (ICE/SDP machinery) lives behind the
//! [`driver::ConnectionDriver`] trait; swarm-webrtc provides the production
//! implementation and [`driver::memory`] a loopback pair for tests.

mod bandwidth;
mod channel;
pub mod config;
pub mod driver;
pub mod error;
pub mod negotiation;
pub mod peer;
mod rpc;
pub mod signaling;

pub use bandwidth::BandwidthUsage;
pub use config::{ConnectivityConfig, PeerConfig, Role};
pub use driver::{ChannelState, ConnectionDriver, DriverError, DriverEvent};
pub use error::PeerError;
pub use negotiation::{EndpointInfo, IpFamily, NegotiationState};
pub use peer::Peer;
pub use signaling::{
    Candidate, DescriptionKind, PeerId, SessionDescription, SignalEnvelope, SignalingChannel,
};
