use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PeerError;
use crate::signaling::PeerId;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_PENDING_REQUESTS: usize = 256;

/// Which side of the link creates the initial session offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

/// Discovery-assistance servers handed to the connection primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    pub servers: Vec<String>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Identifies this logical session among concurrent sessions between
    /// the same two identifiers.
    pub channel_name: String,
    pub role: Role,
    pub local_id: PeerId,
    pub remote_id: PeerId,
    pub connectivity: ConnectivityConfig,
    /// Media stream labels carried for surface compatibility; the data
    /// path ignores them.
    pub streams: Vec<String>,
    pub negotiation_timeout: Duration,
    pub request_timeout: Duration,
    pub max_pending_requests: usize,
}

impl PeerConfig {
    pub fn new(
        channel_name: impl Into<String>,
        role: Role,
        local_id: impl Into<PeerId>,
        remote_id: impl Into<PeerId>,
    ) -> Self {
        Self {
            channel_name: channel_name.into(),
            role,
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            connectivity: ConnectivityConfig::default(),
            streams: Vec::new(),
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_pending_requests: DEFAULT_MAX_PENDING_REQUESTS,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), PeerError> {
        if self.channel_name.is_empty() {
            return Err(PeerError::Config("channel name must be non-empty"));
        }
        if self.local_id.is_empty() || self.remote_id.is_empty() {
            return Err(PeerError::Config("peer ids must be non-empty"));
        }
        if self.local_id == self.remote_id {
            return Err(PeerError::Config("local and remote ids must differ"));
        }
        if self.connectivity.servers.is_empty() {
            return Err(PeerError::Config(
                "connectivity requires at least one server url",
            ));
        }
        if self.max_pending_requests == 0 {
            return Err(PeerError::Config("pending request limit must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PeerConfig::new("a:b", Role::Initiator, "a", "b");
        assert!(config.validate().is_ok());
        assert_eq!(config.connectivity.servers, vec![DEFAULT_STUN_SERVER]);
    }

    #[test]
    fn rejects_identical_ids() {
        let config = PeerConfig::new("a:a", Role::Initiator, "a", "a");
        assert!(matches!(config.validate(), Err(PeerError::Config(_))));
    }

    #[test]
    fn rejects_empty_connectivity() {
        let mut config = PeerConfig::new("a:b", Role::Responder, "a", "b");
        config.connectivity.servers.clear();
        assert!(matches!(config.validate(), Err(PeerError::Config(_))));
    }
}
