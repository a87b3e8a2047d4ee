use std::sync::Arc;

use bytes::Bytes;

use swarm_bus::{Bus, topics};

use crate::bandwidth::BandwidthTracker;
use crate::driver::{ChannelState, ConnectionDriver};
use crate::error::PeerError;

/// Guards the bidirectional message channel by its readiness state.
///
/// Sends before the channel is open are refused, never buffered. Successful
/// traffic is the only writer of the bandwidth counters.
pub(crate) struct ChannelTransport {
    driver: Arc<dyn ConnectionDriver>,
    bandwidth: Arc<BandwidthTracker>,
    bus: Arc<dyn Bus>,
}

impl ChannelTransport {
    pub fn new(
        driver: Arc<dyn ConnectionDriver>,
        bandwidth: Arc<BandwidthTracker>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self {
            driver,
            bandwidth,
            bus,
        }
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), PeerError> {
        match self.driver.channel_state() {
            ChannelState::Open => {
                self.driver.send(payload.clone()).await?;
                self.bandwidth.record_sent(payload.len() as u64);
                Ok(())
            }
            state @ (ChannelState::Closing | ChannelState::Closed) => {
                tracing::debug!(
                    target = "peer",
                    %state,
                    "channel no longer accepts messages; check the peer state before sending"
                );
                Err(PeerError::ChannelNotOpen { state })
            }
            state @ (ChannelState::NotCreated | ChannelState::Connecting) => {
                tracing::debug!(
                    target = "peer",
                    %state,
                    "trying to send before the channel is ready"
                );
                Err(PeerError::ChannelNotOpen { state })
            }
        }
    }

    /// Inbound path: account the bytes and republish for every consumer
    /// (the request correlator among them).
    pub fn receive(&self, payload: Bytes) {
        self.bandwidth.record_received(payload.len() as u64);
        if let Err(err) = self.bus.publish(topics::PEER_DATA, payload) {
            tracing::warn!(
                target = "peer",
                error = %err,
                "failed to republish inbound message"
            );
        }
    }
}
