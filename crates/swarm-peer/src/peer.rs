use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use swarm_bus::{Bus, BusMessage, topics};

use crate::bandwidth::{BandwidthTracker, BandwidthUsage};
use crate::channel::ChannelTransport;
use crate::config::{PeerConfig, Role};
use crate::driver::{ConnectionDriver, DriverEvent};
use crate::error::PeerError;
use crate::negotiation::{EndpointInfo, NegotiationState, Negotiator};
use crate::rpc::{Correlator, RequestEnvelope};
use crate::signaling::{SignalEnvelope, SignalingChannel};

/// One peer link: negotiation, channel transport, request correlation and
/// bandwidth accounting behind a single façade.
///
/// Construction spawns the pump tasks, so a tokio runtime must be current.
pub struct Peer {
    config: PeerConfig,
    negotiator: Arc<Negotiator>,
    transport: Arc<ChannelTransport>,
    correlator: Arc<Correlator>,
    bandwidth: Arc<BandwidthTracker>,
    driver: Arc<dyn ConnectionDriver>,
    state_changed: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(
        config: PeerConfig,
        bus: Arc<dyn Bus>,
        driver: Arc<dyn ConnectionDriver>,
    ) -> Result<Arc<Self>, PeerError> {
        config.validate()?;

        let state_changed = Arc::new(Notify::new());
        let signaling = SignalingChannel::new(
            Arc::clone(&bus),
            config.local_id.clone(),
            config.remote_id.clone(),
            config.channel_name.clone(),
        );
        let negotiator = Arc::new(Negotiator::new(
            config.role,
            Arc::clone(&driver),
            signaling,
            Arc::clone(&state_changed),
        ));
        let bandwidth = Arc::new(BandwidthTracker::new());
        let transport = Arc::new(ChannelTransport::new(
            Arc::clone(&driver),
            Arc::clone(&bandwidth),
            Arc::clone(&bus),
        ));
        let correlator = Arc::new(Correlator::new(config.max_pending_requests));

        let events = driver
            .take_events()
            .ok_or(PeerError::Config("driver event stream already taken"))?;
        let connected_announcement = Bytes::from(serde_json::to_vec(&json!({
            "localId": config.local_id,
            "remoteId": config.remote_id,
            "channelName": config.channel_name,
        }))?);

        let signal_pump = spawn_signal_pump(
            Arc::clone(&negotiator),
            negotiator.signaling().subscribe(),
        );
        let driver_pump = spawn_driver_pump(
            Arc::clone(&negotiator),
            Arc::clone(&transport),
            Arc::clone(&bus),
            connected_announcement,
            events,
        );
        let correlator_pump =
            spawn_correlator_pump(Arc::clone(&correlator), bus.subscribe(topics::PEER_DATA));

        Ok(Arc::new(Self {
            config,
            negotiator,
            transport,
            correlator,
            bandwidth,
            driver,
            state_changed,
            tasks: Mutex::new(vec![signal_pump, driver_pump, correlator_pump]),
        }))
    }

    /// Drive negotiation until the channel opens. A stalled handshake fails
    /// the peer instead of waiting forever.
    pub async fn connect(&self) -> Result<(), PeerError> {
        self.ensure_active()?;
        self.negotiator.start().await?;
        match timeout(self.config.negotiation_timeout, self.wait_until_open()).await {
            Ok(result) => result,
            Err(_) => {
                self.negotiator.fail("negotiation deadline elapsed");
                Err(PeerError::Timeout("negotiation"))
            }
        }
    }

    async fn wait_until_open(&self) -> Result<(), PeerError> {
        loop {
            // arm before checking so a concurrent transition cannot be missed
            let notified = self.state_changed.notified();
            match self.negotiator.state() {
                NegotiationState::Open => return Ok(()),
                NegotiationState::Failed => {
                    return Err(PeerError::Negotiation(
                        self.negotiator
                            .failure()
                            .unwrap_or_else(|| "negotiation failed".into()),
                    ));
                }
                NegotiationState::Closing | NegotiationState::Closed => {
                    return Err(PeerError::Closed);
                }
                _ => notified.await,
            }
        }
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), PeerError> {
        self.ensure_active()?;
        self.transport.send(payload).await
    }

    /// Send a payload tagged with a fresh correlation id and wait for the
    /// response carrying the same id. The waiter is evicted on timeout.
    pub async fn request(&self, data: Value) -> Result<Value, PeerError> {
        self.ensure_active()?;
        let (id, waiter) = self.correlator.register()?;
        let envelope = RequestEnvelope {
            id: id.clone(),
            data,
        };
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                self.correlator.evict(&id);
                return Err(err.into());
            }
        };
        if let Err(err) = self.transport.send(payload).await {
            self.correlator.evict(&id);
            return Err(err);
        }
        match timeout(self.config.request_timeout, waiter).await {
            Ok(Ok(response)) => Ok(response),
            // waiter dropped without a response: the peer shut down
            Ok(Err(_)) => Err(PeerError::Closed),
            Err(_) => {
                self.correlator.evict(&id);
                tracing::debug!(
                    target = "peer",
                    correlation_id = %id,
                    "request timed out; waiter evicted"
                );
                Err(PeerError::Timeout("request response"))
            }
        }
    }

    /// Release the channel, the connection driver, the pumps and the
    /// signaling subscription. Safe to call more than once.
    pub async fn close(&self) -> Result<(), PeerError> {
        if !self.negotiator.begin_close() {
            return Ok(());
        }
        tracing::debug!(
            target = "peer",
            channel = %self.config.channel_name,
            "closing peer"
        );
        let drained: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock();
            tasks.drain(..).collect()
        };
        for task in drained {
            task.abort();
            let _ = task.await;
        }
        self.correlator.clear();
        self.driver.close().await;
        self.negotiator.finish_close();
        Ok(())
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    pub fn failure(&self) -> Option<String> {
        self.negotiator.failure()
    }

    pub fn bandwidth(&self) -> BandwidthUsage {
        self.bandwidth.usage()
    }

    pub fn local_endpoint(&self) -> Option<EndpointInfo> {
        self.negotiator.local_endpoint()
    }

    pub fn remote_endpoint(&self) -> Option<EndpointInfo> {
        self.negotiator.remote_endpoint()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_len()
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn local_id(&self) -> &str {
        &self.config.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.config.remote_id
    }

    pub fn channel_name(&self) -> &str {
        &self.config.channel_name
    }

    fn ensure_active(&self) -> Result<(), PeerError> {
        match self.negotiator.state() {
            NegotiationState::Closing | NegotiationState::Closed => Err(PeerError::Closed),
            _ => Ok(()),
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// Inbound signaling: decode, filter, dispatch. The recipient filter runs
/// before any state is touched; envelopes for other peers or sessions are
/// dropped without side effects.
fn spawn_signal_pump(
    negotiator: Arc<Negotiator>,
    mut signals: broadcast::Receiver<BusMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = match signals.recv().await {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target = "signaling",
                        skipped,
                        "signal subscriber lagged; messages dropped"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let envelope: SignalEnvelope = match serde_json::from_slice(&message.payload) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::debug!(
                        target = "signaling",
                        error = %err,
                        "ignoring malformed signal payload"
                    );
                    continue;
                }
            };
            if !negotiator.signaling().accepts(&envelope) {
                continue;
            }
            if let Some(candidate) = envelope.candidate {
                match negotiator.handle_remote_candidate(candidate).await {
                    Ok(()) => {}
                    Err(PeerError::Closed) => break,
                    Err(err) => {
                        tracing::warn!(target = "peer", error = %err, "remote candidate rejected");
                    }
                }
                continue;
            }
            if let Some(description) = envelope.sdp {
                match negotiator.handle_remote_description(description).await {
                    Ok(()) => {}
                    Err(PeerError::Closed) => break,
                    Err(err) => {
                        tracing::warn!(
                            target = "peer",
                            error = %err,
                            "remote description rejected"
                        );
                    }
                }
            }
        }
    })
}

/// Driver events: local candidates out, inbound data and channel lifecycle
/// in. Announces `peer:connected` exactly once per side.
fn spawn_driver_pump(
    negotiator: Arc<Negotiator>,
    transport: Arc<ChannelTransport>,
    bus: Arc<dyn Bus>,
    connected_announcement: Bytes,
    mut events: mpsc::UnboundedReceiver<DriverEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::LocalCandidate(candidate) => {
                    if let Err(err) = negotiator.handle_local_candidate(&candidate) {
                        tracing::warn!(
                            target = "peer",
                            error = %err,
                            "failed to forward local candidate"
                        );
                    }
                }
                DriverEvent::Message(payload) => transport.receive(payload),
                DriverEvent::ChannelOpen => {
                    if negotiator.mark_open() {
                        if let Err(err) =
                            bus.publish(topics::PEER_CONNECTED, connected_announcement.clone())
                        {
                            tracing::warn!(
                                target = "peer",
                                error = %err,
                                "failed to announce connected peer"
                            );
                        }
                    }
                }
                DriverEvent::ChannelClosed => {
                    tracing::debug!(target = "peer", "channel closed underneath the peer");
                    negotiator.begin_close();
                }
            }
        }
    })
}

/// Watches the shared data topic and resolves pending requests by id.
fn spawn_correlator_pump(
    correlator: Arc<Correlator>,
    mut data: broadcast::Receiver<BusMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match data.recv().await {
                Ok(message) => {
                    correlator.resolve(&message.payload);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target = "peer",
                        skipped,
                        "data subscriber lagged; responses may be lost"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
