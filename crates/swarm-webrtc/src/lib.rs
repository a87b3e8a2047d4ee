//! WebRTC-backed connection driver for swarm peers.
//!
//! Implements [`ConnectionDriver`] over `RTCPeerConnection` and an ordered
//! `RTCDataChannel`: the initiator creates the channel before its offer,
//! the responder adopts the announced one, and trickle candidates surface
//! as driver events for the negotiator to relay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use swarm_peer::driver::{ChannelState, ConnectionDriver, DriverError, DriverEvent};
use swarm_peer::{Candidate, ConnectivityConfig, DescriptionKind, Role, SessionDescription};

pub struct WebRtcDriver {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
}

impl WebRtcDriver {
    pub async fn new(
        connectivity: &ConnectivityConfig,
        role: Role,
        channel_label: &str,
    ) -> Result<Self, DriverError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        Self::with_setting_engine(connectivity, role, channel_label, setting).await
    }

    /// Build on a caller-supplied `SettingEngine`; tests use this to run on
    /// webrtc's virtual network without OS networking access.
    pub async fn with_setting_engine(
        connectivity: &ConnectivityConfig,
        role: Role,
        channel_label: &str,
        setting: SettingEngine,
    ) -> Result<Self, DriverError> {
        let api = build_api(setting)?;
        let config = if connectivity.servers.is_empty() {
            RTCConfiguration::default()
        } else {
            RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: connectivity.servers.clone(),
                    ..Default::default()
                }],
                ..Default::default()
            }
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_driver_error)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));

        let candidate_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(DriverEvent::LocalCandidate(Candidate {
                            candidate: init.candidate,
                            address: Some(candidate.address.clone()),
                            port: Some(candidate.port),
                            protocol: Some(candidate.protocol.to_string()),
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "webrtc",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        match role {
            Role::Initiator => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(channel_label, Some(init))
                    .await
                    .map_err(to_driver_error)?;
                wire_channel(&dc, &events_tx);
                *channel.lock() = Some(dc);
            }
            Role::Responder => {
                let slot = Arc::clone(&channel);
                let incoming_tx = events_tx.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = Arc::clone(&slot);
                    let tx = incoming_tx.clone();
                    Box::pin(async move {
                        tracing::debug!(
                            target = "webrtc",
                            label = %dc.label(),
                            "remote data channel announced"
                        );
                        wire_channel(&dc, &tx);
                        let mut guard = slot.lock();
                        if guard.is_none() {
                            *guard = Some(dc);
                        }
                    })
                }));
            }
        }

        Ok(Self {
            pc,
            channel,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<DriverEvent>) {
    let open_tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = open_tx.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel open");
            let _ = tx.send(DriverEvent::ChannelOpen);
        })
    }));
    let message_tx = events.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            let _ = tx.send(DriverEvent::Message(message.data));
        })
    }));
    let close_tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = close_tx.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "data channel closed");
            let _ = tx.send(DriverEvent::ChannelClosed);
        })
    }));
    dc.on_error(Box::new(move |err| {
        Box::pin(async move {
            tracing::warn!(target = "webrtc", error = %err, "data channel error");
        })
    }));
}

#[async_trait]
impl ConnectionDriver for WebRtcDriver {
    async fn create_offer(&self) -> Result<SessionDescription, DriverError> {
        let offer = self.pc.create_offer(None).await.map_err(to_driver_error)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_driver_error)?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| DriverError::Failed("missing local description".into()))?;
        description_from_rtc(&local)
    }

    async fn create_answer(&self) -> Result<SessionDescription, DriverError> {
        if self.pc.remote_description().await.is_none() {
            return Err(DriverError::NoRemoteDescription);
        }
        let answer = self.pc.create_answer(None).await.map_err(to_driver_error)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(to_driver_error)?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| DriverError::Failed("missing local description".into()))?;
        description_from_rtc(&local)
    }

    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<(), DriverError> {
        let desc = rtc_from_description(&desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(to_driver_error)
    }

    async fn add_remote_candidate(&self, candidate: Candidate) -> Result<(), DriverError> {
        if self.pc.remote_description().await.is_none() {
            return Err(DriverError::NoRemoteDescription);
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_driver_error)
    }

    fn channel_state(&self) -> ChannelState {
        match self.channel.lock().as_ref().map(|dc| dc.ready_state()) {
            None => ChannelState::NotCreated,
            Some(RTCDataChannelState::Connecting) => ChannelState::Connecting,
            Some(RTCDataChannelState::Open) => ChannelState::Open,
            Some(RTCDataChannelState::Closing) => ChannelState::Closing,
            Some(RTCDataChannelState::Closed) => ChannelState::Closed,
            Some(_) => ChannelState::NotCreated,
        }
    }

    async fn send(&self, payload: Bytes) -> Result<(), DriverError> {
        let dc = { self.channel.lock().clone() };
        let Some(dc) = dc else {
            return Err(DriverError::ChannelNotOpen);
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(DriverError::ChannelNotOpen);
        }
        dc.send(&payload)
            .await
            .map(|_| ())
            .map_err(to_driver_error)
    }

    async fn close(&self) {
        let dc = { self.channel.lock().clone() };
        if let Some(dc) = dc {
            if let Err(err) = dc.close().await {
                tracing::debug!(target = "webrtc", error = %err, "data channel close");
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "webrtc", error = %err, "peer connection close");
        }
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DriverEvent>> {
        self.events_rx.lock().take()
    }
}

fn build_api(setting: SettingEngine) -> Result<API, DriverError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_driver_error)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(to_driver_error)?;
    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn description_from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription, DriverError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => DescriptionKind::Offer,
        RTCSdpType::Answer => DescriptionKind::Answer,
        other => return Err(DriverError::Failed(format!("unsupported sdp type {other}"))),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

fn rtc_from_description(desc: &SessionDescription) -> Result<RTCSessionDescription, DriverError> {
    match desc.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        DescriptionKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
    .map_err(to_driver_error)
}

fn to_driver_error<E: std::fmt::Display>(err: E) -> DriverError {
    DriverError::Failed(err.to_string())
}
