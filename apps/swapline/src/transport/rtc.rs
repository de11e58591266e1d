//! Seam between connection bookkeeping and the RTC stack.
//!
//! `PeerConnection` only talks to [`RtcSession`]; the production backend
//! wraps `webrtc::RTCPeerConnection`, tests swap in `transport::mock`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use super::{IceCandidate, LinkStats, PeerId, SdpKind, SessionDescription, TransportError};
use crate::config::ConnectionConfig;

/// ICE agent state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    Text(String),
    Binary(Bytes),
}

impl ChannelPayload {
    pub fn len(&self) -> usize {
        match self {
            ChannelPayload::Text(text) => text.len(),
            ChannelPayload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ChannelPayload::Text(text) => Some(text),
            ChannelPayload::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        }
    }
}

#[async_trait]
pub trait RtcDataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: String) -> Result<usize, TransportError>;
    async fn send_binary(&self, data: Bytes) -> Result<usize, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

impl fmt::Debug for dyn RtcDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcDataChannel")
            .field("label", &self.label())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Everything a backend reports back, in the order it happened.
#[derive(Debug, Clone)]
pub enum RtcSessionEvent {
    IceState(IceState),
    LocalCandidate(IceCandidate),
    IncomingChannel(Arc<dyn RtcDataChannel>),
    ChannelOpen(String),
    ChannelClosed(String),
    Message { label: String, payload: ChannelPayload },
}

pub type RtcEventSender = mpsc::UnboundedSender<RtcSessionEvent>;

#[async_trait]
pub trait RtcSession: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn RtcDataChannel>, TransportError>;
    async fn stats(&self) -> LinkStats;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait RtcSessionFactory: Send + Sync {
    async fn open(
        &self,
        peer: &PeerId,
        config: &ConnectionConfig,
        events: RtcEventSender,
    ) -> Result<Arc<dyn RtcSession>, TransportError>;
}

pub struct WebRtcSessionFactory {
    api: API,
}

impl Default for WebRtcSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WebRtcSessionFactory {
    pub fn new() -> Self {
        Self {
            api: APIBuilder::new().build(),
        }
    }
}

#[async_trait]
impl RtcSessionFactory for WebRtcSessionFactory {
    async fn open(
        &self,
        peer: &PeerId,
        config: &ConnectionConfig,
        events: RtcEventSender,
    ) -> Result<Arc<dyn RtcSession>, TransportError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_transport_policy: if config.turn_relay_only {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        debug!(
            target = "swapline::rtc",
            peer_id = %peer,
            relay_only = config.turn_relay_only,
            "peer connection created"
        );

        let state_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                if let Some(state) = map_ice_state(state) {
                    let _ = events.send(RtcSessionEvent::IceState(state));
                }
            })
        }));

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(RtcSessionEvent::LocalCandidate(IceCandidate::new(
                            init.candidate,
                            init.sdp_mid,
                            init.sdp_mline_index,
                        )));
                    }
                    Err(err) => warn!(target = "swapline::rtc", error = %err, "failed to encode local candidate"),
                }
            })
        }));

        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                debug!(target = "swapline::rtc", label = dc.label(), "remote data channel announced");
                wire_channel(&dc, &events);
                let channel: Arc<dyn RtcDataChannel> = Arc::new(WebRtcChannel { inner: dc });
                let _ = events.send(RtcSessionEvent::IncomingChannel(channel));
            })
        }));

        Ok(Arc::new(WebRtcSession { pc, events }))
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    Some(match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => return None,
    })
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: &RtcEventSender) {
    let label = dc.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let _ = open_events.send(RtcSessionEvent::ChannelOpen(open_label));
        })
    }));

    let close_events = events.clone();
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        let label = close_label.clone();
        Box::pin(async move {
            let _ = events.send(RtcSessionEvent::ChannelClosed(label));
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        let label = label.clone();
        Box::pin(async move {
            trace!(target = "swapline::rtc", label = %label, bytes = msg.data.len(), "data channel frame");
            let payload = if msg.is_string {
                ChannelPayload::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelPayload::Binary(msg.data)
            };
            let _ = events.send(RtcSessionEvent::Message { label, payload });
        })
    }));
}

struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
    events: RtcEventSender,
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    converted.map_err(|err| TransportError::Signaling(err.to_string()))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::Signaling(format!("unexpected sdp type {other}"))),
    }
}

#[async_trait]
impl RtcSession for WebRtcSession {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|err| TransportError::Signaling(err.to_string()))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Signaling(err.to_string()))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|err| TransportError::Signaling(err.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|err| TransportError::Signaling(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn RtcDataChannel>, TransportError> {
        let dc = self.pc.create_data_channel(label, None).await?;
        wire_channel(&dc, &self.events);
        Ok(Arc::new(WebRtcChannel { inner: dc }))
    }

    async fn stats(&self) -> LinkStats {
        let report = self.pc.get_stats().await;
        let mut stats = LinkStats::default();
        for entry in report.reports.values() {
            if let StatsReportType::CandidatePair(pair) = entry {
                if !pair.nominated {
                    continue;
                }
                stats.rtt_ms = (pair.current_round_trip_time > 0.0)
                    .then(|| pair.current_round_trip_time * 1_000.0);
                stats.available_outgoing_kbps = (pair.available_outgoing_bitrate > 0.0)
                    .then(|| pair.available_outgoing_bitrate / 1_000.0);
                stats.bytes_sent = pair.bytes_sent;
                stats.bytes_received = pair.bytes_received;
            }
        }
        stats
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.pc.close().await?;
        Ok(())
    }
}

struct WebRtcChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl RtcDataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<usize, TransportError> {
        Ok(self.inner.send_text(text).await?)
    }

    async fn send_binary(&self, data: Bytes) -> Result<usize, TransportError> {
        Ok(self.inner.send(&data).await?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close().await?;
        Ok(())
    }
}
