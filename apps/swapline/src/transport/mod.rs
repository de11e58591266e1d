use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ErrorKind, ErrorReport};

pub mod bandwidth;
pub mod manager;
#[cfg(any(test, feature = "testkit"))]
pub mod mock;
pub mod peer;
pub mod rtc;
pub mod signaling;

pub use bandwidth::{BandwidthPolicy, BandwidthSettings, NetworkConditions};
pub use manager::{ConnectionHealth, ConnectionManager, ManagerEvent};
pub use peer::{ConnectionState, PeerConnection, PeerEvent};
pub use signaling::{Signaler, SignalingClient, SignalingEvent};

/// Identifier a peer registers under on the signaling relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("data channel {0} is not open")]
    ChannelNotOpen(String),
    #[error("no connection to peer {0}")]
    UnknownPeer(PeerId),
    #[error("connection closed")]
    Closed,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport timeout")]
    Timeout,
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Signaling(_) => ErrorKind::Signaling,
            TransportError::Timeout => ErrorKind::Timeout,
            _ => ErrorKind::Connection,
        }
    }
}

impl From<TransportError> for ErrorReport {
    fn from(err: TransportError) -> Self {
        ErrorReport::new(err.kind(), err.to_string())
    }
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        TransportError::Setup(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid,
            sdp_mline_index,
        }
    }
}

/// Snapshot of the selected candidate pair.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkStats {
    pub rtt_ms: Option<f64>,
    pub available_outgoing_kbps: Option<f64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_uses_browser_field_names() {
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host", Some("0".into()), Some(0));
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn transport_errors_map_to_kinds() {
        assert_eq!(TransportError::Signaling("x".into()).kind(), ErrorKind::Signaling);
        assert_eq!(TransportError::ChannelNotOpen("trade".into()).kind(), ErrorKind::Connection);
        let report: ErrorReport = TransportError::Timeout.into();
        assert_eq!(report.kind, ErrorKind::Timeout);
    }
}
