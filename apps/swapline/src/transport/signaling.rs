use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{IceCandidate, PeerId, SdpKind, SessionDescription, TransportError};
use crate::config::RetryPolicy;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON envelope exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Offer {
        from: PeerId,
        to: PeerId,
        payload: SessionDescription,
    },
    Answer {
        from: PeerId,
        to: PeerId,
        payload: SessionDescription,
    },
    IceCandidate {
        from: PeerId,
        to: PeerId,
        payload: IceCandidate,
    },
}

impl WireMessage {
    pub fn to(&self) -> &PeerId {
        match self {
            WireMessage::Offer { to, .. }
            | WireMessage::Answer { to, .. }
            | WireMessage::IceCandidate { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    OfferReceived { from: PeerId, sdp: String },
    AnswerReceived { from: PeerId, sdp: String },
    IceCandidateReceived { from: PeerId, candidate: IceCandidate },
    Connected,
    Disconnected { reason: String },
}

/// Outbound half of signaling. Sends never fail per call; a broken control
/// channel shows up as a `Disconnected` event instead.
pub trait Signaler: Send + Sync {
    fn send_offer(&self, to: &PeerId, sdp: &str);
    fn send_answer(&self, to: &PeerId, sdp: &str);
    fn send_ice_candidate(&self, to: &PeerId, candidate: &IceCandidate);
}

/// Single control-plane connection to the relay. Keeps no per-peer state;
/// it only frames outbound envelopes and demultiplexes inbound ones.
pub struct SignalingClient {
    peer_id: PeerId,
    send_tx: mpsc::UnboundedSender<String>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Dial the relay once; later drops are redialled per `retry`.
    pub async fn connect(
        signaling_url: &str,
        peer_id: PeerId,
        retry: RetryPolicy,
    ) -> Result<Arc<Self>, TransportError> {
        let url = websocket_url(signaling_url, &peer_id)?;
        let stream = dial(&url).await?;
        info!(target = "swapline::signaling", url = %url, peer_id = %peer_id, "signaling connected");

        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(SignalingEvent::Connected);

        let connected = Arc::new(AtomicBool::new(true));
        let supervisor = tokio::spawn(supervise(
            url,
            peer_id.clone(),
            stream,
            send_rx,
            events_tx,
            retry,
            connected.clone(),
        ));

        Ok(Arc::new(Self {
            peer_id,
            send_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connected,
            tasks: Mutex::new(vec![supervisor]),
        }))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The inbound event stream. Handed out once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().take()
    }

    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn queue(&self, message: WireMessage) {
        match serde_json::to_string(&message) {
            Ok(text) => {
                if self.send_tx.send(text).is_err() {
                    debug!(target = "swapline::signaling", to = %message.to(), "signaling writer gone; frame dropped");
                }
            }
            Err(err) => warn!(target = "swapline::signaling", error = %err, "failed to encode signaling frame"),
        }
    }
}

impl Signaler for SignalingClient {
    fn send_offer(&self, to: &PeerId, sdp: &str) {
        self.queue(WireMessage::Offer {
            from: self.peer_id.clone(),
            to: to.clone(),
            payload: SessionDescription::offer(sdp),
        });
    }

    fn send_answer(&self, to: &PeerId, sdp: &str) {
        self.queue(WireMessage::Answer {
            from: self.peer_id.clone(),
            to: to.clone(),
            payload: SessionDescription::answer(sdp),
        });
    }

    fn send_ice_candidate(&self, to: &PeerId, candidate: &IceCandidate) {
        self.queue(WireMessage::IceCandidate {
            from: self.peer_id.clone(),
            to: to.clone(),
            payload: candidate.clone(),
        });
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Relay URL with the local id appended as `peer_id`; `http(s)` is mapped
/// onto `ws(s)`.
pub fn websocket_url(base: &str, peer_id: &PeerId) -> Result<Url, TransportError> {
    let mut url = Url::parse(base)
        .map_err(|err| TransportError::Signaling(format!("invalid signaling url {base}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TransportError::Signaling(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Signaling(format!("cannot use scheme {scheme} for {base}")))?;
    url.query_pairs_mut().append_pair("peer_id", peer_id.as_str());
    Ok(url)
}

/// Turn one inbound text frame into an event for `local`. Frames that do not
/// parse, carry the wrong description type, or target another peer yield
/// `None`.
pub fn decode_frame(text: &str, local: &PeerId) -> Option<SignalingEvent> {
    let message = match serde_json::from_str::<WireMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(target = "swapline::signaling", error = %err, len = text.len(), "dropping unrecognised signaling frame");
            return None;
        }
    };
    if message.to() != local {
        trace!(target = "swapline::signaling", to = %message.to(), "frame addressed to another peer");
        return None;
    }
    match message {
        WireMessage::Offer { from, payload, .. } if payload.kind == SdpKind::Offer => {
            Some(SignalingEvent::OfferReceived { from, sdp: payload.sdp })
        }
        WireMessage::Answer { from, payload, .. } if payload.kind == SdpKind::Answer => {
            Some(SignalingEvent::AnswerReceived { from, sdp: payload.sdp })
        }
        WireMessage::IceCandidate { from, payload, .. } => Some(SignalingEvent::IceCandidateReceived {
            from,
            candidate: payload,
        }),
        other => {
            debug!(target = "swapline::signaling", frame = ?other, "description type does not match envelope");
            None
        }
    }
}

async fn dial(url: &Url) -> Result<WsStream, TransportError> {
    let (stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| TransportError::Signaling(format!("websocket connect failed: {err}")))?;
    Ok(stream)
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

async fn supervise(
    url: Url,
    peer_id: PeerId,
    initial: WsStream,
    mut send_rx: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    retry: RetryPolicy,
    connected: Arc<AtomicBool>,
) {
    let mut stream = Some(initial);
    let mut retries = 0u32;
    loop {
        if let Some(ws) = stream.take() {
            connected.store(true, Ordering::SeqCst);
            retries = 0;
            match run_session(ws, &peer_id, &mut send_rx, &events_tx).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost(reason) => {
                    connected.store(false, Ordering::SeqCst);
                    warn!(target = "swapline::signaling", reason = %reason, "signaling connection lost");
                    let _ = events_tx.send(SignalingEvent::Disconnected { reason });
                }
            }
        }

        retries += 1;
        if !retry.allows(retries) {
            warn!(target = "swapline::signaling", attempts = retries - 1, "giving up on signaling relay");
            let _ = events_tx.send(SignalingEvent::Disconnected {
                reason: "reconnect attempts exhausted".into(),
            });
            break;
        }
        tokio::time::sleep(retry.delay()).await;
        match dial(&url).await {
            Ok(ws) => {
                info!(target = "swapline::signaling", attempt = retries, "signaling reconnected");
                let _ = events_tx.send(SignalingEvent::Connected);
                stream = Some(ws);
            }
            Err(err) => {
                debug!(target = "swapline::signaling", attempt = retries, error = %err, "signaling redial failed");
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

async fn run_session(
    ws: WsStream,
    local: &PeerId,
    send_rx: &mut mpsc::UnboundedReceiver<String>,
    events_tx: &mpsc::UnboundedSender<SignalingEvent>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            outbound = send_rx.recv() => match outbound {
                Some(text) => {
                    trace!(target = "swapline::signaling", event = "ws_out", len = text.len());
                    if let Err(err) = write.send(Message::Text(text)).await {
                        return SessionEnd::Lost(format!("write failed: {err}"));
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    trace!(target = "swapline::signaling", event = "ws_in", len = text.len());
                    if let Some(event) = decode_frame(&text, local) {
                        if events_tx.send(event).is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(event) = std::str::from_utf8(&data).ok().and_then(|text| decode_frame(text, local)) {
                        if events_tx.send(event).is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => return SessionEnd::Lost("closed by relay".into()),
                Some(Ok(_)) => {}
                Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                None => return SessionEnd::Lost("stream ended".into()),
            },
            _ = heartbeat.tick() => {
                if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                    return SessionEnd::Lost(format!("heartbeat failed: {err}"));
                }
            }
        }
    }
}
