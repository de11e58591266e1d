use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use event_bus::{Event, EventBus, Subscription};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::bandwidth::BandwidthSettings;
use super::rtc::{
    ChannelPayload, IceState, RtcDataChannel, RtcSession, RtcSessionEvent, RtcSessionFactory,
};
use super::{IceCandidate, LinkStats, PeerId, SessionDescription, TransportError};
use crate::config::ConnectionConfig;

const PEER_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Connecting)
            | (Connecting, Connected)
            | (Connecting, Failed)
            | (Connected, Disconnected)
            | (Disconnected, Connecting)
            | (Disconnected, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    /// Legal path from `self` to `target`, excluding `self`. Empty when the
    /// target cannot be reached.
    fn path_to(self, target: ConnectionState) -> Vec<ConnectionState> {
        use ConnectionState::*;
        if self.can_transition_to(target) {
            return vec![target];
        }
        match (self, target) {
            (New, Connected) | (Disconnected, Connected) => vec![Connecting, Connected],
            (New, Failed) => vec![Connecting, Failed],
            (Connected, Failed) => vec![Disconnected, Failed],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged {
        peer: PeerId,
        previous: ConnectionState,
        current: ConnectionState,
    },
    Connected {
        peer: PeerId,
    },
    Disconnected {
        peer: PeerId,
    },
    LocalCandidate {
        peer: PeerId,
        candidate: IceCandidate,
    },
    ChannelOpened {
        peer: PeerId,
        label: String,
    },
    ChannelClosed {
        peer: PeerId,
        label: String,
    },
    Message {
        peer: PeerId,
        label: String,
        payload: ChannelPayload,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    StateChanged,
    Connected,
    Disconnected,
    LocalCandidate,
    ChannelOpened,
    ChannelClosed,
    Message,
}

impl Event for PeerEvent {
    type Kind = PeerEventKind;

    fn kind(&self) -> PeerEventKind {
        match self {
            PeerEvent::StateChanged { .. } => PeerEventKind::StateChanged,
            PeerEvent::Connected { .. } => PeerEventKind::Connected,
            PeerEvent::Disconnected { .. } => PeerEventKind::Disconnected,
            PeerEvent::LocalCandidate { .. } => PeerEventKind::LocalCandidate,
            PeerEvent::ChannelOpened { .. } => PeerEventKind::ChannelOpened,
            PeerEvent::ChannelClosed { .. } => PeerEventKind::ChannelClosed,
            PeerEvent::Message { .. } => PeerEventKind::Message,
        }
    }
}

#[derive(Default)]
struct CandidateQueue {
    remote: Option<SessionDescription>,
    pending: Vec<IceCandidate>,
}

/// One RTC connection to one remote peer, plus the data channels riding on
/// it. Owned by the `ConnectionManager` entry for that peer.
pub struct PeerConnection {
    peer: PeerId,
    session: Arc<dyn RtcSession>,
    state: Mutex<ConnectionState>,
    closing: AtomicBool,
    channels: Mutex<HashMap<String, Arc<dyn RtcDataChannel>>>,
    channel_create: AsyncMutex<()>,
    candidates: AsyncMutex<CandidateQueue>,
    bandwidth: RwLock<BandwidthSettings>,
    next_send_slot: Mutex<Option<Instant>>,
    events: EventBus<PeerEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PeerConnection {
    pub async fn open(
        peer: PeerId,
        factory: &dyn RtcSessionFactory,
        config: &ConnectionConfig,
        bandwidth: BandwidthSettings,
    ) -> Result<Arc<Self>, TransportError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = factory.open(&peer, config, events_tx).await?;
        let connection = Arc::new(Self {
            peer,
            session,
            state: Mutex::new(ConnectionState::New),
            closing: AtomicBool::new(false),
            channels: Mutex::new(HashMap::new()),
            channel_create: AsyncMutex::new(()),
            candidates: AsyncMutex::new(CandidateQueue::default()),
            bandwidth: RwLock::new(bandwidth),
            next_send_slot: Mutex::new(None),
            events: EventBus::with_capacity(PEER_EVENT_CAPACITY),
            pump: Mutex::new(None),
        });
        let pump = tokio::spawn(run_pump(Arc::downgrade(&connection), events_rx));
        *connection.pump.lock() = Some(pump);
        Ok(connection)
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, kind: PeerEventKind) -> Subscription<PeerEvent> {
        self.events.subscribe(kind)
    }

    pub fn subscribe_all(&self) -> Subscription<PeerEvent> {
        self.events.subscribe_all()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_negotiable(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Signaling(format!(
                "connection to {} is closed",
                self.peer
            )))
        } else {
            Ok(())
        }
    }

    pub async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_negotiable()?;
        let offer = self.session.create_offer(false).await?;
        self.ensure_negotiable()?;
        Ok(offer)
    }

    pub async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_negotiable()?;
        let answer = self.session.create_answer().await?;
        self.ensure_negotiable()?;
        Ok(answer)
    }

    /// Offer with fresh ICE credentials. Moves a dropped connection back to
    /// `Connecting`.
    pub async fn restart_ice(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_negotiable()?;
        let offer = self.session.create_offer(true).await?;
        self.session.set_local_description(offer.clone()).await?;
        if self.state() == ConnectionState::Disconnected {
            self.transition(ConnectionState::Connecting);
        }
        Ok(offer)
    }

    pub async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.session.set_local_description(desc).await
    }

    /// Apply the remote offer or answer, then flush candidates that arrived
    /// early. Re-applying an identical description is a no-op.
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut queue = self.candidates.lock().await;
        if queue.remote.as_ref() == Some(&desc) {
            trace!(target = "swapline::peer", peer_id = %self.peer, "duplicate remote description ignored");
            return Ok(());
        }
        self.session.set_remote_description(desc.clone()).await?;
        queue.remote = Some(desc);

        let pending = std::mem::take(&mut queue.pending);
        if !pending.is_empty() {
            debug!(
                target = "swapline::peer",
                peer_id = %self.peer,
                count = pending.len(),
                "flushing queued ice candidates"
            );
        }
        for candidate in pending {
            if let Err(err) = self.session.add_ice_candidate(candidate).await {
                warn!(target = "swapline::peer", peer_id = %self.peer, error = %err, "queued candidate rejected");
            }
        }
        Ok(())
    }

    /// Candidates arriving before the remote description are held back and
    /// applied in arrival order once it lands.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut queue = self.candidates.lock().await;
        if queue.remote.is_none() {
            queue.pending.push(candidate);
            return Ok(());
        }
        self.session.add_ice_candidate(candidate).await
    }

    pub async fn pending_candidates(&self) -> usize {
        self.candidates.lock().await.pending.len()
    }

    /// Returns the existing channel for `label` when there is one.
    pub async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn RtcDataChannel>, TransportError> {
        self.ensure_open()?;
        let _guard = self.channel_create.lock().await;
        if let Some(existing) = self.channel(label) {
            return Ok(existing);
        }
        let created = self.session.create_data_channel(label).await?;
        let mut channels = self.channels.lock();
        Ok(channels
            .entry(label.to_string())
            .or_insert(created)
            .clone())
    }

    pub fn channel(&self, label: &str) -> Option<Arc<dyn RtcDataChannel>> {
        self.channels.lock().get(label).cloned()
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    fn open_channel(&self, label: &str) -> Result<Arc<dyn RtcDataChannel>, TransportError> {
        self.ensure_open()?;
        match self.channel(label) {
            Some(channel) if channel.is_open() => Ok(channel),
            _ => Err(TransportError::ChannelNotOpen(label.to_string())),
        }
    }

    pub async fn send_string(&self, label: &str, data: impl Into<String>) -> Result<(), TransportError> {
        let channel = self.open_channel(label)?;
        let data = data.into();
        self.pace(data.len()).await;
        channel.send_text(data).await?;
        Ok(())
    }

    pub async fn send_binary(&self, label: &str, data: impl Into<Bytes>) -> Result<(), TransportError> {
        let channel = self.open_channel(label)?;
        let data = data.into();
        self.pace(data.len()).await;
        channel.send_binary(data).await?;
        Ok(())
    }

    /// Hold outbound frames back to the `data.max` rate.
    async fn pace(&self, len: usize) {
        let kbps = self.bandwidth.read().data.max;
        if kbps == 0 || len == 0 {
            return;
        }
        let cost = Duration::from_secs_f64(len as f64 * 8.0 / (kbps as f64 * 1_000.0));
        let start = {
            let mut slot = self.next_send_slot.lock();
            let now = Instant::now();
            let start = slot.filter(|at| *at > now).unwrap_or(now);
            *slot = Some(start + cost);
            start
        };
        tokio::time::sleep_until(start).await;
    }

    pub fn apply_bandwidth(&self, settings: BandwidthSettings) {
        *self.bandwidth.write() = settings;
        debug!(
            target = "swapline::peer",
            peer_id = %self.peer,
            data_kbps = settings.data.max,
            video_kbps = settings.video.max,
            "bandwidth settings applied"
        );
    }

    pub fn bandwidth(&self) -> BandwidthSettings {
        *self.bandwidth.read()
    }

    pub async fn stats(&self) -> LinkStats {
        self.session.stats().await
    }

    /// Closes every data channel, then the connection. Safe to call more
    /// than once.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, channel)| channel).collect();
        for channel in channels {
            if let Err(err) = channel.close().await {
                debug!(target = "swapline::peer", peer_id = %self.peer, label = channel.label(), error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.session.close().await {
            debug!(target = "swapline::peer", peer_id = %self.peer, error = %err, "rtc close failed");
        }
        self.transition(ConnectionState::Closed);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.events.close();
        info!(target = "swapline::peer", peer_id = %self.peer, "connection closed");
    }

    /// Force a live connection into `Failed` after recovery gave up.
    pub fn mark_failed(&self) -> bool {
        self.advance(ConnectionState::Failed)
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        let previous = *state;
        if previous == next || !previous.can_transition_to(next) {
            return false;
        }
        *state = next;
        debug!(target = "swapline::peer", peer_id = %self.peer, ?previous, current = ?next, "connection state");
        self.events.publish(PeerEvent::StateChanged {
            peer: self.peer.clone(),
            previous,
            current: next,
        });
        match next {
            ConnectionState::Connected => {
                self.events.publish(PeerEvent::Connected { peer: self.peer.clone() });
            }
            ConnectionState::Disconnected => {
                self.events.publish(PeerEvent::Disconnected { peer: self.peer.clone() });
            }
            _ => {}
        }
        true
    }

    /// Walk the legal path towards `target`; unreachable targets are ignored.
    fn advance(&self, target: ConnectionState) -> bool {
        let path = self.state().path_to(target);
        let mut moved = false;
        for step in path {
            if !self.transition(step) {
                break;
            }
            moved = true;
        }
        moved
    }

    fn handle_session_event(&self, event: RtcSessionEvent) {
        match event {
            RtcSessionEvent::IceState(ice) => {
                let target = match ice {
                    IceState::Checking => ConnectionState::Connecting,
                    IceState::Connected | IceState::Completed => ConnectionState::Connected,
                    IceState::Disconnected => ConnectionState::Disconnected,
                    IceState::Failed => ConnectionState::Failed,
                    IceState::New | IceState::Closed => return,
                };
                if !self.advance(target) && self.state() != target {
                    trace!(target = "swapline::peer", peer_id = %self.peer, ?ice, state = ?self.state(), "ice state ignored");
                }
            }
            RtcSessionEvent::LocalCandidate(candidate) => {
                self.events.publish(PeerEvent::LocalCandidate {
                    peer: self.peer.clone(),
                    candidate,
                });
            }
            RtcSessionEvent::IncomingChannel(channel) => {
                let label = channel.label().to_string();
                let open = channel.is_open();
                self.channels.lock().entry(label.clone()).or_insert(channel);
                debug!(target = "swapline::peer", peer_id = %self.peer, label = %label, "remote data channel registered");
                if open {
                    self.events.publish(PeerEvent::ChannelOpened {
                        peer: self.peer.clone(),
                        label,
                    });
                }
            }
            RtcSessionEvent::ChannelOpen(label) => {
                self.events.publish(PeerEvent::ChannelOpened {
                    peer: self.peer.clone(),
                    label,
                });
            }
            RtcSessionEvent::ChannelClosed(label) => {
                self.events.publish(PeerEvent::ChannelClosed {
                    peer: self.peer.clone(),
                    label,
                });
            }
            RtcSessionEvent::Message { label, payload } => {
                self.events.publish(PeerEvent::Message {
                    peer: self.peer.clone(),
                    label,
                    payload,
                });
            }
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn run_pump(connection: Weak<PeerConnection>, mut events: mpsc::UnboundedReceiver<RtcSessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        if connection.is_closed() {
            break;
        }
        connection.handle_session_event(event);
    }
}
