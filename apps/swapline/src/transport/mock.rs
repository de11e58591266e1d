//! Scripted in-memory RTC backend.
//!
//! Sessions record every call made against them and let a test drive ICE
//! state, incoming channels and inbound frames by hand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::rtc::{
    ChannelPayload, IceState, RtcDataChannel, RtcEventSender, RtcSession, RtcSessionEvent,
    RtcSessionFactory,
};
use super::signaling::Signaler;
use super::{IceCandidate, LinkStats, PeerId, SessionDescription, TransportError};
use crate::config::ConnectionConfig;

#[derive(Default)]
pub struct MockRtcFactory {
    sessions: Mutex<Vec<Arc<MockSession>>>,
    opened: AtomicUsize,
    open_delay: Mutex<Option<Duration>>,
    auto_open_channels: AtomicBool,
    relay_only_seen: AtomicBool,
}

impl MockRtcFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Data channels created locally report open right away.
    pub fn with_open_channels() -> Arc<Self> {
        let factory = Self::default();
        factory.auto_open_channels.store(true, Ordering::SeqCst);
        Arc::new(factory)
    }

    /// Make `open` yield for a while so concurrent callers overlap.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn relay_only_seen(&self) -> bool {
        self.relay_only_seen.load(Ordering::SeqCst)
    }

    /// Most recent session opened for `peer`.
    pub fn session(&self, peer: &PeerId) -> Option<Arc<MockSession>> {
        self.sessions
            .lock()
            .iter()
            .rev()
            .find(|session| &session.peer == peer)
            .cloned()
    }
}

#[async_trait]
impl RtcSessionFactory for MockRtcFactory {
    async fn open(
        &self,
        peer: &PeerId,
        config: &ConnectionConfig,
        events: RtcEventSender,
    ) -> Result<Arc<dyn RtcSession>, TransportError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if config.turn_relay_only {
            self.relay_only_seen.store(true, Ordering::SeqCst);
        }
        let delay = *self.open_delay.lock();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        let session = Arc::new(MockSession {
            peer: peer.clone(),
            events,
            log: Mutex::new(SessionLog::default()),
            channels: Mutex::new(Vec::new()),
            auto_open: self.auto_open_channels.load(Ordering::SeqCst),
            stats: Mutex::new(LinkStats::default()),
            stats_reads: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fail_remote: AtomicBool::new(false),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

/// Calls observed by a [`MockSession`].
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    /// One entry per `create_offer`, holding the ice-restart flag.
    pub offers: Vec<bool>,
    pub answers: usize,
    pub local: Vec<SessionDescription>,
    pub remote: Vec<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
}

pub struct MockSession {
    peer: PeerId,
    events: RtcEventSender,
    log: Mutex<SessionLog>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    auto_open: bool,
    stats: Mutex<LinkStats>,
    stats_reads: AtomicUsize,
    closed: AtomicBool,
    fail_remote: AtomicBool,
}

impl MockSession {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn log(&self) -> SessionLog {
        self.log.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: RtcSessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_ice_state(&self, state: IceState) {
        self.emit(RtcSessionEvent::IceState(state));
    }

    pub fn set_stats(&self, stats: LinkStats) {
        *self.stats.lock() = stats;
    }

    /// How many times the connection polled link stats.
    pub fn stats_reads(&self) -> usize {
        self.stats_reads.load(Ordering::SeqCst)
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|channel| channel.label == label)
            .cloned()
    }

    /// Simulate the remote side opening a channel towards us.
    pub fn announce_channel(&self, label: &str) -> Arc<MockChannel> {
        let channel = MockChannel::new(label, self.events.clone());
        channel.open.store(true, Ordering::SeqCst);
        self.channels.lock().push(channel.clone());
        self.emit(RtcSessionEvent::IncomingChannel(channel.clone()));
        channel
    }

    /// Simulate an inbound text frame on `label`.
    pub fn deliver_text(&self, label: &str, text: impl Into<String>) {
        self.emit(RtcSessionEvent::Message {
            label: label.to_string(),
            payload: ChannelPayload::Text(text.into()),
        });
    }
}

#[async_trait]
impl RtcSession for MockSession {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let mut log = self.log.lock();
        log.offers.push(ice_restart);
        Ok(SessionDescription::offer(format!(
            "v=0 mock-offer {} #{}{}",
            self.peer,
            log.offers.len(),
            if ice_restart { " ice-restart" } else { "" }
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let mut log = self.log.lock();
        log.answers += 1;
        Ok(SessionDescription::answer(format!(
            "v=0 mock-answer {} #{}",
            self.peer, log.answers
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.log.lock().local.push(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(TransportError::Signaling("remote description rejected".into()));
        }
        tokio::task::yield_now().await;
        self.log.lock().remote.push(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut log = self.log.lock();
        if log.remote.is_empty() {
            return Err(TransportError::Signaling(
                "candidate added before remote description".into(),
            ));
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn RtcDataChannel>, TransportError> {
        tokio::task::yield_now().await;
        let channel = MockChannel::new(label, self.events.clone());
        self.channels.lock().push(channel.clone());
        if self.auto_open {
            channel.open();
        }
        Ok(channel)
    }

    async fn stats(&self) -> LinkStats {
        self.stats_reads.fetch_add(1, Ordering::SeqCst);
        *self.stats.lock()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<ChannelPayload>>,
    events: RtcEventSender,
}

impl MockChannel {
    fn new(label: &str, events: RtcEventSender) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(RtcSessionEvent::ChannelOpen(self.label.clone()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<ChannelPayload> {
        self.sent.lock().clone()
    }

    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|payload| payload.as_text().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl RtcDataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.label.clone()));
        }
        let len = text.len();
        self.sent.lock().push(ChannelPayload::Text(text));
        Ok(len)
    }

    async fn send_binary(&self, data: Bytes) -> Result<usize, TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.label.clone()));
        }
        let len = data.len();
        self.sent.lock().push(ChannelPayload::Binary(data));
        Ok(len)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(RtcSessionEvent::ChannelClosed(self.label.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Offer { to: PeerId, sdp: String },
    Answer { to: PeerId, sdp: String },
    Candidate { to: PeerId, candidate: IceCandidate },
}

/// Signaler that keeps everything it is asked to send.
#[derive(Default)]
pub struct RecordingSignaler {
    sent: Mutex<Vec<Outbound>>,
}

impl RecordingSignaler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().clone()
    }

    pub fn offers_to(&self, peer: &PeerId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                Outbound::Offer { to, sdp } if to == peer => Some(sdp.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn answers_to(&self, peer: &PeerId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|message| match message {
                Outbound::Answer { to, sdp } if to == peer => Some(sdp.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Signaler for RecordingSignaler {
    fn send_offer(&self, to: &PeerId, sdp: &str) {
        self.sent.lock().push(Outbound::Offer {
            to: to.clone(),
            sdp: sdp.to_string(),
        });
    }

    fn send_answer(&self, to: &PeerId, sdp: &str) {
        self.sent.lock().push(Outbound::Answer {
            to: to.clone(),
            sdp: sdp.to_string(),
        });
    }

    fn send_ice_candidate(&self, to: &PeerId, candidate: &IceCandidate) {
        self.sent.lock().push(Outbound::Candidate {
            to: to.clone(),
            candidate: candidate.clone(),
        });
    }
}
