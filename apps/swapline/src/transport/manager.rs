use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use event_bus::{Event, EventBus, Subscription};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bandwidth::{BandwidthPolicy, BandwidthSettings, NetworkConditions};
use super::peer::{ConnectionState, PeerConnection, PeerEvent, PeerEventKind};
use super::rtc::RtcSessionFactory;
use super::signaling::{Signaler, SignalingEvent};
use super::{PeerId, SessionDescription, TransportError};
use crate::config::{ConnectionConfig, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    StateChanged { peer: PeerId, state: ConnectionState },
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    Reconnecting { peer: PeerId, attempt: u32 },
    PeerFailed { peer: PeerId },
    PeerClosed { peer: PeerId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagerEventKind {
    StateChanged,
    PeerConnected,
    PeerDisconnected,
    Reconnecting,
    PeerFailed,
    PeerClosed,
}

impl Event for ManagerEvent {
    type Kind = ManagerEventKind;

    fn kind(&self) -> ManagerEventKind {
        match self {
            ManagerEvent::StateChanged { .. } => ManagerEventKind::StateChanged,
            ManagerEvent::PeerConnected { .. } => ManagerEventKind::PeerConnected,
            ManagerEvent::PeerDisconnected { .. } => ManagerEventKind::PeerDisconnected,
            ManagerEvent::Reconnecting { .. } => ManagerEventKind::Reconnecting,
            ManagerEvent::PeerFailed { .. } => ManagerEventKind::PeerFailed,
            ManagerEvent::PeerClosed { .. } => ManagerEventKind::PeerClosed,
        }
    }
}

/// Point-in-time view over every tracked connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionHealth {
    pub total: usize,
    pub connecting: usize,
    pub connected: usize,
    pub disconnected: usize,
    pub failed: usize,
    pub connects: u64,
    pub disconnects: u64,
    pub reconnect_attempts: u64,
    pub failures: u64,
}

#[derive(Default)]
struct HealthCounters {
    connects: AtomicU64,
    disconnects: AtomicU64,
    reconnect_attempts: AtomicU64,
    failures: AtomicU64,
}

#[derive(Default)]
struct PeerSlot {
    connection: OnceCell<Arc<PeerConnection>>,
    offered: OnceCell<()>,
    initiator: AtomicBool,
    reconnecting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeerSlot {
    fn abort_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Registry of peer connections keyed by peer id. Sole owner of every
/// `PeerConnection` it hands out.
pub struct ConnectionManager {
    config: ConnectionConfig,
    signaler: Arc<dyn Signaler>,
    factory: Arc<dyn RtcSessionFactory>,
    slots: Mutex<HashMap<PeerId, Arc<PeerSlot>>>,
    /// Starting settings for new connections. Samplers adjust each
    /// connection's own copy.
    bandwidth: BandwidthSettings,
    counters: Arc<HealthCounters>,
    events: Arc<EventBus<ManagerEvent>>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        signaler: Arc<dyn Signaler>,
        factory: Arc<dyn RtcSessionFactory>,
    ) -> Arc<Self> {
        let conditions = NetworkConditions {
            save_data: config.save_data,
            ..NetworkConditions::default()
        };
        let bandwidth = BandwidthPolicy::compute(&conditions, config.turn_relay_only);
        Arc::new(Self {
            config,
            signaler,
            factory,
            slots: Mutex::new(HashMap::new()),
            bandwidth,
            counters: Arc::new(HealthCounters::default()),
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn data_channel_label(&self) -> &str {
        &self.config.data_channel_label
    }

    pub fn current_bandwidth(&self) -> BandwidthSettings {
        self.bandwidth
    }

    pub fn subscribe(&self) -> Subscription<ManagerEvent> {
        self.events.subscribe_all()
    }

    pub fn subscribe_kind(&self, kind: ManagerEventKind) -> Subscription<ManagerEvent> {
        self.events.subscribe(kind)
    }

    fn slot(&self, peer: &PeerId) -> Arc<PeerSlot> {
        self.slots.lock().entry(peer.clone()).or_default().clone()
    }

    /// Slot for `peer`, retiring one whose connection already failed so the
    /// peer can be dialled or answered again.
    async fn live_slot(&self, peer: &PeerId) -> Arc<PeerSlot> {
        loop {
            let slot = self.slot(peer);
            let terminal = slot
                .connection
                .get()
                .is_some_and(|connection| connection.state().is_terminal());
            if !terminal {
                return slot;
            }
            debug!(target = "swapline::manager", peer_id = %peer, "replacing failed connection");
            self.retire(peer, &slot).await;
        }
    }

    /// Stop the slot's tasks, close its connection, then drop it from the
    /// registry if it is still the current one.
    async fn retire(&self, peer: &PeerId, slot: &Arc<PeerSlot>) -> bool {
        slot.abort_tasks();
        if let Some(connection) = slot.connection.get() {
            connection.close().await;
        }
        let removed = {
            let mut slots = self.slots.lock();
            let current = slots.get(peer).is_some_and(|current| Arc::ptr_eq(current, slot));
            if current {
                slots.remove(peer);
            }
            current
        };
        if removed {
            self.events.publish(ManagerEvent::PeerClosed { peer: peer.clone() });
        }
        removed
    }

    pub fn get_connection(&self, peer: &PeerId) -> Option<Arc<PeerConnection>> {
        let slot = self.slots.lock().get(peer).cloned()?;
        slot.connection.get().cloned()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.slots
            .lock()
            .iter()
            .filter(|(_, slot)| slot.connection.initialized())
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Existing connection for `peer`, or a fresh one. Concurrent callers for
    /// the same peer share one construction. A failed connection is closed
    /// and replaced.
    pub async fn create_connection(&self, peer: &PeerId) -> Result<Arc<PeerConnection>, TransportError> {
        let slot = self.live_slot(peer).await;
        self.connection_in(&slot, peer).await
    }

    async fn connection_in(
        &self,
        slot: &Arc<PeerSlot>,
        peer: &PeerId,
    ) -> Result<Arc<PeerConnection>, TransportError> {
        let result = slot
            .connection
            .get_or_try_init(|| self.open_connection(slot, peer))
            .await
            .cloned();
        if result.is_err() {
            let mut slots = self.slots.lock();
            let stale = slots
                .get(peer)
                .is_some_and(|current| Arc::ptr_eq(current, slot) && !slot.connection.initialized());
            if stale {
                slots.remove(peer);
            }
        }
        result
    }

    async fn open_connection(
        &self,
        slot: &Arc<PeerSlot>,
        peer: &PeerId,
    ) -> Result<Arc<PeerConnection>, TransportError> {
        let connection = PeerConnection::open(
            peer.clone(),
            self.factory.as_ref(),
            &self.config,
            self.current_bandwidth(),
        )
        .await?;

        let candidates = connection.subscribe(PeerEventKind::LocalCandidate);
        let states = connection.subscribe(PeerEventKind::StateChanged);

        let forwarder = tokio::spawn(forward_candidates(
            peer.clone(),
            candidates,
            self.signaler.clone(),
        ));
        let watcher = tokio::spawn(watch_states(
            connection.clone(),
            states,
            Arc::downgrade(slot),
            self.signaler.clone(),
            self.config.reconnect,
            self.counters.clone(),
            self.events.clone(),
        ));
        let sampler = tokio::spawn(sample_bandwidth(
            connection.clone(),
            self.config.bandwidth_sample_interval(),
            self.config.save_data,
            self.config.turn_relay_only,
        ));
        slot.tasks.lock().extend([forwarder, watcher, sampler]);

        info!(target = "swapline::manager", peer_id = %peer, "peer connection registered");
        Ok(connection)
    }

    /// Create if needed, then offer. A second concurrent `connect` for the
    /// same peer waits on the first one's offer instead of sending another.
    pub async fn connect(&self, peer: &PeerId) -> Result<Arc<PeerConnection>, TransportError> {
        let slot = self.live_slot(peer).await;
        let connection = self.connection_in(&slot, peer).await?;
        slot.offered
            .get_or_try_init(|| async {
                slot.initiator.store(true, Ordering::SeqCst);
                connection
                    .create_data_channel(&self.config.data_channel_label)
                    .await?;
                let offer = connection.create_offer().await?;
                connection.set_local_description(offer.clone()).await?;
                self.signaler.send_offer(peer, &offer.sdp);
                info!(target = "swapline::manager", peer_id = %peer, "offer sent");
                Ok::<(), TransportError>(())
            })
            .await?;
        Ok(connection)
    }

    /// Close and then forget the connection. Returns false when nothing was
    /// tracked for `peer`.
    pub async fn close_connection(&self, peer: &PeerId) -> bool {
        let tracked = self.slots.lock().get(peer).cloned();
        let Some(slot) = tracked else {
            return false;
        };
        self.retire(peer, &slot).await;
        true
    }

    pub async fn close_all_connections(&self) {
        let peers: Vec<PeerId> = self.slots.lock().keys().cloned().collect();
        join_all(peers.iter().map(|peer| self.close_connection(peer))).await;
        info!(target = "swapline::manager", closed = peers.len(), "all connections closed");
    }

    /// Send `data` on `label` to every peer whose channel is open. Returns
    /// how many peers it reached.
    pub async fn broadcast(&self, label: &str, data: &str) -> usize {
        let connections: Vec<_> = self
            .slots
            .lock()
            .values()
            .filter_map(|slot| slot.connection.get().cloned())
            .collect();
        let mut delivered = 0;
        for connection in connections {
            match connection.send_string(label, data).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!(
                    target = "swapline::manager",
                    peer_id = %connection.peer_id(),
                    error = %err,
                    "broadcast skipped peer"
                ),
            }
        }
        delivered
    }

    pub fn health(&self) -> ConnectionHealth {
        let mut health = ConnectionHealth {
            connects: self.counters.connects.load(Ordering::Relaxed),
            disconnects: self.counters.disconnects.load(Ordering::Relaxed),
            reconnect_attempts: self.counters.reconnect_attempts.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            ..ConnectionHealth::default()
        };
        for slot in self.slots.lock().values() {
            let Some(connection) = slot.connection.get() else {
                continue;
            };
            health.total += 1;
            match connection.state() {
                ConnectionState::New | ConnectionState::Connecting => health.connecting += 1,
                ConnectionState::Connected => health.connected += 1,
                ConnectionState::Disconnected => health.disconnected += 1,
                ConnectionState::Failed => health.failed += 1,
                ConnectionState::Closed => {}
            }
        }
        health
    }

    pub async fn handle_signaling_event(&self, event: SignalingEvent) -> Result<(), TransportError> {
        match event {
            SignalingEvent::OfferReceived { from, sdp } => {
                let connection = self.create_connection(&from).await?;
                connection
                    .set_remote_description(SessionDescription::offer(sdp))
                    .await?;
                let answer = connection.create_answer().await?;
                connection.set_local_description(answer.clone()).await?;
                self.signaler.send_answer(&from, &answer.sdp);
                debug!(target = "swapline::manager", peer_id = %from, "answer sent");
            }
            SignalingEvent::AnswerReceived { from, sdp } => match self.get_connection(&from) {
                Some(connection) => {
                    connection
                        .set_remote_description(SessionDescription::answer(sdp))
                        .await?;
                }
                None => {
                    debug!(target = "swapline::manager", peer_id = %from, "answer for unknown peer dropped");
                }
            },
            SignalingEvent::IceCandidateReceived { from, candidate } => match self.get_connection(&from) {
                Some(connection) => connection.add_ice_candidate(candidate).await?,
                None => {
                    debug!(target = "swapline::manager", peer_id = %from, "candidate for unknown peer dropped");
                }
            },
            SignalingEvent::Connected => {
                info!(target = "swapline::manager", "signaling relay available");
            }
            SignalingEvent::Disconnected { reason } => {
                warn!(target = "swapline::manager", reason = %reason, "signaling relay unavailable");
            }
        }
        Ok(())
    }

    /// Process signaling events one at a time, in arrival order.
    pub fn spawn_signaling_router(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(err) = manager.handle_signaling_event(event).await {
                    warn!(target = "swapline::manager", error = %err, "signaling event failed");
                }
            }
            debug!(target = "swapline::manager", "signaling router stopped");
        })
    }
}

async fn forward_candidates(
    peer: PeerId,
    mut candidates: Subscription<PeerEvent>,
    signaler: Arc<dyn Signaler>,
) {
    while let Some(event) = candidates.next().await {
        if let PeerEvent::LocalCandidate { candidate, .. } = event {
            signaler.send_ice_candidate(&peer, &candidate);
        }
    }
}

async fn watch_states(
    connection: Arc<PeerConnection>,
    mut states: Subscription<PeerEvent>,
    slot: Weak<PeerSlot>,
    signaler: Arc<dyn Signaler>,
    policy: RetryPolicy,
    counters: Arc<HealthCounters>,
    events: Arc<EventBus<ManagerEvent>>,
) {
    while let Some(event) = states.next().await {
        let PeerEvent::StateChanged { peer, current, .. } = event else {
            continue;
        };
        events.publish(ManagerEvent::StateChanged {
            peer: peer.clone(),
            state: current,
        });
        match current {
            ConnectionState::Connected => {
                counters.connects.fetch_add(1, Ordering::Relaxed);
                events.publish(ManagerEvent::PeerConnected { peer });
            }
            ConnectionState::Disconnected => {
                counters.disconnects.fetch_add(1, Ordering::Relaxed);
                events.publish(ManagerEvent::PeerDisconnected { peer: peer.clone() });
                let Some(slot) = slot.upgrade() else {
                    continue;
                };
                if slot.reconnecting.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let initiator = slot.initiator.load(Ordering::SeqCst);
                let task = tokio::spawn(recover(
                    connection.clone(),
                    Arc::downgrade(&slot),
                    signaler.clone(),
                    policy,
                    initiator,
                    counters.clone(),
                    events.clone(),
                ));
                slot.tasks.lock().push(task);
            }
            ConnectionState::Failed => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(target = "swapline::manager", peer_id = %peer, "peer connection failed");
                events.publish(ManagerEvent::PeerFailed { peer });
            }
            _ => {}
        }
    }
}

/// ICE-restart loop for a dropped connection. Only the side that made the
/// original offer re-offers; the answering side waits out the same window.
async fn recover(
    connection: Arc<PeerConnection>,
    slot: Weak<PeerSlot>,
    signaler: Arc<dyn Signaler>,
    policy: RetryPolicy,
    initiator: bool,
    counters: Arc<HealthCounters>,
    events: Arc<EventBus<ManagerEvent>>,
) {
    let peer = connection.peer_id().clone();
    let mut connected = connection.subscribe(PeerEventKind::Connected);

    for attempt in 1..=policy.max_retries {
        tokio::time::sleep(policy.delay()).await;
        if connection.is_closed() {
            return finish_recovery(&slot);
        }
        if connection.state() == ConnectionState::Connected {
            info!(target = "swapline::manager", peer_id = %peer, attempt, "peer recovered");
            return finish_recovery(&slot);
        }

        counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        events.publish(ManagerEvent::Reconnecting {
            peer: peer.clone(),
            attempt,
        });
        if initiator {
            match connection.restart_ice().await {
                Ok(offer) => signaler.send_offer(&peer, &offer.sdp),
                Err(err) => {
                    warn!(target = "swapline::manager", peer_id = %peer, attempt, error = %err, "ice restart failed");
                    continue;
                }
            }
        }

        let window = Duration::from_millis(policy.delay_ms.max(1));
        match tokio::time::timeout(window, connected.next()).await {
            Ok(Some(_)) => {
                info!(target = "swapline::manager", peer_id = %peer, attempt, "peer reconnected");
                return finish_recovery(&slot);
            }
            Ok(None) => return finish_recovery(&slot),
            Err(_) => {}
        }
    }

    if connection.state() != ConnectionState::Connected && !connection.is_closed() {
        warn!(
            target = "swapline::manager",
            peer_id = %peer,
            attempts = policy.max_retries,
            "reconnect attempts exhausted"
        );
        connection.mark_failed();
    }
    finish_recovery(&slot);
}

fn finish_recovery(slot: &Weak<PeerSlot>) {
    if let Some(slot) = slot.upgrade() {
        slot.reconnecting.store(false, Ordering::SeqCst);
    }
}

async fn sample_bandwidth(
    connection: Arc<PeerConnection>,
    interval: Duration,
    save_data: bool,
    turn_relay_only: bool,
) {
    let mut policy = BandwidthPolicy::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if connection.is_closed() {
            break;
        }
        if connection.state() != ConnectionState::Connected {
            continue;
        }
        let stats = connection.stats().await;
        let conditions = NetworkConditions::from_stats(&stats, save_data);
        if let Some(settings) = policy.recompute(&conditions, turn_relay_only) {
            connection.apply_bandwidth(settings);
        }
    }
}
