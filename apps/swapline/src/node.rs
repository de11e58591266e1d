//! Wires signaling, the connection manager and the trade layer for one
//! local peer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::trade::{OrderBook, OrderManager, TradeChannel, TradeExecutionEngine, TradeResponder, Wallet};
use crate::transport::manager::ManagerEventKind;
use crate::transport::rtc::{RtcSessionFactory, WebRtcSessionFactory};
use crate::transport::{ConnectionManager, ManagerEvent, PeerConnection, PeerId, SignalingClient, TransportError};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct SwapNode {
    config: NodeConfig,
    peer_id: PeerId,
    signaling: Arc<SignalingClient>,
    manager: Arc<ConnectionManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SwapNode {
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        Self::start_with(config, Arc::new(WebRtcSessionFactory::new())).await
    }

    /// Start with a caller-supplied session factory.
    pub async fn start_with(config: NodeConfig, factory: Arc<dyn RtcSessionFactory>) -> Result<Self, NodeError> {
        config.validate()?;
        let peer_id = config
            .peer_id
            .clone()
            .map(PeerId::new)
            .unwrap_or_else(PeerId::random);

        let signaling = SignalingClient::connect(
            &config.signaling_url,
            peer_id.clone(),
            config.connection.signaling_retry,
        )
        .await?;
        let manager = ConnectionManager::new(config.connection.clone(), signaling.clone(), factory);

        let mut tasks = Vec::new();
        if let Some(events) = signaling.events() {
            tasks.push(manager.spawn_signaling_router(events));
        }
        info!(target = "swapline::node", peer_id = %peer_id, url = %config.signaling_url, "node started");

        Ok(Self {
            config,
            peer_id,
            signaling,
            manager,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn signaling(&self) -> &Arc<SignalingClient> {
        &self.signaling
    }

    pub async fn connect(&self, peer: &PeerId) -> Result<Arc<PeerConnection>, TransportError> {
        self.manager.connect(peer).await
    }

    pub fn trade_channel(&self) -> Arc<dyn TradeChannel> {
        self.manager.clone()
    }

    pub fn trade_engine(&self, wallet: Arc<dyn Wallet>, orders: Arc<dyn OrderBook>) -> TradeExecutionEngine {
        TradeExecutionEngine::new(wallet, orders, self.trade_channel(), self.config.trade)
    }

    pub fn order_manager(&self, orders: Arc<dyn OrderBook>) -> OrderManager {
        OrderManager::new(orders, self.peer_id.clone())
    }

    pub fn responder(&self, wallet: Arc<dyn Wallet>, orders: Arc<dyn OrderBook>) -> Arc<TradeResponder> {
        Arc::new(TradeResponder::new(
            wallet,
            orders,
            self.trade_channel(),
            self.peer_id.clone(),
        ))
    }

    /// Attach `responder` to every peer that connects from now on.
    pub fn serve_trades(&self, responder: Arc<TradeResponder>) {
        let mut connected = self.manager.subscribe_kind(ManagerEventKind::PeerConnected);
        let task = tokio::spawn(async move {
            let mut serving: HashMap<PeerId, JoinHandle<()>> = HashMap::new();
            while let Some(event) = connected.next().await {
                let ManagerEvent::PeerConnected { peer } = event else {
                    continue;
                };
                serving.retain(|_, task| !task.is_finished());
                if serving.contains_key(&peer) {
                    continue;
                }
                match responder.serve(peer.clone()) {
                    Ok(task) => {
                        serving.insert(peer, task);
                    }
                    Err(err) => {
                        warn!(target = "swapline::node", peer_id = %peer, error = %err, "cannot serve trades")
                    }
                }
            }
            for task in serving.into_values() {
                task.abort();
            }
            debug!(target = "swapline::node", "trade serving stopped");
        });
        self.tasks.lock().push(task);
    }

    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        self.manager.close_all_connections().await;
        self.signaling.close();
        info!(target = "swapline::node", peer_id = %self.peer_id, "node stopped");
    }
}
