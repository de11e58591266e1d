//! In-memory stand-ins for the wallet, order book and trade channel, used by
//! unit and integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::trade::order::{NewOrder, Order, OrderBook, OrderBookError, OrderFilter, OrderStatus, Side};
use crate::trade::protocol::{TradeChannel, TradeInbound, TradeMessage};
use crate::trade::wallet::{PSBT_MAGIC, PsbtInput, PsbtOutput, TradeFunding, Wallet, WalletError};
use crate::transport::{PeerId, TransportError};

const SATS_PER_COIN: u64 = 100_000_000;

/// An open 1.0 BTC order at 0.0001 listed by `maker`.
pub fn sample_order(id: &str, maker: &str) -> Order {
    Order {
        id: id.to_string(),
        side: Side::Buy,
        base_asset: "BTC".into(),
        quote_asset: "RUNE1".into(),
        amount: Decimal::ONE,
        price: Decimal::new(1, 4),
        maker: PeerId::new(maker),
        timestamp: OffsetDateTime::UNIX_EPOCH,
        status: OrderStatus::Open,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalletOp {
    FundTrade,
    CreatePsbt,
    SignPsbt,
    ExtractTx,
    BroadcastTx,
}

/// Wallet that builds PSBT-shaped payloads without touching a chain. Each
/// signature appends a marker naming the signer.
pub struct FakeWallet {
    signer: String,
    connected: AtomicBool,
    calls: Mutex<Vec<WalletOp>>,
    failures: Mutex<HashMap<WalletOp, WalletError>>,
    sign_delay: Mutex<Option<Duration>>,
}

impl FakeWallet {
    pub fn new(signer: &str) -> Arc<Self> {
        Arc::new(Self {
            signer: signer.to_string(),
            connected: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            sign_delay: Mutex::new(None),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail(&self, op: WalletOp, error: WalletError) {
        self.failures.lock().insert(op, error);
    }

    pub fn set_sign_delay(&self, delay: Duration) {
        *self.sign_delay.lock() = Some(delay);
    }

    pub fn calls(&self) -> Vec<WalletOp> {
        self.calls.lock().clone()
    }

    pub fn count(&self, op: WalletOp) -> usize {
        self.calls.lock().iter().filter(|call| **call == op).count()
    }

    fn record(&self, op: WalletOp) -> Result<(), WalletError> {
        self.calls.lock().push(op);
        match self.failures.lock().get(&op) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn decode(psbt: &str) -> Result<Vec<u8>, WalletError> {
        let bytes = STANDARD
            .decode(psbt)
            .map_err(|err| WalletError::InvalidPsbt(err.to_string()))?;
        if !bytes.starts_with(PSBT_MAGIC) {
            return Err(WalletError::InvalidPsbt("missing magic".into()));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl Wallet for FakeWallet {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn fund_trade(&self, order: &Order, amount: Decimal) -> Result<TradeFunding, WalletError> {
        self.record(WalletOp::FundTrade)?;
        let value = (amount * order.price * Decimal::from(SATS_PER_COIN))
            .trunc()
            .to_u64()
            .unwrap_or(0);
        Ok(TradeFunding {
            inputs: vec![PsbtInput {
                txid: "11".repeat(32),
                vout: 0,
                value: value + 10_000,
                address: Some(format!("bc1q{}", self.signer)),
            }],
            outputs: vec![PsbtOutput {
                address: format!("bc1q{}", order.maker),
                value,
            }],
            fee: Some(500),
        })
    }

    async fn create_psbt(&self, inputs: &[PsbtInput], outputs: &[PsbtOutput]) -> Result<String, WalletError> {
        self.record(WalletOp::CreatePsbt)?;
        let mut bytes = PSBT_MAGIC.to_vec();
        bytes.extend_from_slice(format!("in={};out={}", inputs.len(), outputs.len()).as_bytes());
        Ok(STANDARD.encode(bytes))
    }

    async fn sign_psbt(&self, psbt: &str) -> Result<String, WalletError> {
        self.record(WalletOp::SignPsbt)?;
        let delay = *self.sign_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut bytes = Self::decode(psbt)?;
        bytes.extend_from_slice(format!(";sig={}", self.signer).as_bytes());
        Ok(STANDARD.encode(bytes))
    }

    async fn extract_tx(&self, psbt: &str) -> Result<String, WalletError> {
        self.record(WalletOp::ExtractTx)?;
        let bytes = Self::decode(psbt)?;
        Ok(hex::encode(&bytes[PSBT_MAGIC.len()..]))
    }

    async fn broadcast_tx(&self, tx_hex: &str) -> Result<String, WalletError> {
        self.record(WalletOp::BroadcastTx)?;
        hex::decode(tx_hex).map_err(|err| WalletError::Rejected(err.to_string()))?;
        Ok(format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()))
    }
}

/// Order book held in memory. `fail_next_gets` simulates an unreachable
/// service for that many lookups.
#[derive(Default)]
pub struct FakeOrderBook {
    orders: Mutex<HashMap<String, Order>>,
    next_id: AtomicU64,
    failing_gets: AtomicUsize,
    gets: AtomicUsize,
}

impl FakeOrderBook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_orders(orders: impl IntoIterator<Item = Order>) -> Arc<Self> {
        let book = Self::default();
        for order in orders {
            book.insert(order);
        }
        Arc::new(book)
    }

    pub fn insert(&self, order: Order) {
        self.orders.lock().insert(order.id.clone(), order);
    }

    pub fn set_status(&self, id: &str, status: OrderStatus) {
        if let Some(order) = self.orders.lock().get_mut(id) {
            order.status = status;
        }
    }

    pub fn fail_next_gets(&self, count: usize) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, id: &str) -> Option<Order> {
        self.orders.lock().get(id).cloned()
    }
}

#[async_trait]
impl OrderBook for FakeOrderBook {
    async fn get_order(&self, id: &str) -> Result<Option<Order>, OrderBookError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OrderBookError::Unavailable("connection refused".into()));
        }
        Ok(self.orders.lock().get(id).cloned())
    }

    async fn create_order(&self, order: NewOrder) -> Result<String, OrderBookError> {
        let id = format!("order-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.insert(Order {
            id: id.clone(),
            side: order.side,
            base_asset: order.base_asset,
            quote_asset: order.quote_asset,
            amount: order.amount,
            price: order.price,
            maker: order.maker,
            timestamp: OffsetDateTime::now_utc(),
            status: OrderStatus::Open,
        });
        Ok(id)
    }

    async fn cancel_order(&self, id: &str) -> Result<(), OrderBookError> {
        match self.orders.lock().get_mut(id) {
            Some(order) => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            None => Err(OrderBookError::NotFound(id.to_string())),
        }
    }

    async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, OrderBookError> {
        let mut orders: Vec<Order> = self
            .orders
            .lock()
            .values()
            .filter(|order| filter.matches(order))
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(orders)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub from: PeerId,
    pub to: PeerId,
    pub message: TradeMessage,
}

#[derive(Default)]
struct HubState {
    /// Keyed by (receiver, sender).
    routes: HashMap<(PeerId, PeerId), Vec<mpsc::UnboundedSender<TradeInbound>>>,
    sent: Vec<SentMessage>,
    offline: HashSet<PeerId>,
}

/// Routes trade messages between in-process endpoints.
#[derive(Default)]
pub struct MemoryTradeHub {
    state: Mutex<HubState>,
    failing_sends: AtomicUsize,
}

impl MemoryTradeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn endpoint(self: &Arc<Self>, local: &str) -> Arc<MemoryTradeChannel> {
        Arc::new(MemoryTradeChannel {
            local: PeerId::new(local),
            hub: Arc::clone(self),
        })
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn set_offline(&self, peer: &str, offline: bool) {
        let peer = PeerId::new(peer);
        let mut state = self.state.lock();
        if offline {
            state.routes.retain(|(to, from), _| to != &peer && from != &peer);
            state.offline.insert(peer);
        } else {
            state.offline.remove(&peer);
        }
    }

    /// Push a raw frame to `to` as if `from` had sent it. Returns how many
    /// subscribers received it.
    pub fn inject(&self, from: &str, to: &str, inbound: TradeInbound) -> usize {
        self.deliver(&PeerId::new(from), &PeerId::new(to), inbound)
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, inbound: TradeInbound) -> usize {
        let mut state = self.state.lock();
        let Some(subscribers) = state.routes.get_mut(&(to.clone(), from.clone())) else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(inbound.clone()).is_ok());
        subscribers.len()
    }
}

pub struct MemoryTradeChannel {
    local: PeerId,
    hub: Arc<MemoryTradeHub>,
}

impl MemoryTradeChannel {
    pub fn local(&self) -> &PeerId {
        &self.local
    }
}

#[async_trait]
impl TradeChannel for MemoryTradeChannel {
    async fn send(&self, peer: &PeerId, message: &TradeMessage) -> Result<(), TransportError> {
        tokio::task::yield_now().await;
        let failing = self
            .hub
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::ChannelNotOpen("trade".into()));
        }
        {
            let mut state = self.hub.state.lock();
            if state.offline.contains(peer) {
                return Err(TransportError::UnknownPeer(peer.clone()));
            }
            state.sent.push(SentMessage {
                from: self.local.clone(),
                to: peer.clone(),
                message: message.clone(),
            });
        }
        self.hub.deliver(&self.local, peer, Ok(message.clone()));
        Ok(())
    }

    fn subscribe(&self, peer: &PeerId) -> Result<mpsc::UnboundedReceiver<TradeInbound>, TransportError> {
        let mut state = self.hub.state.lock();
        if state.offline.contains(peer) {
            return Err(TransportError::UnknownPeer(peer.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .routes
            .entry((self.local.clone(), peer.clone()))
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
