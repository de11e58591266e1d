use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use event_bus::{Event, EventBus, Subscription};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::order::{Order, OrderBook, OrderStatus, parse_positive};
use super::protocol::{TradeChannel, TradeInbound, TradeMessage};
use super::state::TradeExecutionState;
use super::wallet::{PsbtEnvelope, Wallet, WalletError};
use crate::config::TradeConfig;
use crate::error::ErrorReport;
use crate::transport::PeerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeEvent {
    StateChanged {
        previous: TradeExecutionState,
        current: TradeExecutionState,
    },
    Error(ErrorReport),
    Progress {
        state: TradeExecutionState,
        percent: u8,
        message: String,
    },
    Completed {
        trade_id: Uuid,
        txid: String,
        psbt: PsbtEnvelope,
    },
    Cancelled {
        trade_id: Option<Uuid>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeEventKind {
    StateChanged,
    Error,
    Progress,
    Completed,
    Cancelled,
}

impl Event for TradeEvent {
    type Kind = TradeEventKind;

    fn kind(&self) -> TradeEventKind {
        match self {
            TradeEvent::StateChanged { .. } => TradeEventKind::StateChanged,
            TradeEvent::Error(_) => TradeEventKind::Error,
            TradeEvent::Progress { .. } => TradeEventKind::Progress,
            TradeEvent::Completed { .. } => TradeEventKind::Completed,
            TradeEvent::Cancelled { .. } => TradeEventKind::Cancelled,
        }
    }
}

/// Outcome of `execute_trade` or `broadcast`. Check `success`; errors are
/// reported here, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeResult {
    pub success: bool,
    pub state: TradeExecutionState,
    pub trade_id: Option<Uuid>,
    pub psbt: Option<PsbtEnvelope>,
    pub txid: Option<String>,
    pub error: Option<ErrorReport>,
}

#[derive(Debug)]
struct TradeSlot {
    state: TradeExecutionState,
    trade_id: Option<Uuid>,
    order: Option<Order>,
    psbt: Option<PsbtEnvelope>,
    txid: Option<String>,
    error: Option<ErrorReport>,
    started: bool,
    running: bool,
}

impl Default for TradeSlot {
    fn default() -> Self {
        Self {
            state: TradeExecutionState::Initialized,
            trade_id: None,
            order: None,
            psbt: None,
            txid: None,
            error: None,
            started: false,
            running: false,
        }
    }
}

impl TradeSlot {
    fn result(&self, error: Option<ErrorReport>) -> TradeResult {
        let error = error.or_else(|| self.error.clone());
        TradeResult {
            success: error.is_none()
                && matches!(
                    self.state,
                    TradeExecutionState::CounterpartySigned | TradeExecutionState::Completed
                ),
            state: self.state,
            trade_id: self.trade_id,
            psbt: self.psbt.clone(),
            txid: self.txid.clone(),
            error,
        }
    }
}

/// Why a run stopped early.
enum Halt {
    Cancelled,
    Failed(ErrorReport),
}

impl From<ErrorReport> for Halt {
    fn from(report: ErrorReport) -> Self {
        Halt::Failed(report)
    }
}

impl From<WalletError> for Halt {
    fn from(err: WalletError) -> Self {
        Halt::Failed(err.into())
    }
}

/// Drives a single trade from PSBT creation to counterparty co-signature
/// and, optionally, broadcast. One instance runs one trade; `reset` before
/// starting another.
pub struct TradeExecutionEngine {
    wallet: Arc<dyn Wallet>,
    orders: Arc<dyn OrderBook>,
    channel: Arc<dyn TradeChannel>,
    config: TradeConfig,
    current: Mutex<TradeSlot>,
    cancel: watch::Sender<bool>,
    events: EventBus<TradeEvent>,
}

impl TradeExecutionEngine {
    pub fn new(
        wallet: Arc<dyn Wallet>,
        orders: Arc<dyn OrderBook>,
        channel: Arc<dyn TradeChannel>,
        config: TradeConfig,
    ) -> Self {
        Self {
            wallet,
            orders,
            channel,
            config,
            current: Mutex::new(TradeSlot::default()),
            cancel: watch::Sender::new(false),
            events: EventBus::new(),
        }
    }

    pub fn config(&self) -> &TradeConfig {
        &self.config
    }

    pub fn state(&self) -> TradeExecutionState {
        self.current.lock().state
    }

    pub fn trade_id(&self) -> Option<Uuid> {
        self.current.lock().trade_id
    }

    pub fn psbt(&self) -> Option<PsbtEnvelope> {
        self.current.lock().psbt.clone()
    }

    pub fn order(&self) -> Option<Order> {
        self.current.lock().order.clone()
    }

    pub fn last_error(&self) -> Option<ErrorReport> {
        self.current.lock().error.clone()
    }

    pub fn subscribe(&self) -> Subscription<TradeEvent> {
        self.events.subscribe_all()
    }

    pub fn subscribe_kind(&self, kind: TradeEventKind) -> Subscription<TradeEvent> {
        self.events.subscribe(kind)
    }

    pub async fn execute_trade(&self, order_id: &str, amount: &str) -> TradeResult {
        let trade_id = {
            let mut slot = self.current.lock();
            if slot.started || slot.state != TradeExecutionState::Initialized {
                return slot.result(Some(ErrorReport::validation(
                    "engine already holds a trade; reset it before starting another",
                )));
            }
            let trade_id = Uuid::new_v4();
            slot.started = true;
            slot.running = true;
            slot.trade_id = Some(trade_id);
            trade_id
        };
        info!(target = "swapline::trade", %trade_id, order_id, amount, "trade started");

        match self.run(trade_id, order_id, amount).await {
            Ok(()) => {}
            Err(Halt::Cancelled) => {
                info!(target = "swapline::trade", %trade_id, "trade stopped after cancellation");
            }
            Err(Halt::Failed(report)) => self.fail(report),
        }
        self.finish()
    }

    async fn run(&self, trade_id: Uuid, order_id: &str, amount: &str) -> Result<(), Halt> {
        let amount = parse_positive("amount", amount).map_err(ErrorReport::validation)?;
        let order = self.fetch_order(order_id).await?;
        validate_order(&order, amount)?;
        {
            let mut slot = self.current.lock();
            if slot.state == TradeExecutionState::Cancelled {
                return Err(Halt::Cancelled);
            }
            slot.order = Some(order.clone());
        }

        self.transition(TradeExecutionState::CreatingPsbt)?;
        if !self.wallet.is_connected().await {
            return Err(WalletError::NotConnected.into());
        }
        let funding = self.wallet.fund_trade(&order, amount).await?;
        let base64 = self
            .wallet
            .create_psbt(&funding.inputs, &funding.outputs)
            .await?;
        let created = PsbtEnvelope {
            base64,
            inputs: funding.inputs,
            outputs: funding.outputs,
            fee: funding.fee,
        };
        self.advance(TradeExecutionState::PsbtCreated, |slot| {
            slot.psbt = Some(created.clone());
        })?;

        self.transition(TradeExecutionState::SigningPsbt)?;
        let signed = created.with_base64(self.wallet.sign_psbt(&created.base64).await?);
        self.advance(TradeExecutionState::PsbtSigned, |slot| {
            slot.psbt = Some(signed.clone());
        })?;

        self.transition(TradeExecutionState::SendingToCounterparty)?;
        let inbox = self.channel.subscribe(&order.maker).map_err(|err| {
            ErrorReport::network(format!("no channel to maker {}: {err}", order.maker))
        })?;
        let offer = TradeMessage::PsbtOffer {
            trade_id,
            order_id: order.id.clone(),
            amount,
            price: order.price,
            psbt: signed.clone(),
        };
        self.retrying("sending offer to counterparty", || {
            self.channel.send(&order.maker, &offer)
        })
        .await?;

        self.transition(TradeExecutionState::WaitingForCounterparty)?;
        let countersigned = self
            .wait_for_counterparty(inbox, trade_id, &order.maker, &signed)
            .await?;
        self.advance(TradeExecutionState::CounterpartySigned, |slot| {
            slot.psbt = Some(countersigned.clone());
        })?;
        info!(target = "swapline::trade", %trade_id, "counterparty signature received");

        if self.config.broadcast_immediately {
            self.broadcast_signed(trade_id, countersigned).await?;
        }
        Ok(())
    }

    async fn fetch_order(&self, order_id: &str) -> Result<Order, Halt> {
        if order_id.trim().is_empty() {
            return Err(ErrorReport::validation("order id is empty").into());
        }
        self.retrying("fetching order", || self.orders.get_order(order_id))
            .await?
            .ok_or_else(|| ErrorReport::validation(format!("order {order_id} not found")).into())
    }

    /// Run `op` up to `retry_count + 1` times. Exhaustion is a network error.
    async fn retrying<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, Halt>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let policy = self.config.retry_policy();
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    retry += 1;
                    if !policy.allows(retry) {
                        return Err(ErrorReport::network(format!(
                            "{what} failed after {} attempts: {err}",
                            policy.total_attempts()
                        ))
                        .into());
                    }
                    warn!(target = "swapline::trade", retry, error = %err, "{what} failed; retrying");
                    tokio::time::sleep(policy.delay()).await;
                    if self.state() == TradeExecutionState::Cancelled {
                        return Err(Halt::Cancelled);
                    }
                }
            }
        }
    }

    /// Block until the maker answers this trade, the deadline passes, or the
    /// trade is cancelled. Messages about other trades are skipped.
    async fn wait_for_counterparty(
        &self,
        mut inbox: mpsc::UnboundedReceiver<TradeInbound>,
        trade_id: Uuid,
        maker: &PeerId,
        local: &PsbtEnvelope,
    ) -> Result<PsbtEnvelope, Halt> {
        let mut cancel = self.cancel.subscribe();
        let deadline = tokio::time::sleep(self.config.timeout());
        tokio::pin!(deadline);

        loop {
            if *cancel.borrow_and_update() {
                return Err(Halt::Cancelled);
            }
            tokio::select! {
                _ = &mut deadline => {
                    return Err(ErrorReport::timeout(format!(
                        "counterparty {maker} did not respond within {}ms",
                        self.config.timeout_ms
                    ))
                    .into());
                }
                changed = cancel.changed() => {
                    if changed.is_err() {
                        return Err(Halt::Cancelled);
                    }
                }
                inbound = inbox.recv() => match inbound {
                    None => {
                        return Err(ErrorReport::network(format!("channel to {maker} closed")).into());
                    }
                    Some(Err(err)) => {
                        return Err(ErrorReport::counterparty(err.to_string()).into());
                    }
                    Some(Ok(TradeMessage::PsbtSigned { trade_id: id, psbt })) if id == trade_id => {
                        psbt.validate().map_err(|err| {
                            ErrorReport::counterparty(format!("counterparty sent an unusable psbt: {err}"))
                        })?;
                        if psbt.base64 == local.base64 {
                            return Err(ErrorReport::counterparty(
                                "counterparty returned the psbt without signing it",
                            )
                            .into());
                        }
                        return Ok(psbt);
                    }
                    Some(Ok(TradeMessage::PsbtRejected { trade_id: id, reason })) if id == trade_id => {
                        return Err(ErrorReport::counterparty(format!("counterparty rejected the trade: {reason}")).into());
                    }
                    Some(Ok(other)) => {
                        debug!(target = "swapline::trade", %trade_id, other = %other.trade_id(), "ignoring unrelated trade message");
                    }
                }
            }
        }
    }

    /// Broadcast a trade left in `CounterpartySigned`.
    pub async fn broadcast(&self) -> TradeResult {
        let pending = {
            let mut slot = self.current.lock();
            match (slot.state, slot.trade_id, slot.psbt.clone()) {
                (TradeExecutionState::CounterpartySigned, Some(trade_id), Some(psbt)) if !slot.running => {
                    slot.running = true;
                    (trade_id, psbt)
                }
                _ => {
                    return slot.result(Some(ErrorReport::validation(
                        "no counterparty-signed trade waiting for broadcast",
                    )));
                }
            }
        };
        let (trade_id, psbt) = pending;
        match self.broadcast_signed(trade_id, psbt).await {
            Ok(()) | Err(Halt::Cancelled) => {}
            Err(Halt::Failed(report)) => self.fail(report),
        }
        self.finish()
    }

    async fn broadcast_signed(&self, trade_id: Uuid, psbt: PsbtEnvelope) -> Result<(), Halt> {
        self.transition(TradeExecutionState::Broadcasting)?;
        let tx_hex = self.wallet.extract_tx(&psbt.base64).await?;
        if hex::decode(tx_hex.trim()).is_err() {
            return Err(WalletError::Backend("extracted transaction is not hex".into()).into());
        }
        let txid = self.wallet.broadcast_tx(tx_hex.trim()).await?;
        self.current.lock().txid = Some(txid.clone());
        info!(target = "swapline::trade", %trade_id, %txid, "transaction broadcast");

        self.transition(TradeExecutionState::Completed)?;
        self.events.publish(TradeEvent::Completed {
            trade_id,
            txid,
            psbt,
        });
        Ok(())
    }

    /// Stop the trade unless it already finished. In-flight wallet calls are
    /// not interrupted; nothing after them runs.
    pub fn cancel_trade(&self) -> bool {
        {
            let mut slot = self.current.lock();
            let previous = slot.state;
            if previous.is_terminal() {
                return false;
            }
            slot.state = TradeExecutionState::Cancelled;
            self.events.publish(TradeEvent::StateChanged {
                previous,
                current: TradeExecutionState::Cancelled,
            });
            self.events.publish(TradeEvent::Cancelled {
                trade_id: slot.trade_id,
            });
            info!(target = "swapline::trade", trade_id = ?slot.trade_id, ?previous, "trade cancelled");
        }
        self.cancel.send_replace(true);
        true
    }

    /// Forget the current trade. Refused while a run is in progress.
    pub fn reset(&self) -> bool {
        {
            let mut slot = self.current.lock();
            if slot.running {
                return false;
            }
            let previous = slot.state;
            *slot = TradeSlot::default();
            if previous != TradeExecutionState::Initialized {
                self.events.publish(TradeEvent::StateChanged {
                    previous,
                    current: TradeExecutionState::Initialized,
                });
            }
        }
        self.cancel.send_replace(false);
        true
    }

    fn transition(&self, next: TradeExecutionState) -> Result<(), Halt> {
        self.advance(next, |_| {})
    }

    /// The single mutation point for trade state. `update` runs under the
    /// same lock as the state change.
    fn advance(&self, next: TradeExecutionState, update: impl FnOnce(&mut TradeSlot)) -> Result<(), Halt> {
        let mut slot = self.current.lock();
        let previous = slot.state;
        if previous == TradeExecutionState::Cancelled {
            return Err(Halt::Cancelled);
        }
        if !previous.can_transition_to(next) {
            return Err(ErrorReport::unknown(format!(
                "illegal trade transition {previous:?} -> {next:?}"
            ))
            .into());
        }
        slot.state = next;
        update(&mut slot);
        debug!(target = "swapline::trade", trade_id = ?slot.trade_id, ?previous, current = ?next, "trade state");
        self.events.publish(TradeEvent::StateChanged {
            previous,
            current: next,
        });
        self.events.publish(TradeEvent::Progress {
            state: next,
            percent: next.percent(),
            message: next.describe().to_string(),
        });
        Ok(())
    }

    fn fail(&self, report: ErrorReport) {
        let mut slot = self.current.lock();
        let previous = slot.state;
        if previous.is_terminal() {
            debug!(target = "swapline::trade", ?previous, error = %report, "error after trade ended");
            return;
        }
        slot.state = TradeExecutionState::Failed;
        slot.error = Some(report.clone());
        warn!(target = "swapline::trade", trade_id = ?slot.trade_id, ?previous, error = %report, "trade failed");
        self.events.publish(TradeEvent::StateChanged {
            previous,
            current: TradeExecutionState::Failed,
        });
        self.events.publish(TradeEvent::Error(report));
    }

    fn finish(&self) -> TradeResult {
        let mut slot = self.current.lock();
        slot.running = false;
        slot.result(None)
    }
}

/// Checks against the fetched order that need no I/O.
fn validate_order(order: &Order, amount: Decimal) -> Result<(), ErrorReport> {
    if order.price <= Decimal::ZERO {
        return Err(ErrorReport::validation(format!(
            "order {} has non-positive price {}",
            order.id, order.price
        )));
    }
    if order.amount <= Decimal::ZERO {
        return Err(ErrorReport::validation(format!(
            "order {} has non-positive amount {}",
            order.id, order.amount
        )));
    }
    if order.status != OrderStatus::Open {
        return Err(ErrorReport::validation(format!(
            "order {} is {:?}",
            order.id, order.status
        )));
    }
    if amount > order.amount {
        return Err(ErrorReport::validation(format!(
            "amount {amount} exceeds order size {}",
            order.amount
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::trade::order::Side;
    use rust_decimal_macros::dec;
    use time::OffsetDateTime;

    fn order(price: Decimal, status: OrderStatus) -> Order {
        Order {
            id: "order-1".into(),
            side: Side::Buy,
            base_asset: "BTC".into(),
            quote_asset: "RUNE1".into(),
            amount: dec!(1.0),
            price,
            maker: PeerId::new("maker"),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            status,
        }
    }

    #[test]
    fn order_checks_reject_bad_snapshots() {
        assert!(validate_order(&order(dec!(0.0001), OrderStatus::Open), dec!(0.5)).is_ok());
        let negative = validate_order(&order(dec!(-50000), OrderStatus::Open), dec!(0.5)).unwrap_err();
        assert_eq!(negative.kind, ErrorKind::Validation);
        assert!(validate_order(&order(dec!(0.0001), OrderStatus::Filled), dec!(0.5)).is_err());
        assert!(validate_order(&order(dec!(0.0001), OrderStatus::Open), dec!(1.5)).is_err());
    }

    #[test]
    fn result_success_requires_signed_state_and_no_error() {
        let mut slot = TradeSlot {
            state: TradeExecutionState::CounterpartySigned,
            ..TradeSlot::default()
        };
        assert!(slot.result(None).success);
        slot.state = TradeExecutionState::WaitingForCounterparty;
        assert!(!slot.result(None).success);
        slot.state = TradeExecutionState::Completed;
        assert!(!slot.result(Some(ErrorReport::validation("busy"))).success);
    }
}
