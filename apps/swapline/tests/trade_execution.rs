use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use event_bus::Subscription;
use rust_decimal_macros::dec;
use swapline_core::config::TradeConfig;
use swapline_core::error::ErrorKind;
use swapline_core::testkit::{FakeOrderBook, FakeWallet, MemoryTradeHub, WalletOp, sample_order};
use swapline_core::trade::{
    OrderStatus, TradeChannel, TradeEvent, TradeEventKind, TradeExecutionEngine, TradeExecutionState,
    TradeMessage, TradeResponder, WalletError,
};
use swapline_core::transport::PeerId;

struct Fixture {
    hub: Arc<MemoryTradeHub>,
    book: Arc<FakeOrderBook>,
    wallet: Arc<FakeWallet>,
    maker_wallet: Arc<FakeWallet>,
    engine: Arc<TradeExecutionEngine>,
}

fn config() -> TradeConfig {
    TradeConfig {
        timeout_ms: 2_000,
        retry_count: 2,
        retry_delay_ms: 10,
        broadcast_immediately: false,
    }
}

fn fixture(config: TradeConfig) -> Fixture {
    let hub = MemoryTradeHub::new();
    let book = FakeOrderBook::with_orders([sample_order("order-1", "maker")]);
    let wallet = FakeWallet::new("taker");
    let engine = Arc::new(TradeExecutionEngine::new(
        wallet.clone(),
        book.clone(),
        hub.endpoint("taker"),
        config,
    ));
    Fixture {
        hub,
        book,
        wallet,
        maker_wallet: FakeWallet::new("maker"),
        engine,
    }
}

impl Fixture {
    /// Start answering offers on the maker side.
    fn serve_maker(&self) {
        let responder = Arc::new(TradeResponder::new(
            self.maker_wallet.clone(),
            self.book.clone(),
            self.hub.endpoint("maker"),
            PeerId::new("maker"),
        ));
        responder.serve(PeerId::new("taker")).unwrap();
    }
}

fn drain(events: &mut Subscription<TradeEvent>) -> Vec<TradeEvent> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn states(events: &[TradeEvent]) -> Vec<TradeExecutionState> {
    events
        .iter()
        .filter_map(|event| match event {
            TradeEvent::StateChanged { current, .. } => Some(*current),
            _ => None,
        })
        .collect()
}

async fn wait_for_state(events: &mut Subscription<TradeEvent>, target: TradeExecutionState) {
    while let Some(event) = events.next().await {
        if matches!(event, TradeEvent::StateChanged { current, .. } if current == target) {
            return;
        }
    }
    panic!("trade never reached {target:?}");
}

#[test_timeout::tokio_timeout_test]
async fn negative_amount_is_rejected_before_the_wallet() {
    let fx = fixture(config());
    let mut errors = fx.engine.subscribe_kind(TradeEventKind::Error);

    let result = fx.engine.execute_trade("order-1", "-1.0").await;

    assert!(!result.success);
    assert_eq!(result.state, TradeExecutionState::Failed);
    assert_eq!(result.error.as_ref().map(|error| error.kind), Some(ErrorKind::Validation));
    assert!(fx.wallet.calls().is_empty());
    assert!(matches!(errors.next().await, Some(TradeEvent::Error(report)) if report.kind == ErrorKind::Validation));
}

#[test_timeout::tokio_timeout_test]
async fn negative_order_price_is_rejected_before_the_wallet() {
    let fx = fixture(config());
    let mut order = sample_order("order-neg", "maker");
    order.price = dec!(-50000);
    fx.book.insert(order);

    let result = fx.engine.execute_trade("order-neg", "0.5").await;

    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Validation));
    assert_eq!(fx.wallet.count(WalletOp::CreatePsbt), 0);
    assert_eq!(fx.wallet.count(WalletOp::FundTrade), 0);
}

#[test_timeout::tokio_timeout_test]
async fn oversized_and_closed_orders_fail_validation() {
    let fx = fixture(config());
    let result = fx.engine.execute_trade("order-1", "1.5").await;
    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Validation));

    let fx = fixture(config());
    fx.book.set_status("order-1", OrderStatus::Filled);
    let result = fx.engine.execute_trade("order-1", "0.5").await;
    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Validation));

    let fx = fixture(config());
    let result = fx.engine.execute_trade("order-404", "0.5").await;
    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Validation));
    assert!(fx.wallet.calls().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn counterparty_signature_completes_the_exchange() {
    let fx = fixture(config());
    fx.serve_maker();
    let mut events = fx.engine.subscribe();

    let result = fx.engine.execute_trade("order-1", "0.5").await;

    assert!(result.success, "trade failed: {:?}", result.error);
    assert_eq!(result.state, TradeExecutionState::CounterpartySigned);
    assert!(result.txid.is_none());
    let psbt = result.psbt.expect("co-signed psbt");
    let raw = String::from_utf8_lossy(&STANDARD.decode(&psbt.base64).unwrap()).into_owned();
    assert!(raw.ends_with(";sig=taker;sig=maker"), "unexpected psbt body {raw}");
    assert_eq!(psbt.outputs[0].value, 5_000);

    let seen = drain(&mut events);
    assert_eq!(
        states(&seen),
        vec![
            TradeExecutionState::CreatingPsbt,
            TradeExecutionState::PsbtCreated,
            TradeExecutionState::SigningPsbt,
            TradeExecutionState::PsbtSigned,
            TradeExecutionState::SendingToCounterparty,
            TradeExecutionState::WaitingForCounterparty,
            TradeExecutionState::CounterpartySigned,
        ]
    );
    let percents: Vec<u8> = seen
        .iter()
        .filter_map(|event| match event {
            TradeEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|pair| pair[0] < pair[1]));

    let sent = fx.hub.sent();
    assert_eq!(sent.len(), 2);
    assert!(matches!(&sent[0].message, TradeMessage::PsbtOffer { order_id, amount, .. } if order_id == "order-1" && *amount == dec!(0.5)));
    assert!(matches!(sent[1].message, TradeMessage::PsbtSigned { .. }));
    assert_eq!(sent[0].message.trade_id(), result.trade_id.unwrap());
    assert_eq!(fx.wallet.count(WalletOp::BroadcastTx), 0);
}

#[test_timeout::tokio_timeout_test]
async fn immediate_broadcast_completes_and_cannot_be_cancelled() {
    let fx = fixture(TradeConfig {
        broadcast_immediately: true,
        ..config()
    });
    fx.serve_maker();
    let mut completed = fx.engine.subscribe_kind(TradeEventKind::Completed);

    let result = fx.engine.execute_trade("order-1", "0.25").await;

    assert!(result.success);
    assert_eq!(result.state, TradeExecutionState::Completed);
    let txid = result.txid.expect("txid");
    assert_eq!(txid.len(), 64);
    assert!(matches!(completed.next().await, Some(TradeEvent::Completed { txid: sent, .. }) if sent == txid));

    assert!(!fx.engine.cancel_trade());
    assert_eq!(fx.engine.state(), TradeExecutionState::Completed);
}

#[test_timeout::tokio_timeout_test]
async fn explicit_broadcast_follows_counterparty_signature() {
    let fx = fixture(config());
    fx.serve_maker();

    let early = fx.engine.broadcast().await;
    assert_eq!(early.error.map(|error| error.kind), Some(ErrorKind::Validation));
    assert_eq!(early.state, TradeExecutionState::Initialized);

    let signed = fx.engine.execute_trade("order-1", "0.5").await;
    assert_eq!(signed.state, TradeExecutionState::CounterpartySigned);

    let result = fx.engine.broadcast().await;
    assert!(result.success);
    assert_eq!(result.state, TradeExecutionState::Completed);
    assert!(result.txid.is_some());
    assert_eq!(fx.wallet.count(WalletOp::ExtractTx), 1);
    assert_eq!(fx.wallet.count(WalletOp::BroadcastTx), 1);
}

#[test_timeout::tokio_timeout_test]
async fn cancelling_while_waiting_stops_the_trade() {
    let fx = fixture(config());
    let mut events = fx.engine.subscribe();
    let mut cancelled = fx.engine.subscribe_kind(TradeEventKind::Cancelled);

    let engine = fx.engine.clone();
    let run = tokio::spawn(async move { engine.execute_trade("order-1", "0.5").await });
    wait_for_state(&mut events, TradeExecutionState::WaitingForCounterparty).await;

    assert!(fx.engine.cancel_trade());
    assert!(!fx.engine.cancel_trade());
    let result = run.await.unwrap();

    assert!(!result.success);
    assert_eq!(result.state, TradeExecutionState::Cancelled);
    assert!(result.error.is_none());
    assert!(matches!(cancelled.next().await, Some(TradeEvent::Cancelled { trade_id }) if trade_id == result.trade_id));
    assert!(matches!(cancelled.try_recv(), Ok(None)));
}

#[test_timeout::tokio_timeout_test]
async fn cancelling_during_signing_discards_the_signature() {
    let fx = fixture(config());
    fx.wallet.set_sign_delay(Duration::from_millis(50));
    let mut events = fx.engine.subscribe();

    let engine = fx.engine.clone();
    let run = tokio::spawn(async move { engine.execute_trade("order-1", "0.5").await });
    wait_for_state(&mut events, TradeExecutionState::SigningPsbt).await;
    assert!(fx.engine.cancel_trade());

    let result = run.await.unwrap();
    assert_eq!(result.state, TradeExecutionState::Cancelled);
    assert_eq!(fx.wallet.count(WalletOp::SignPsbt), 1);
    assert!(fx.hub.sent().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn signing_failure_is_a_wallet_error() {
    let fx = fixture(config());
    fx.wallet.fail(WalletOp::SignPsbt, WalletError::Rejected("user declined".into()));

    let result = fx.engine.execute_trade("order-1", "0.5").await;

    assert_eq!(result.state, TradeExecutionState::Failed);
    let error = result.error.expect("error");
    assert_eq!(error.kind, ErrorKind::Wallet);
    assert!(error.message.contains("user declined"));
    assert!(fx.hub.sent().is_empty());
    assert_eq!(fx.engine.last_error(), Some(error));
}

#[test_timeout::tokio_timeout_test]
async fn disconnected_wallet_fails_before_funding() {
    let fx = fixture(config());
    fx.wallet.set_connected(false);

    let result = fx.engine.execute_trade("order-1", "0.5").await;

    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Wallet));
    assert_eq!(fx.wallet.count(WalletOp::FundTrade), 0);
}

#[tokio::test(start_paused = true)]
async fn silent_counterparty_times_out() {
    let fx = fixture(TradeConfig::default());

    let result = fx.engine.execute_trade("order-1", "0.5").await;

    assert_eq!(result.state, TradeExecutionState::Failed);
    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Timeout));
}

#[test_timeout::tokio_timeout_test]
async fn counterparty_rejection_is_reported() {
    let fx = fixture(config());
    let maker_book = FakeOrderBook::with_orders([sample_order("order-1", "maker")]);
    maker_book.set_status("order-1", OrderStatus::Filled);
    let responder = Arc::new(TradeResponder::new(
        fx.maker_wallet.clone(),
        maker_book,
        fx.hub.endpoint("maker"),
        PeerId::new("maker"),
    ));
    responder.serve(PeerId::new("taker")).unwrap();

    let result = fx.engine.execute_trade("order-1", "0.5").await;

    let error = result.error.expect("error");
    assert_eq!(error.kind, ErrorKind::Counterparty);
    assert!(error.message.contains("Filled"));
    assert_eq!(fx.maker_wallet.count(WalletOp::SignPsbt), 0);
}

#[test_timeout::tokio_timeout_test]
async fn unsigned_echo_is_not_a_signature() {
    let fx = fixture(config());
    let maker = fx.hub.endpoint("maker");
    let mut inbox = maker.subscribe(&PeerId::new("taker")).unwrap();
    tokio::spawn(async move {
        while let Some(Ok(message)) = inbox.recv().await {
            if let TradeMessage::PsbtOffer { trade_id, psbt, .. } = message {
                let echo = TradeMessage::PsbtSigned { trade_id, psbt };
                maker.send(&PeerId::new("taker"), &echo).await.unwrap();
            }
        }
    });

    let result = fx.engine.execute_trade("order-1", "0.5").await;

    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Counterparty));
}

#[test_timeout::tokio_timeout_test]
async fn unreachable_order_book_is_a_network_error() {
    let fx = fixture(config());
    fx.book.fail_next_gets(10);

    let result = fx.engine.execute_trade("order-1", "0.5").await;

    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Network));
    assert_eq!(fx.book.get_calls(), 3);
    assert!(fx.wallet.calls().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn transient_failures_are_retried() {
    let fx = fixture(config());
    fx.serve_maker();
    fx.book.fail_next_gets(2);
    fx.hub.fail_next_sends(2);

    let result = fx.engine.execute_trade("order-1", "0.5").await;

    assert!(result.success, "trade failed: {:?}", result.error);
    // three lookups by the taker, one by the maker
    assert_eq!(fx.book.get_calls(), 4);
}

#[test_timeout::tokio_timeout_test]
async fn exhausted_sends_are_a_network_error() {
    let fx = fixture(config());
    fx.hub.fail_next_sends(3);

    let result = fx.engine.execute_trade("order-1", "0.5").await;

    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Network));
    assert!(fx.hub.sent().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn lost_channel_while_waiting_is_a_network_error() {
    let fx = fixture(config());
    let mut events = fx.engine.subscribe();

    let engine = fx.engine.clone();
    let run = tokio::spawn(async move { engine.execute_trade("order-1", "0.5").await });
    wait_for_state(&mut events, TradeExecutionState::WaitingForCounterparty).await;
    fx.hub.set_offline("maker", true);

    let result = run.await.unwrap();
    assert_eq!(result.error.map(|error| error.kind), Some(ErrorKind::Network));
}

#[test_timeout::tokio_timeout_test]
async fn engine_runs_one_trade_until_reset() {
    let fx = fixture(config());
    fx.serve_maker();

    let first = fx.engine.execute_trade("order-1", "0.5").await;
    assert!(first.success);

    let busy = fx.engine.execute_trade("order-1", "0.1").await;
    assert!(!busy.success);
    assert_eq!(busy.error.map(|error| error.kind), Some(ErrorKind::Validation));
    assert_eq!(busy.state, TradeExecutionState::CounterpartySigned);
    assert_eq!(fx.engine.state(), TradeExecutionState::CounterpartySigned);

    assert!(fx.engine.reset());
    assert_eq!(fx.engine.state(), TradeExecutionState::Initialized);
    assert!(fx.engine.trade_id().is_none());

    let second = fx.engine.execute_trade("order-1", "0.1").await;
    assert!(second.success);
    assert_ne!(second.trade_id, first.trade_id);
}
