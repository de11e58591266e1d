//! Order handling and the two-party PSBT exchange that settles a trade.

pub mod engine;
pub mod order;
pub mod protocol;
pub mod responder;
pub mod state;
pub mod wallet;

pub use engine::{TradeEvent, TradeEventKind, TradeExecutionEngine, TradeResult};
pub use order::{Order, OrderBook, OrderBookError, OrderError, OrderFilter, OrderManager, OrderParams, OrderStatus, Side};
pub use protocol::{TradeChannel, TradeMessage};
pub use responder::TradeResponder;
pub use state::TradeExecutionState;
pub use wallet::{PsbtEnvelope, PsbtInput, PsbtOutput, TradeFunding, Wallet, WalletError};
