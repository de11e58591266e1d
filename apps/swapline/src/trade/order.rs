use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

use crate::error::{ErrorKind, ErrorReport};
use crate::transport::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Expired,
}

/// Read-only snapshot of an order as published by the order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub side: Side,
    pub base_asset: String,
    pub quote_asset: String,
    pub amount: Decimal,
    pub price: Decimal,
    pub maker: PeerId,
    #[serde(with = "time::serde::timestamp")]
    pub timestamp: OffsetDateTime,
    pub status: OrderStatus,
}

/// Order as submitted for listing; the book assigns id, timestamp and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub side: Side,
    pub base_asset: String,
    pub quote_asset: String,
    pub amount: Decimal,
    pub price: Decimal,
    pub maker: PeerId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFilter {
    pub side: Option<Side>,
    pub base_asset: Option<String>,
    pub quote_asset: Option<String>,
    pub status: Option<OrderStatus>,
    pub maker: Option<PeerId>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.side.is_none_or(|side| side == order.side)
            && self
                .base_asset
                .as_deref()
                .is_none_or(|asset| asset.eq_ignore_ascii_case(&order.base_asset))
            && self
                .quote_asset
                .as_deref()
                .is_none_or(|asset| asset.eq_ignore_ascii_case(&order.quote_asset))
            && self.status.is_none_or(|status| status == order.status)
            && self.maker.as_ref().is_none_or(|maker| maker == &order.maker)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderBookError {
    #[error("order book unavailable: {0}")]
    Unavailable(String),
    #[error("order {0} not found")]
    NotFound(String),
    #[error("order book rejected request: {0}")]
    Rejected(String),
}

/// External order-matching service. The core only reads from it, apart from
/// forwarding user-initiated create and cancel requests.
#[async_trait]
pub trait OrderBook: Send + Sync {
    async fn get_order(&self, id: &str) -> Result<Option<Order>, OrderBookError>;
    async fn create_order(&self, order: NewOrder) -> Result<String, OrderBookError>;
    async fn cancel_order(&self, id: &str) -> Result<(), OrderBookError>;
    async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, OrderBookError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderError {
    #[error("{0}")]
    Validation(String),
    #[error("order {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Book(#[from] OrderBookError),
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::Validation(_) | OrderError::NotFound(_) => ErrorKind::Validation,
            OrderError::Book(OrderBookError::Rejected(_)) => ErrorKind::Validation,
            OrderError::Book(_) => ErrorKind::Network,
        }
    }
}

impl From<OrderError> for ErrorReport {
    fn from(err: OrderError) -> Self {
        ErrorReport::new(err.kind(), err.to_string())
    }
}

/// User input for a new listing, amounts as typed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParams {
    pub side: Side,
    pub base_asset: String,
    pub quote_asset: String,
    pub amount: String,
    pub price: String,
}

pub(crate) fn parse_positive(field: &str, raw: &str) -> Result<Decimal, String> {
    let value = Decimal::from_str(raw.trim()).map_err(|_| format!("{field} {raw:?} is not a number"))?;
    if value <= Decimal::ZERO {
        return Err(format!("{field} must be positive, got {raw}"));
    }
    Ok(value)
}

/// Validates order requests for the local maker before they reach the book.
pub struct OrderManager {
    book: Arc<dyn OrderBook>,
    local: PeerId,
}

impl OrderManager {
    pub fn new(book: Arc<dyn OrderBook>, local: PeerId) -> Self {
        Self { book, local }
    }

    pub async fn create_order(&self, params: OrderParams) -> Result<String, OrderError> {
        let base_asset = params.base_asset.trim();
        let quote_asset = params.quote_asset.trim();
        if base_asset.is_empty() || quote_asset.is_empty() {
            return Err(OrderError::Validation("both assets are required".into()));
        }
        if base_asset.eq_ignore_ascii_case(quote_asset) {
            return Err(OrderError::Validation(format!(
                "cannot trade {base_asset} against itself"
            )));
        }
        let amount = parse_positive("amount", &params.amount).map_err(OrderError::Validation)?;
        let price = parse_positive("price", &params.price).map_err(OrderError::Validation)?;

        let id = self
            .book
            .create_order(NewOrder {
                side: params.side,
                base_asset: base_asset.to_string(),
                quote_asset: quote_asset.to_string(),
                amount,
                price,
                maker: self.local.clone(),
            })
            .await?;
        info!(order_id = %id, side = ?params.side, %amount, %price, "order listed");
        Ok(id)
    }

    /// Only the local maker's open orders can be cancelled.
    pub async fn cancel_order(&self, id: &str) -> Result<(), OrderError> {
        let order = self.get_order(id).await?;
        if order.maker != self.local {
            return Err(OrderError::Validation(format!(
                "order {id} belongs to {}",
                order.maker
            )));
        }
        if order.status != OrderStatus::Open {
            return Err(OrderError::Validation(format!(
                "order {id} is {:?}, not open",
                order.status
            )));
        }
        self.book.cancel_order(id).await?;
        info!(order_id = %id, "order cancelled");
        Ok(())
    }

    pub async fn get_order(&self, id: &str) -> Result<Order, OrderError> {
        if id.trim().is_empty() {
            return Err(OrderError::Validation("order id is empty".into()));
        }
        self.book
            .get_order(id)
            .await?
            .ok_or_else(|| OrderError::NotFound(id.to_string()))
    }

    pub async fn get_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, OrderError> {
        Ok(self.book.get_orders(filter).await?)
    }
}
