use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::order::{OrderBook, OrderStatus};
use super::protocol::{TradeChannel, TradeMessage};
use super::wallet::{PsbtEnvelope, Wallet};
use crate::transport::{PeerId, TransportError};

/// Maker side of the exchange: co-signs offers against the local maker's
/// open orders and answers everything else with a rejection.
pub struct TradeResponder {
    wallet: Arc<dyn Wallet>,
    orders: Arc<dyn OrderBook>,
    channel: Arc<dyn TradeChannel>,
    local: PeerId,
}

impl TradeResponder {
    pub fn new(
        wallet: Arc<dyn Wallet>,
        orders: Arc<dyn OrderBook>,
        channel: Arc<dyn TradeChannel>,
        local: PeerId,
    ) -> Self {
        Self {
            wallet,
            orders,
            channel,
            local,
        }
    }

    /// Answer offers from `peer` until its channel goes away.
    pub fn serve(self: &Arc<Self>, peer: PeerId) -> Result<JoinHandle<()>, TransportError> {
        let mut inbox = self.channel.subscribe(&peer)?;
        let responder = Arc::clone(self);
        Ok(tokio::spawn(async move {
            while let Some(inbound) = inbox.recv().await {
                let offer = match inbound {
                    Ok(message @ TradeMessage::PsbtOffer { .. }) => message,
                    Ok(other) => {
                        debug!(target = "swapline::trade", peer_id = %peer, trade_id = %other.trade_id(), "ignoring non-offer message");
                        continue;
                    }
                    Err(err) => {
                        warn!(target = "swapline::trade", peer_id = %peer, error = %err, "dropping malformed trade frame");
                        continue;
                    }
                };
                let reply = responder.respond(&peer, &offer).await;
                if let Err(err) = responder.channel.send(&peer, &reply).await {
                    warn!(target = "swapline::trade", peer_id = %peer, error = %err, "failed to answer offer");
                }
            }
            debug!(target = "swapline::trade", peer_id = %peer, "responder stopped");
        }))
    }

    /// Build the reply to one inbound message.
    pub async fn respond(&self, peer: &PeerId, message: &TradeMessage) -> TradeMessage {
        let TradeMessage::PsbtOffer {
            trade_id,
            order_id,
            amount,
            price,
            psbt,
        } = message
        else {
            return TradeMessage::PsbtRejected {
                trade_id: message.trade_id(),
                reason: "expected a psbt offer".into(),
            };
        };

        match self.cosign(order_id, *amount, *price, psbt).await {
            Ok(signed) => {
                info!(target = "swapline::trade", peer_id = %peer, %trade_id, order_id, %amount, "offer co-signed");
                TradeMessage::PsbtSigned {
                    trade_id: *trade_id,
                    psbt: signed,
                }
            }
            Err(reason) => {
                info!(target = "swapline::trade", peer_id = %peer, %trade_id, order_id, %reason, "offer rejected");
                TradeMessage::PsbtRejected {
                    trade_id: *trade_id,
                    reason,
                }
            }
        }
    }

    async fn cosign(
        &self,
        order_id: &str,
        amount: Decimal,
        price: Decimal,
        psbt: &PsbtEnvelope,
    ) -> Result<PsbtEnvelope, String> {
        let order = self
            .orders
            .get_order(order_id)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("order {order_id} not found"))?;
        if order.maker != self.local {
            return Err(format!("order {order_id} is not listed by this peer"));
        }
        if order.status != OrderStatus::Open {
            return Err(format!("order {order_id} is {:?}", order.status));
        }
        if amount <= Decimal::ZERO || amount > order.amount {
            return Err(format!(
                "amount {amount} outside order size {}",
                order.amount
            ));
        }
        if price != order.price {
            return Err(format!("price {price} does not match order price {}", order.price));
        }
        psbt.validate().map_err(|err| err.to_string())?;
        if !self.wallet.is_connected().await {
            return Err("wallet not connected".into());
        }
        let signed = self
            .wallet
            .sign_psbt(&psbt.base64)
            .await
            .map_err(|err| err.to_string())?;
        Ok(psbt.with_base64(signed))
    }
}
