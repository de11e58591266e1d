//! Trade messages carried on the `trade` data channel.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::wallet::PsbtEnvelope;
use crate::transport::peer::{PeerEvent, PeerEventKind};
use crate::transport::{ConnectionManager, PeerId, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TradeMessage {
    /// Taker to maker: a locally signed PSBT for `amount` of `order_id`.
    PsbtOffer {
        trade_id: Uuid,
        order_id: String,
        amount: Decimal,
        price: Decimal,
        psbt: PsbtEnvelope,
    },
    /// Maker to taker: the co-signed PSBT.
    PsbtSigned { trade_id: Uuid, psbt: PsbtEnvelope },
    PsbtRejected { trade_id: Uuid, reason: String },
}

impl TradeMessage {
    pub fn trade_id(&self) -> Uuid {
        match self {
            TradeMessage::PsbtOffer { trade_id, .. }
            | TradeMessage::PsbtSigned { trade_id, .. }
            | TradeMessage::PsbtRejected { trade_id, .. } => *trade_id,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed trade message: {0}")]
    Malformed(String),
}

/// One inbound frame: a decoded message, or the reason it did not decode.
pub type TradeInbound = Result<TradeMessage, ProtocolError>;

/// Per-peer message channel the trade layer runs over. It never creates or
/// tears down connections.
#[async_trait]
pub trait TradeChannel: Send + Sync {
    async fn send(&self, peer: &PeerId, message: &TradeMessage) -> Result<(), TransportError>;
    fn subscribe(&self, peer: &PeerId) -> Result<mpsc::UnboundedReceiver<TradeInbound>, TransportError>;
}

#[async_trait]
impl TradeChannel for ConnectionManager {
    async fn send(&self, peer: &PeerId, message: &TradeMessage) -> Result<(), TransportError> {
        let connection = self
            .get_connection(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        let text = message
            .encode()
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        connection.send_string(self.data_channel_label(), text).await
    }

    fn subscribe(&self, peer: &PeerId) -> Result<mpsc::UnboundedReceiver<TradeInbound>, TransportError> {
        let connection = self
            .get_connection(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))?;
        let label = self.data_channel_label().to_string();
        let mut frames = connection.subscribe(PeerEventKind::Message);
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = peer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = frames.next() => {
                        let (frame_label, payload) = match event {
                            Some(PeerEvent::Message { label, payload, .. }) => (label, payload),
                            Some(_) => continue,
                            None => break,
                        };
                        if frame_label != label {
                            continue;
                        }
                        let inbound = match payload.as_text() {
                            Some(text) => TradeMessage::decode(text),
                            None => Err(ProtocolError::Malformed("binary frame is not utf-8".into())),
                        };
                        trace!(target = "swapline::trade", peer_id = %peer, ok = inbound.is_ok(), "trade frame");
                        if tx.send(inbound).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(target = "swapline::trade", peer_id = %peer, "trade subscription ended");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn messages_are_tagged_snake_case() {
        let message = TradeMessage::PsbtRejected {
            trade_id: Uuid::nil(),
            reason: "order filled".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "psbt_rejected");
        assert_eq!(value["reason"], "order filled");
    }

    #[test]
    fn offer_decodes_with_decimal_strings() {
        let text = r#"{"type":"psbt_offer","trade_id":"00000000-0000-0000-0000-000000000000","order_id":"order-1","amount":"0.5","price":"0.0001","psbt":{"base64":"cHNidP8=","inputs":[],"outputs":[]}}"#;
        match TradeMessage::decode(text).unwrap() {
            TradeMessage::PsbtOffer { amount, price, psbt, .. } => {
                assert_eq!(amount, dec!(0.5));
                assert_eq!(price, dec!(0.0001));
                assert_eq!(psbt.fee, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_malformed() {
        assert!(matches!(
            TradeMessage::decode(r#"{"type":"psbt_burn","trade_id":"00000000-0000-0000-0000-000000000000"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
