use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::order::Order;
use crate::error::ErrorReport;

/// Leading bytes of every serialized PSBT.
pub const PSBT_MAGIC: &[u8; 5] = b"psbt\xff";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsbtInput {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsbtOutput {
    pub address: String,
    pub value: u64,
}

/// A PSBT plus the inputs and outputs it was built from. Values are
/// replaced wholesale at each signing step, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsbtEnvelope {
    pub base64: String,
    pub inputs: Vec<PsbtInput>,
    pub outputs: Vec<PsbtOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
}

impl PsbtEnvelope {
    /// Same inputs and outputs, new serialized body.
    pub fn with_base64(&self, base64: impl Into<String>) -> Self {
        Self {
            base64: base64.into(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            fee: self.fee,
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, WalletError> {
        STANDARD
            .decode(self.base64.trim())
            .map_err(|err| WalletError::InvalidPsbt(format!("not base64: {err}")))
    }

    /// Base64 that decodes to something starting with the PSBT magic.
    pub fn validate(&self) -> Result<(), WalletError> {
        let bytes = self.decode()?;
        if !bytes.starts_with(PSBT_MAGIC) {
            return Err(WalletError::InvalidPsbt("missing psbt magic bytes".into()));
        }
        Ok(())
    }
}

/// Inputs and outputs the wallet picked to fund one side of a trade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeFunding {
    pub inputs: Vec<PsbtInput>,
    pub outputs: Vec<PsbtOutput>,
    pub fee: Option<u64>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("wallet not connected")]
    NotConnected,
    #[error("wallet rejected request: {0}")]
    Rejected(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("invalid psbt: {0}")]
    InvalidPsbt(String),
    #[error("wallet backend error: {0}")]
    Backend(String),
}

impl From<WalletError> for ErrorReport {
    fn from(err: WalletError) -> Self {
        ErrorReport::wallet(err.to_string())
    }
}

/// Signing capability. Key material never leaves the implementation.
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn is_connected(&self) -> bool;
    /// Select inputs and outputs for `amount` of `order` at its price.
    async fn fund_trade(&self, order: &Order, amount: Decimal) -> Result<TradeFunding, WalletError>;
    async fn create_psbt(&self, inputs: &[PsbtInput], outputs: &[PsbtOutput]) -> Result<String, WalletError>;
    async fn sign_psbt(&self, psbt: &str) -> Result<String, WalletError>;
    /// Finalized transaction as hex.
    async fn extract_tx(&self, psbt: &str) -> Result<String, WalletError>;
    /// Returns the txid.
    async fn broadcast_tx(&self, tx_hex: &str) -> Result<String, WalletError>;
}
