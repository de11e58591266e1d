use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-checkable error category shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Signaling,
    Connection,
    Wallet,
    Network,
    Timeout,
    Validation,
    Counterparty,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Signaling => "SignalingError",
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Wallet => "WalletError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Counterparty => "CounterpartyError",
            ErrorKind::Unknown => "UnknownError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plain-data error: a kind plus a short human readable message. Carries no
/// live handles so it can be serialized across to a UI or a log sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn wallet(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Wallet, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn counterparty(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Counterparty, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}
