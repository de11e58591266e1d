pub mod config;
pub mod error;
pub mod node;
pub mod telemetry;
pub mod trade;
pub mod transport;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
