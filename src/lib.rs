//! Terminal broker: shell sessions multiplexed over WebSocket connections,
//! with exit-code tracking for individual commands.

#[cfg(not(unix))]
compile_error!("termbroker only works on Unix-like systems.");

pub mod catalog;
pub mod config;
pub mod connection;
pub mod error;
pub mod http_server;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod sentinel;
pub mod state;

pub use error::{BrokerError, Rejection};
