//! Client for the termbroker WebSocket terminal broker.
//!
//! ```no_run
//! use std::time::Duration;
//! use termbroker_client::{ClientConfig, TerminalClient};
//!
//! # async fn run() -> Result<(), termbroker_client::ClientError> {
//! let config = ClientConfig::new("http://localhost:8080", "murfi")?;
//! let (client, mut frames) = TerminalClient::connect(config).await?;
//! let outcome = client
//!     .execute_command("make test", Duration::from_secs(60))
//!     .await?;
//! println!("exit code {}", outcome.exit_code);
//! # drop(frames.recv());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod correlator;
pub mod error;
pub mod http;
pub mod protocol;

pub use client::{ClientConfig, TerminalClient};
pub use correlator::{CommandCorrelator, CommandOutcome, PendingCommand};
pub use error::ClientError;
pub use http::BrokerHttpClient;
pub use protocol::{ClientFrame, ServerFrame};
