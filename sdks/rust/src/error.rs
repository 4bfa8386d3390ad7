use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("command {command_id} did not complete within {timeout:?}")]
    Timeout { command_id: String, timeout: Duration },

    #[error("connection closed: {0}")]
    Disconnected(String),

    #[error("command id already pending: {0}")]
    DuplicateCommand(String),
}
