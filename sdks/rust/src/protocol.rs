//! Wire frames exchanged with the broker.

use serde::{Deserialize, Serialize};

/// Frames sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Input { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Command {
        session_id: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    Ping { session_id: String },
}

/// Frames received from the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Output { session_id: String, data: String },
    #[serde(rename_all = "camelCase")]
    Exit { session_id: String, exit_code: i32 },
    #[serde(rename_all = "camelCase")]
    Error { session_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    Pong { session_id: String },
    #[serde(rename_all = "camelCase")]
    CommandComplete {
        session_id: String,
        command_id: String,
        exit_code: i32,
    },
}
