//! JSON frames exchanged over the terminal WebSocket.

use serde::{Deserialize, Serialize};

const MAX_COMMAND_ID_LEN: usize = 64;

/// Frames sent by the browser.
///
/// `sessionId` is optional on input; the connection is already bound to one session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Input {
        session_id: Option<String>,
        data: String,
    },
    #[serde(rename_all = "camelCase")]
    Command {
        session_id: Option<String>,
        command: String,
        command_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Resize {
        session_id: Option<String>,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    Ping { session_id: Option<String> },
}

impl ClientFrame {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientFrame::Input { session_id, .. }
            | ClientFrame::Command { session_id, .. }
            | ClientFrame::Resize { session_id, .. }
            | ClientFrame::Ping { session_id } => session_id.as_deref(),
        }
    }
}

/// Frames sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
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

/// Command ids are interpolated into a shell line, so only a safe alphabet is accepted.
pub fn is_valid_command_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_COMMAND_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_tracked_command() {
        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "command",
            "sessionId": "murfi",
            "command": "false",
            "commandId": "abc"
        }))
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Command {
                session_id: Some("murfi".into()),
                command: "false".into(),
                command_id: Some("abc".into()),
            }
        );
    }

    #[test]
    fn session_id_is_optional_inbound() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame.session_id(), None);
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"launch"}"#).is_err());
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"resize","cols":"x"}"#).is_err());
    }

    #[test]
    fn encodes_command_complete() {
        let frame = ServerFrame::CommandComplete {
            session_id: "murfi".into(),
            command_id: "abc".into(),
            exit_code: 1,
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "command-complete",
                "sessionId": "murfi",
                "commandId": "abc",
                "exitCode": 1
            })
        );
    }

    #[test]
    fn error_frame_uses_error_field() {
        let frame = ServerFrame::Error {
            session_id: "s".into(),
            error: "boom".into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "error", "sessionId": "s", "error": "boom" })
        );
    }

    #[test]
    fn command_id_alphabet() {
        assert!(is_valid_command_id("abc"));
        assert!(is_valid_command_id("6f1c2a0e-5b7d-4f43-9a55-0c1d2e3f4a5b"));
        assert!(!is_valid_command_id(""));
        assert!(!is_valid_command_id("a'; rm -rf /"));
        assert!(!is_valid_command_id(&"x".repeat(65)));
    }
}
