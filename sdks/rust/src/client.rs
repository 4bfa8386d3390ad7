//! WebSocket terminal client.

use crate::correlator::{CommandCorrelator, CommandOutcome};
use crate::error::ClientError;
use crate::protocol::{ClientFrame, ServerFrame};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker base URL, `http(s)://` or `ws(s)://`.
    pub endpoint: Url,
    pub session_id: String,
    pub token: Option<String>,
    pub initial_command: Option<String>,
}

impl ClientConfig {
    pub fn new(endpoint: &str, session_id: impl Into<String>) -> Result<Self, ClientError> {
        let endpoint = Url::parse(endpoint).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            endpoint,
            session_id: session_id.into(),
            token: None,
            initial_command: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_initial_command(mut self, command: impl Into<String>) -> Self {
        self.initial_command = Some(command.into());
        self
    }

    /// The `/ws` URL including query parameters.
    pub fn ws_url(&self) -> Result<Url, ClientError> {
        let scheme = match self.endpoint.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ClientError::InvalidUrl(format!("unsupported scheme {other}"))),
        };
        let mut url = self.endpoint.clone();
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidUrl(self.endpoint.to_string()))?;
        url.set_path("/ws");
        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("sessionId", &self.session_id);
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            if let Some(command) = &self.initial_command {
                query.append_pair("initialCommand", command);
            }
        }
        Ok(url)
    }
}

/// A connected terminal session.
pub struct TerminalClient {
    session_id: String,
    outbound: mpsc::UnboundedSender<Message>,
    correlator: CommandCorrelator,
    reader: JoinHandle<()>,
}

impl TerminalClient {
    /// Connect and start routing frames. Every inbound frame, including
    /// command completions, is also delivered on the returned receiver.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerFrame>), ClientError> {
        let url = config.ws_url()?;
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let correlator = CommandCorrelator::new();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let routing = correlator.clone();
        let reader = tokio::spawn(async move {
            let mut reason = "connection closed".to_string();
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            reason = format!("closed by broker ({}): {}", u16::from(frame.code), frame.reason);
                        }
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        reason = e.to_string();
                        break;
                    }
                };
                let Ok(frame) = serde_json::from_str::<ServerFrame>(&text) else {
                    continue;
                };
                if let ServerFrame::CommandComplete {
                    command_id,
                    exit_code,
                    ..
                } = &frame
                {
                    routing.complete(command_id, *exit_code);
                }
                let _ = frames_tx.send(frame);
            }
            routing.fail_all(&reason);
        });

        let client = Self {
            session_id: config.session_id,
            outbound,
            correlator,
            reader,
        };
        Ok((client, frames_rx))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn correlator(&self) -> &CommandCorrelator {
        &self.correlator
    }

    fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        let text = serde_json::to_string(&frame)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ClientError::Disconnected("writer stopped".to_string()))
    }

    /// Send raw keystrokes.
    pub fn send_input(&self, data: impl Into<String>) -> Result<(), ClientError> {
        self.send(ClientFrame::Input {
            session_id: self.session_id.clone(),
            data: data.into(),
        })
    }

    /// Run a command without tracking its completion.
    pub fn send_command(&self, command: impl Into<String>) -> Result<(), ClientError> {
        self.send(ClientFrame::Command {
            session_id: self.session_id.clone(),
            command: command.into(),
            command_id: None,
        })
    }

    /// Run a command and wait for its exit code.
    pub async fn execute_command(
        &self,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Result<CommandOutcome, ClientError> {
        let pending = self.correlator.register(CommandCorrelator::next_id())?;
        let sent = self.send(ClientFrame::Command {
            session_id: self.session_id.clone(),
            command: command.into(),
            command_id: Some(pending.id().to_string()),
        });
        if let Err(e) = sent {
            self.correlator.cancel(pending.id());
            return Err(e);
        }
        self.correlator.wait(pending, timeout).await
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.send(ClientFrame::Resize {
            session_id: self.session_id.clone(),
            cols,
            rows,
        })
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.send(ClientFrame::Ping {
            session_id: self.session_id.clone(),
        })
    }

    /// Close the socket. Pending commands fail immediately.
    pub fn close(&self) {
        self.correlator.fail_all("client closed");
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for TerminalClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
