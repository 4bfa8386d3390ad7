//! Per-WebSocket connection handling.
//!
//! A connection is authorized from its query string, bound to one session,
//! and then relays frames between the socket and the session's shell until
//! either side goes away. Losing the socket always tears the session down.
//!
//! Writes to the shell go through a bounded queue drained by a separate
//! task, so a shell that stops reading stdin never stalls the relay loop.

use crate::catalog::CommandCatalog;
use crate::config::BrokerConfig;
use crate::error::Rejection;
use crate::process::{ProcessEvent, ShellProcess, SPAWN_FAILED_EXIT_CODE};
use crate::protocol::{is_valid_command_id, ClientFrame, ServerFrame};
use crate::sentinel::completion_probe;
use crate::state::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Pending writes per connection before input is refused.
const STDIN_QUEUE_CAPACITY: usize = 64;

/// Query parameters of `GET /ws`.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub initial_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorized {
    pub session_id: String,
    pub initial_command: Option<String>,
}

/// Decide whether a connection may bind, and with which start command.
pub fn authorize(
    params: &ConnectParams,
    config: &BrokerConfig,
    catalog: &CommandCatalog,
) -> Result<Authorized, Rejection> {
    let session_id = params
        .session_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(Rejection::MissingSession)?;

    if let Some(expected) = &config.token {
        if params.token.as_deref() != Some(expected.as_str()) {
            return Err(Rejection::Unauthorized);
        }
    }

    let allowed = config.allowed_sessions.contains(session_id)
        || catalog.system_ids().any(|id| id == session_id);
    if !allowed {
        return Err(Rejection::NotAllowed(session_id.to_string()));
    }

    let requested = params
        .initial_command
        .as_deref()
        .filter(|c| !c.trim().is_empty());
    if requested.is_some() && !config.allow_initial_command {
        debug!(session_id, "ignoring initialCommand, not enabled");
    }
    let initial_command = requested
        .filter(|_| config.allow_initial_command)
        .or_else(|| catalog.start_command(session_id))
        .map(str::to_string);

    Ok(Authorized {
        session_id: session_id.to_string(),
        initial_command,
    })
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params, state))
}

async fn handle_socket(mut socket: WebSocket, params: ConnectParams, state: AppState) {
    let conn_id = Uuid::new_v4();
    match authorize(&params, &state.config, &state.catalog) {
        Ok(authorized) => {
            let span = info_span!("terminal", %conn_id, session_id = %authorized.session_id);
            run_session(socket, authorized, state).instrument(span).await;
        }
        Err(rejection) => {
            warn!(%conn_id, session_id = ?params.session_id, reason = %rejection, "rejecting connection");
            close(&mut socket, close_code::POLICY, rejection.to_string()).await;
        }
    }
}

async fn run_session(mut socket: WebSocket, authorized: Authorized, state: AppState) {
    let Authorized {
        session_id,
        initial_command,
    } = authorized;

    let mut handle = match state
        .registry
        .create_or_replace(&session_id, initial_command)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start session process");
            let frames = [
                ServerFrame::Error {
                    session_id: session_id.clone(),
                    error: e.to_string(),
                },
                ServerFrame::Exit {
                    session_id: session_id.clone(),
                    exit_code: SPAWN_FAILED_EXIT_CODE,
                },
            ];
            for frame in &frames {
                if send_frame(&mut socket, frame).await.is_err() {
                    return;
                }
            }
            close(&mut socket, close_code::ERROR, "failed to start session".to_string()).await;
            return;
        }
    };
    info!(generation = handle.generation, "session bound");

    let (stdin, writer) = spawn_stdin_writer(Arc::clone(&handle.process));
    let mut connection = Connection::new(session_id, Arc::clone(&handle.process), stdin);
    let mut shutdown = state.shutdown_signal();
    let (mut sink, mut stream) = socket.split();
    let mut events_open = true;

    loop {
        let reply = tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => connection.handle_text(&text),
                Some(Ok(Message::Binary(_))) => {
                    debug!("dropping binary frame");
                    None
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
            },
            event = handle.events.recv(), if events_open => match event {
                Some(event) => connection.handle_event(event),
                None => {
                    events_open = false;
                    None
                }
            },
            Ok(()) = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = sink
                        .send(close_message(close_code::AWAY, "server shutting down".to_string()))
                        .await;
                    break;
                }
                None
            }
        };

        if let Some(frame) = reply {
            if send_frame(&mut sink, &frame).await.is_err() {
                debug!("socket closed, dropping outbound frames");
                break;
            }
        }
    }

    // A write blocked on a full pipe must not keep the session alive.
    writer.abort();
    state.registry.release(&handle).await;
    info!("connection closed");
}

fn spawn_stdin_writer(process: Arc<ShellProcess>) -> (mpsc::Sender<Vec<u8>>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(STDIN_QUEUE_CAPACITY);
    let writer = tokio::spawn(
        async move {
            while let Some(data) = rx.recv().await {
                if let Err(e) = process.write(&data).await {
                    debug!(error = %e, "input dropped");
                }
            }
        }
        .in_current_span(),
    );
    (tx, writer)
}

/// Bound-state logic of one connection, independent of the socket.
struct Connection {
    session_id: String,
    process: Arc<ShellProcess>,
    stdin: mpsc::Sender<Vec<u8>>,
    tracked: HashSet<String>,
}

impl Connection {
    fn new(session_id: String, process: Arc<ShellProcess>, stdin: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            session_id,
            process,
            stdin,
            tracked: HashSet::new(),
        }
    }

    fn handle_text(&mut self, text: &str) -> Option<ServerFrame> {
        let frame = match serde_json::from_str::<ClientFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return None;
            }
        };
        if let Some(addressed) = frame.session_id() {
            if addressed != self.session_id {
                warn!(addressed, "dropping frame addressed to another session");
                return None;
            }
        }

        match frame {
            ClientFrame::Input { data, .. } => self.queue(data.into_bytes()).err(),
            ClientFrame::Command {
                command,
                command_id,
                ..
            } => self.run_command(&command, command_id),
            ClientFrame::Resize { cols, rows, .. } => {
                match self.process.resize(cols, rows) {
                    Ok(true) => debug!(cols, rows, "resized"),
                    Ok(false) => debug!("resize ignored without a pseudo-terminal"),
                    Err(e) => warn!(error = %e, "resize failed"),
                }
                None
            }
            ClientFrame::Ping { .. } => Some(ServerFrame::Pong {
                session_id: self.session_id.clone(),
            }),
        }
    }

    fn run_command(&mut self, command: &str, command_id: Option<String>) -> Option<ServerFrame> {
        let Some(command_id) = command_id else {
            return self.queue(format!("{command}\n").into_bytes()).err();
        };

        if !is_valid_command_id(&command_id) {
            return Some(self.error("invalid commandId"));
        }
        if !self.tracked.insert(command_id.clone()) {
            return Some(self.error(&format!("commandId {command_id} is already pending")));
        }

        let line = format!("{command}\n{}", completion_probe(&command_id));
        self.process.expect_echo(&command_id);
        match self.queue(line.into_bytes()) {
            Ok(()) => {
                debug!(%command_id, "tracked command queued");
                None
            }
            Err(_) => {
                self.tracked.remove(&command_id);
                self.process.forget_echo(&command_id);
                Some(self.error(&format!(
                    "command {command_id} could not be sent: input queue is full"
                )))
            }
        }
    }

    /// Hand bytes to the stdin writer without waiting on the shell.
    fn queue(&self, data: Vec<u8>) -> Result<(), ServerFrame> {
        match self.stdin.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("shell is not reading input, dropping write");
                Err(self.error("input queue full, shell is not reading"))
            }
            Err(TrySendError::Closed(_)) => {
                debug!("stdin writer gone, input dropped");
                Ok(())
            }
        }
    }

    fn handle_event(&mut self, event: ProcessEvent) -> Option<ServerFrame> {
        match event {
            ProcessEvent::Output(data) => Some(ServerFrame::Output {
                session_id: self.session_id.clone(),
                data,
            }),
            ProcessEvent::CommandComplete {
                command_id,
                exit_code,
            } => {
                if !self.tracked.remove(&command_id) {
                    debug!(%command_id, "ignoring completion for untracked command");
                    return None;
                }
                Some(ServerFrame::CommandComplete {
                    session_id: self.session_id.clone(),
                    command_id,
                    exit_code,
                })
            }
            ProcessEvent::Exit(exit_code) => {
                info!(exit_code, pending = self.tracked.len(), "session process exited");
                self.tracked.clear();
                Some(ServerFrame::Exit {
                    session_id: self.session_id.clone(),
                    exit_code,
                })
            }
        }
    }

    fn error(&self, message: &str) -> ServerFrame {
        ServerFrame::Error {
            session_id: self.session_id.clone(),
            error: message.to_string(),
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ServerFrame) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            warn!(error = %e, "failed to encode frame");
            Ok(())
        }
    }
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

async fn close(socket: &mut WebSocket, code: u16, reason: String) {
    let _ = socket.send(close_message(code, reason)).await;
}
