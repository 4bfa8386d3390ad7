//! Shared helpers for broker integration tests
//!
//! Each test starts its own broker on an ephemeral port with `/bin/sh`
//! as the shell and a small command catalog.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use termbroker::catalog::{CommandCatalog, SystemCommands};
use termbroker::config::BrokerConfig;
use termbroker::http_server::serve;
use termbroker::registry::SessionRegistry;
use termbroker::state::AppState;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session id backed by a catalog system whose start command prints `ready`.
pub const SYSTEM_ID: &str = "murfi";
/// Session id allowed through the explicit allow-list.
pub const EXTRA_ID: &str = "scratch";

pub const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        allowed_sessions: [EXTRA_ID.to_string()].into_iter().collect(),
        shell: "/bin/sh".to_string(),
        startup_delay: Duration::from_millis(50),
        cwd: std::env::temp_dir(),
        ..BrokerConfig::default()
    }
}

pub fn test_catalog() -> CommandCatalog {
    let mut catalog = CommandCatalog::default();
    catalog.systems.insert(
        SYSTEM_ID.to_string(),
        SystemCommands {
            start_command: Some("echo ready".to_string()),
            description: Some("test system".to_string()),
        },
    );
    catalog
}

pub struct TestBroker {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<Result<(), termbroker::BrokerError>>>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(test_config(), test_catalog()).await
    }

    pub async fn start_with(config: BrokerConfig, catalog: CommandCatalog) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(config, catalog);
        let registry = state.registry.clone();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, state, async move {
            let _ = rx.await;
        }));
        Self {
            addr,
            registry,
            shutdown: Some(tx),
            server: Some(server),
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/ws?{}", self.addr, query)
    }

    pub async fn connect(&self, session_id: &str) -> Socket {
        self.connect_raw(&format!("sessionId={session_id}")).await
    }

    pub async fn connect_raw(&self, query: &str) -> Socket {
        let (ws, _) = tokio_tungstenite::connect_async(self.ws_url(query))
            .await
            .unwrap();
        ws
    }

    /// Trigger graceful shutdown and wait for the server to return.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            tokio::time::timeout(Duration::from_secs(10), server)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    pub async fn has_session(&self, id: &str) -> bool {
        self.registry.ids().await.iter().any(|held| held == id)
    }

    /// Poll until the registry holds `expected` sessions.
    pub async fn wait_for_sessions(&self, expected: usize) {
        let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
        while self.registry.len().await != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {expected} sessions, have {}",
                self.registry.len().await
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub enum Inbound {
    Frame(Value),
    Closed(Option<u16>),
}

/// Next JSON frame or close, skipping pings.
pub async fn next_inbound(ws: &mut Socket) -> Inbound {
    loop {
        let msg = tokio::time::timeout(FRAME_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame");
        match msg {
            Some(Ok(Message::Text(text))) => {
                return Inbound::Frame(serde_json::from_str(&text).unwrap())
            }
            Some(Ok(Message::Close(frame))) => {
                return Inbound::Closed(frame.map(|f| u16::from(f.code)))
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return Inbound::Closed(None),
        }
    }
}

pub async fn next_frame(ws: &mut Socket) -> Value {
    match next_inbound(ws).await {
        Inbound::Frame(frame) => frame,
        Inbound::Closed(code) => panic!("socket closed ({code:?}) while waiting for a frame"),
    }
}

pub async fn expect_close(ws: &mut Socket) -> Option<u16> {
    loop {
        match next_inbound(ws).await {
            Inbound::Frame(_) => continue,
            Inbound::Closed(code) => return code,
        }
    }
}

/// Read frames until one has `type == kind`; returns it with all output seen on the way.
pub async fn wait_for_type(ws: &mut Socket, kind: &str) -> (Value, String) {
    let mut output = String::new();
    loop {
        let frame = next_frame(ws).await;
        if frame["type"] == kind {
            return (frame, output);
        }
        if frame["type"] == "output" {
            output.push_str(frame["data"].as_str().unwrap_or_default());
        }
    }
}

/// Read output frames until the accumulated text contains `needle`.
pub async fn wait_for_output(ws: &mut Socket, needle: &str) -> String {
    let mut output = String::new();
    while !output.contains(needle) {
        let frame = next_frame(ws).await;
        if frame["type"] == "output" {
            output.push_str(frame["data"].as_str().unwrap_or_default());
        }
    }
    output
}

pub async fn send_json(ws: &mut Socket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

pub async fn send_command(ws: &mut Socket, session_id: &str, command: &str, command_id: Option<&str>) {
    let mut frame = json!({"type": "command", "sessionId": session_id, "command": command});
    if let Some(id) = command_id {
        frame["commandId"] = json!(id);
    }
    send_json(ws, frame).await;
}
