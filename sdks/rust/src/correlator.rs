//! Tracks commands sent with an id until the broker reports their exit code.
//!
//! Each pending command resolves exactly once: a matching completion, the
//! caller's timeout, or the connection going away, whichever comes first.

use crate::error::ClientError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

/// Result of a tracked command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
}

type Reply = Result<CommandOutcome, ClientError>;

#[derive(Default)]
struct State {
    pending: HashMap<String, oneshot::Sender<Reply>>,
    closed: Option<String>,
}

#[derive(Clone, Default)]
pub struct CommandCorrelator {
    state: Arc<Mutex<State>>,
}

/// A registered command waiting for its completion.
#[derive(Debug)]
pub struct PendingCommand {
    id: String,
    rx: oneshot::Receiver<Reply>,
}

impl PendingCommand {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Generate a fresh command id.
    pub fn next_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub fn register(&self, id: impl Into<String>) -> Result<PendingCommand, ClientError> {
        let id = id.into();
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(ClientError::Disconnected(reason.clone()));
        }
        if state.pending.contains_key(&id) {
            return Err(ClientError::DuplicateCommand(id));
        }
        let (tx, rx) = oneshot::channel();
        state.pending.insert(id.clone(), tx);
        Ok(PendingCommand { id, rx })
    }

    /// Resolve a pending command. Returns false when nothing was waiting,
    /// e.g. the command already timed out.
    pub fn complete(&self, id: &str, exit_code: i32) -> bool {
        let sender = self.lock().pending.remove(id);
        match sender {
            Some(tx) => tx.send(Ok(CommandOutcome { exit_code })).is_ok(),
            None => false,
        }
    }

    /// Drop a pending command without resolving it.
    pub fn cancel(&self, id: &str) -> bool {
        self.lock().pending.remove(id).is_some()
    }

    /// Reject every pending command and refuse new ones.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason.to_string());
            }
            state.pending.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(ClientError::Disconnected(reason.to_string())));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    /// Wait for `pending` to resolve, giving up after `timeout`.
    pub async fn wait(&self, pending: PendingCommand, timeout: Duration) -> Reply {
        let PendingCommand { id, mut rx } = pending;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::Disconnected("correlator dropped".to_string())),
            Err(_) => {
                if self.cancel(&id) {
                    return Err(ClientError::Timeout {
                        command_id: id,
                        timeout,
                    });
                }
                // Resolved between the deadline and the removal.
                match rx.await {
                    Ok(reply) => reply,
                    Err(_) => Err(ClientError::Timeout {
                        command_id: id,
                        timeout,
                    }),
                }
            }
        }
    }
}
