//! Session registry: at most one live shell per session identifier.

use crate::error::BrokerError;
use crate::process::{ProcessEvent, ShellProcess, SpawnOptions};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug)]
struct SessionEntry {
    process: Arc<ShellProcess>,
    generation: u64,
    created_at: Instant,
}

/// What a connection holds after binding to a session.
///
/// `generation` distinguishes this process from any later replacement under
/// the same identifier.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: String,
    pub generation: u64,
    pub process: Arc<ShellProcess>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub pid: Option<u32>,
    pub age_secs: u64,
    pub supports_resize: bool,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    next_generation: AtomicU64,
    options: SpawnOptions,
    startup_delay: Duration,
}

impl SessionRegistry {
    pub fn new(options: SpawnOptions, startup_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            options,
            startup_delay,
        })
    }

    /// Spawn a shell for `id`, killing whatever was registered under it before.
    ///
    /// The write lock is held across kill and spawn so concurrent connections
    /// for one identifier cannot both end up with a live process.
    pub async fn create_or_replace(
        self: &Arc<Self>,
        id: &str,
        initial_command: Option<String>,
    ) -> Result<SessionHandle, BrokerError> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let mut sessions = self.sessions.write().await;
        if let Some(previous) = sessions.remove(id) {
            info!(
                session_id = id,
                generation = previous.generation,
                "replacing existing session"
            );
            previous.process.kill();
        }

        let process = Arc::new(ShellProcess::spawn(&self.options, tx.clone())?);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            id.to_string(),
            SessionEntry {
                process: Arc::clone(&process),
                generation,
                created_at: Instant::now(),
            },
        );
        drop(sessions);

        info!(
            session_id = id,
            generation,
            pid = ?process.pid(),
            pty = process.supports_resize(),
            "session created"
        );

        self.watch_exit(id.to_string(), generation, Arc::clone(&process), tx);
        if let Some(command) = initial_command {
            self.schedule_initial_command(id.to_string(), Arc::clone(&process), command);
        }

        Ok(SessionHandle {
            id: id.to_string(),
            generation,
            process,
            events: rx,
        })
    }

    /// Best-effort input; silently dropped when no session exists.
    pub async fn write(&self, id: &str, data: &[u8]) {
        let Some(process) = self.process(id).await else {
            debug!(session_id = id, "write to unknown session dropped");
            return;
        };
        if let Err(e) = process.write(data).await {
            debug!(session_id = id, error = %e, "write failed");
        }
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) {
        let Some(process) = self.process(id).await else {
            return;
        };
        match process.resize(cols, rows) {
            Ok(true) => debug!(session_id = id, cols, rows, "resized"),
            Ok(false) => debug!(session_id = id, "resize ignored without a pseudo-terminal"),
            Err(e) => warn!(session_id = id, error = %e, "resize failed"),
        }
    }

    /// Kill and remove the session if present. Returns whether one existed.
    pub async fn destroy(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(entry) => {
                entry.process.kill();
                info!(session_id = id, generation = entry.generation, "session destroyed");
                true
            }
            None => false,
        }
    }

    /// Tear down the session a connection was bound to, unless it has
    /// already been replaced by a newer one.
    pub async fn release(&self, handle: &SessionHandle) {
        if self.remove_generation(&handle.id, handle.generation).await {
            info!(session_id = %handle.id, generation = handle.generation, "session released");
        }
        handle.process.kill();
    }

    pub async fn destroy_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (id, entry) in &drained {
            entry.process.kill();
            debug!(session_id = %id, "session destroyed at shutdown");
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let now = Instant::now();
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: id.clone(),
                pid: entry.process.pid(),
                age_secs: now.duration_since(entry.created_at).as_secs(),
                supports_resize: entry.process.supports_resize(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    async fn process(&self, id: &str) -> Option<Arc<ShellProcess>> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.process))
    }

    async fn remove_generation(&self, id: &str, generation: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(id) {
            Some(entry) if entry.generation == generation => {
                sessions.remove(id);
                true
            }
            _ => false,
        }
    }

    fn watch_exit(
        self: &Arc<Self>,
        id: String,
        generation: u64,
        process: Arc<ShellProcess>,
        events: mpsc::Sender<ProcessEvent>,
    ) {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let code = process.wait().await;
            if let Some(registry) = registry.upgrade() {
                registry.remove_generation(&id, generation).await;
            }
            info!(session_id = %id, generation, exit_code = code, "session process exited");
            let _ = events.send(ProcessEvent::Exit(code)).await;
        });
    }

    fn schedule_initial_command(&self, id: String, process: Arc<ShellProcess>, command: String) {
        let delay = self.startup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if process.has_exited() {
                return;
            }
            debug!(session_id = %id, command = %command, "writing initial command");
            if let Err(e) = process.write(format!("{command}\n").as_bytes()).await {
                warn!(session_id = %id, error = %e, "failed to write initial command");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(
            SpawnOptions {
                shell: "/bin/sh".to_string(),
                cwd: std::env::temp_dir(),
                use_pty: false,
                cols: 80,
                rows: 24,
            },
            Duration::ZERO,
        )
    }

    async fn holds(registry: &SessionRegistry, id: &str) -> bool {
        registry.ids().await.iter().any(|held| held == id)
    }

    async fn next_exit(events: &mut mpsc::Receiver<ProcessEvent>) -> i32 {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(ProcessEvent::Exit(code)) => return code,
                    Some(_) => continue,
                    None => panic!("event channel closed before exit"),
                }
            }
        })
        .await
        .expect("no exit event")
    }

    #[tokio::test]
    async fn write_to_unknown_session_is_a_noop() {
        let registry = registry();
        registry.write("ghost", b"echo hi\n").await;
        registry.resize("ghost", 80, 24).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let registry = registry();
        let handle = registry.create_or_replace("a", None).await.unwrap();
        assert!(registry.destroy("a").await);
        assert!(!registry.destroy("a").await);
        tokio::time::timeout(Duration::from_secs(5), handle.process.wait())
            .await
            .unwrap();
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn replacing_kills_the_previous_process() {
        let registry = registry();
        let mut first = registry.create_or_replace("murfi", None).await.unwrap();
        let second = registry.create_or_replace("murfi", None).await.unwrap();
        assert_eq!(registry.len().await, 1);
        assert_ne!(first.generation, second.generation);

        next_exit(&mut first.events).await;
        // The old process's exit must not evict its replacement.
        assert!(holds(&registry, "murfi").await);
        assert!(!second.process.has_exited());

        registry.release(&second).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_creates_leave_one_live_process() {
        let registry = registry();
        let (a, b) = tokio::join!(
            registry.create_or_replace("x", None),
            registry.create_or_replace("x", None)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(registry.len().await, 1);

        let entry_pid = registry.list().await[0].pid;
        let (mut loser, survivor) = if a.process.pid() == entry_pid {
            (b, a)
        } else {
            (a, b)
        };
        assert_eq!(survivor.process.pid(), entry_pid);
        assert_ne!(loser.process.pid(), entry_pid);

        next_exit(&mut loser.events).await;
        assert!(loser.process.has_exited());
        assert!(!survivor.process.has_exited());
        assert!(holds(&registry, "x").await);

        registry.release(&survivor).await;
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn exit_removes_the_entry_before_reporting() {
        let registry = registry();
        let mut handle = registry
            .create_or_replace("a", Some("exit 7".to_string()))
            .await
            .unwrap();
        assert_eq!(next_exit(&mut handle.events).await, 7);
        assert!(!holds(&registry, "a").await);
    }

    #[tokio::test]
    async fn release_leaves_a_newer_session_alone() {
        let registry = registry();
        let first = registry.create_or_replace("a", None).await.unwrap();
        let second = registry.create_or_replace("a", None).await.unwrap();
        registry.release(&first).await;
        assert!(holds(&registry, "a").await);
        assert!(!second.process.has_exited());
        registry.destroy_all().await;
    }

    #[tokio::test]
    async fn registry_write_reaches_the_shell() {
        let registry = registry();
        let mut handle = registry.create_or_replace("a", None).await.unwrap();
        registry.write("a", b"echo routed; exit 0\n").await;

        let mut output = String::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), handle.events.recv())
                .await
                .unwrap()
            {
                Some(ProcessEvent::Output(text)) => output.push_str(&text),
                Some(ProcessEvent::Exit(code)) => {
                    assert_eq!(code, 0);
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
        assert!(output.contains("routed"));
    }

    #[tokio::test]
    async fn destroy_all_empties_the_registry() {
        let registry = registry();
        let a = registry.create_or_replace("a", None).await.unwrap();
        let b = registry.create_or_replace("b", None).await.unwrap();
        assert_eq!(registry.ids().await, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.list().await.len(), 2);

        assert_eq!(registry.destroy_all().await, 2);
        assert_eq!(registry.len().await, 0);
        for handle in [a, b] {
            tokio::time::timeout(Duration::from_secs(5), handle.process.wait())
                .await
                .unwrap();
        }
    }
}
