//! Shell subprocesses, pipe- or pseudo-terminal-backed, behind one type.
//!
//! Output from stdout and stderr is merged into a single event channel. Exit
//! is published once through a `watch` channel after output has drained.

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::sentinel::{Decoded, OutputDecoder, PendingEchoes};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const READ_BUF_SIZE: usize = 8192;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Exit code reported when a process could not be started or observed.
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output(String),
    CommandComplete { command_id: String, exit_code: i32 },
    Exit(i32),
}

impl From<Decoded> for ProcessEvent {
    fn from(decoded: Decoded) -> Self {
        match decoded {
            Decoded::Text(text) => ProcessEvent::Output(text),
            Decoded::Completed {
                command_id,
                exit_code,
            } => ProcessEvent::CommandComplete {
                command_id,
                exit_code,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub shell: String,
    pub cwd: PathBuf,
    pub use_pty: bool,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnOptions {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            cwd: config.cwd.clone(),
            use_pty: config.use_pty,
            cols: 80,
            rows: 24,
        }
    }
}

enum Backend {
    Pipe {
        stdin: tokio::sync::Mutex<Option<ChildStdin>>,
        kill: Arc<Notify>,
    },
    Pty {
        writer: Arc<Mutex<Box<dyn Write + Send>>>,
        master: Mutex<Box<dyn MasterPty + Send>>,
        killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
        echoes: PendingEchoes,
    },
}

/// A running shell owned by exactly one session.
pub struct ShellProcess {
    pid: Option<u32>,
    backend: Backend,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl std::fmt::Debug for ShellProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellProcess")
            .field("pid", &self.pid)
            .field("supports_resize", &self.supports_resize())
            .field("exit_code", &*self.exit_rx.borrow())
            .finish()
    }
}

impl ShellProcess {
    /// Spawn a shell whose output is delivered on `events`.
    pub fn spawn(
        options: &SpawnOptions,
        events: mpsc::Sender<ProcessEvent>,
    ) -> Result<Self, BrokerError> {
        if options.use_pty {
            spawn_pty(options, events)
        } else {
            spawn_pipe(options, events)
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Plain pipes cannot carry window-size changes.
    pub fn supports_resize(&self) -> bool {
        matches!(self.backend, Backend::Pty { .. })
    }

    /// Register a completion probe about to be written, so its terminal echo
    /// is kept out of the output. Pipes do not echo.
    pub fn expect_echo(&self, command_id: &str) {
        if let Backend::Pty { echoes, .. } = &self.backend {
            echoes.expect(command_id);
        }
    }

    pub fn forget_echo(&self, command_id: &str) {
        if let Backend::Pty { echoes, .. } = &self.backend {
            echoes.forget(command_id);
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Resolves with the exit code once the process is gone.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(SPAWN_FAILED_EXIT_CODE),
            Err(_) => SPAWN_FAILED_EXIT_CODE,
        };
        code
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), BrokerError> {
        if data.is_empty() {
            return Ok(());
        }
        match &self.backend {
            Backend::Pipe { stdin, .. } => {
                let mut guard = stdin.lock().await;
                let Some(stdin) = guard.as_mut() else {
                    return Ok(());
                };
                stdin
                    .write_all(data)
                    .await
                    .map_err(|source| BrokerError::Io {
                        operation: "write stdin",
                        source,
                    })?;
                stdin.flush().await.map_err(|source| BrokerError::Io {
                    operation: "flush stdin",
                    source,
                })
            }
            Backend::Pty { writer, .. } => {
                let writer = Arc::clone(writer);
                let data = data.to_vec();
                tokio::task::spawn_blocking(move || {
                    let mut writer = lock(&writer);
                    writer.write_all(&data)?;
                    writer.flush()
                })
                .await
                .map_err(|e| BrokerError::Io {
                    operation: "write pty",
                    source: std::io::Error::other(e),
                })?
                .map_err(|source| BrokerError::Io {
                    operation: "write pty",
                    source,
                })
            }
        }
    }

    /// Returns `false` when the backend cannot resize.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<bool, BrokerError> {
        match &self.backend {
            Backend::Pipe { .. } => Ok(false),
            Backend::Pty { master, .. } => {
                lock(master)
                    .resize(pty_size(cols, rows))
                    .map_err(|e| BrokerError::Pty(e.to_string()))?;
                Ok(true)
            }
        }
    }

    /// Immediate termination of the shell and its process group.
    pub fn kill(&self) {
        if self.has_exited() {
            return;
        }
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
        match &self.backend {
            Backend::Pipe { kill, .. } => kill.notify_one(),
            Backend::Pty { killer, .. } => {
                if let Err(e) = lock(killer).kill() {
                    debug!(pid = ?self.pid, error = %e, "pty child already gone");
                }
            }
        }
    }
}

fn spawn_pipe(
    options: &SpawnOptions,
    events: mpsc::Sender<ProcessEvent>,
) -> Result<ShellProcess, BrokerError> {
    let mut cmd = Command::new(&options.shell);
    cmd.current_dir(&options.cwd)
        .env("TERM", "dumb")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| BrokerError::Spawn {
        shell: options.shell.clone(),
        source,
    })?;
    let pid = child.id();
    let stdin = child.stdin.take();

    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(pump(stdout, events.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(pump(stderr, events));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let kill = Arc::new(Notify::new());
    let kill_requested = Arc::clone(&kill);

    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_requested.notified() => {
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let code = match status {
            // Killed by a signal: no code, reported as 0.
            Ok(status) => status.code().unwrap_or(0),
            Err(e) => {
                warn!(pid = ?pid, error = %e, "failed to wait for shell");
                SPAWN_FAILED_EXIT_CODE
            }
        };

        let drained = tokio::time::timeout(
            OUTPUT_DRAIN_TIMEOUT,
            futures_util::future::join_all(readers.iter_mut()),
        )
        .await;
        if drained.is_err() {
            debug!(pid = ?pid, "output still open after exit, detaching readers");
            readers.iter().for_each(JoinHandle::abort);
        }
        let _ = exit_tx.send(Some(code));
    });

    Ok(ShellProcess {
        pid,
        backend: Backend::Pipe {
            stdin: tokio::sync::Mutex::new(stdin),
            kill,
        },
        exit_rx,
    })
}

fn pump<R>(mut reader: R, events: mpsc::Sender<ProcessEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = OutputDecoder::default();
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "output stream closed");
                    break;
                }
            };
            for decoded in decoder.feed(&buf[..n]) {
                if events.send(decoded.into()).await.is_err() {
                    return;
                }
            }
        }
        for decoded in decoder.finish() {
            let _ = events.send(decoded.into()).await;
        }
    })
}

fn spawn_pty(
    options: &SpawnOptions,
    events: mpsc::Sender<ProcessEvent>,
) -> Result<ShellProcess, BrokerError> {
    let pair = native_pty_system()
        .openpty(pty_size(options.cols, options.rows))
        .map_err(|e| BrokerError::Pty(e.to_string()))?;
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| BrokerError::Pty(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| BrokerError::Pty(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&options.shell);
    cmd.cwd(&options.cwd);
    cmd.env("TERM", "xterm-256color");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| BrokerError::Spawn {
            shell: options.shell.clone(),
            source: std::io::Error::other(e.to_string()),
        })?;
    // The reader only sees EOF once no slave handle is left open here.
    drop(pair.slave);

    let pid = child.process_id();
    let mut killer = child.clone_killer();

    let echoes = PendingEchoes::default();
    let reader_echoes = echoes.clone();
    let (drained_tx, drained_rx) = oneshot::channel::<()>();
    let spawned = std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut decoder = OutputDecoder::with_echoes(reader_echoes);
            let mut buf = [0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for decoded in decoder.feed(&buf[..n]) {
                            if events.blocking_send(decoded.into()).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the slave side is closed.
                    Err(_) => break,
                }
            }
            for decoded in decoder.finish() {
                let _ = events.blocking_send(decoded.into());
            }
            let _ = drained_tx.send(());
        });
    if let Err(source) = spawned {
        let _ = killer.kill();
        return Err(BrokerError::Io {
            operation: "spawn pty reader",
            source,
        });
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(async move {
        let code = match tokio::task::spawn_blocking(move || child.wait()).await {
            // Killed by a signal: reported as 0, like the pipe backend.
            Ok(Ok(status)) if status.signal().is_some() => 0,
            Ok(Ok(status)) => i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
            Ok(Err(e)) => {
                warn!(pid = ?pid, error = %e, "failed to wait for pty shell");
                SPAWN_FAILED_EXIT_CODE
            }
            Err(e) => {
                warn!(pid = ?pid, error = %e, "pty wait task failed");
                SPAWN_FAILED_EXIT_CODE
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drained_rx)
            .await
            .is_err()
        {
            debug!(pid = ?pid, "pty output still open after exit");
        }
        let _ = exit_tx.send(Some(code));
    });

    Ok(ShellProcess {
        pid,
        backend: Backend::Pty {
            writer: Arc::new(Mutex::new(writer)),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            echoes,
        },
        exit_rx,
    })
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn kill_process_group(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed");
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentinel::completion_probe;

    fn options(use_pty: bool) -> SpawnOptions {
        SpawnOptions {
            shell: "/bin/sh".to_string(),
            cwd: std::env::temp_dir(),
            use_pty,
            cols: 80,
            rows: 24,
        }
    }

    async fn run_to_exit(
        process: &ShellProcess,
        rx: &mut mpsc::Receiver<ProcessEvent>,
    ) -> (i32, Vec<ProcessEvent>) {
        let code = tokio::time::timeout(Duration::from_secs(10), process.wait())
            .await
            .expect("shell did not exit");
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        (code, events)
    }

    fn output_of(events: &[ProcessEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Output(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr_and_reports_exit_code() {
        let (tx, mut rx) = mpsc::channel(256);
        let process = ShellProcess::spawn(&options(false), tx).unwrap();
        assert!(process.pid().is_some());
        process
            .write(b"echo out; echo err 1>&2; exit 3\n")
            .await
            .unwrap();

        let (code, events) = run_to_exit(&process, &mut rx).await;
        assert_eq!(code, 3);
        let output = output_of(&events);
        assert!(output.contains("out"), "output was {output:?}");
        assert!(output.contains("err"), "output was {output:?}");
    }

    #[tokio::test]
    async fn probe_reports_command_status() {
        let (tx, mut rx) = mpsc::channel(256);
        let process = ShellProcess::spawn(&options(false), tx).unwrap();
        let script = format!("false\n{}exit 0\n", completion_probe("t1"));
        process.write(script.as_bytes()).await.unwrap();

        let (_, events) = run_to_exit(&process, &mut rx).await;
        assert!(events.contains(&ProcessEvent::CommandComplete {
            command_id: "t1".into(),
            exit_code: 1,
        }));
        assert!(!output_of(&events).contains("TERMBROKER_DONE"));
    }

    #[tokio::test]
    async fn pipe_backend_cannot_resize() {
        let (tx, _rx) = mpsc::channel(16);
        let process = ShellProcess::spawn(&options(false), tx).unwrap();
        assert!(!process.supports_resize());
        assert!(!process.resize(120, 40).unwrap());
        process.kill();
    }

    #[tokio::test]
    async fn kill_terminates_a_busy_shell() {
        let (tx, _rx) = mpsc::channel(16);
        let process = ShellProcess::spawn(&options(false), tx).unwrap();
        process.write(b"sleep 30\n").await.unwrap();
        process.kill();
        tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("killed shell should exit");
        assert!(process.has_exited());
        // Killing again is harmless.
        process.kill();
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let (tx, _rx) = mpsc::channel(16);
        let mut opts = options(false);
        opts.shell = "/nonexistent/shell".to_string();
        let err = ShellProcess::spawn(&opts, tx).unwrap_err();
        assert!(matches!(err, BrokerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn pty_backend_supports_resize() {
        let (tx, _rx) = mpsc::channel(256);
        let process = ShellProcess::spawn(&options(true), tx).unwrap();
        assert!(process.supports_resize());
        assert!(process.resize(132, 43).unwrap());
        process.kill();
        tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("killed pty shell should exit");
    }

    #[tokio::test]
    async fn pty_kill_reports_zero() {
        let (tx, _rx) = mpsc::channel(256);
        let process = ShellProcess::spawn(&options(true), tx).unwrap();
        process.write(b"sleep 30\n").await.unwrap();
        process.kill();
        let code = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("killed pty shell should exit");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn pty_probe_echo_is_not_output() {
        let (tx, mut rx) = mpsc::channel(256);
        let process = ShellProcess::spawn(&options(true), tx).unwrap();
        process.expect_echo("t2");
        let script = format!("false\n{}", completion_probe("t2"));
        process.write(script.as_bytes()).await.unwrap();

        let mut output = String::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("no completion from pty shell")
                .expect("event channel closed");
            match event {
                ProcessEvent::Output(text) => output.push_str(&text),
                ProcessEvent::CommandComplete { command_id, exit_code } => {
                    assert_eq!(command_id, "t2");
                    assert_eq!(exit_code, 1);
                    break;
                }
                ProcessEvent::Exit(code) => panic!("shell exited early with {code}"),
            }
        }
        assert!(!output.contains("printf"), "output was {output:?}");
        assert!(!output.contains("TERMBROKER_DONE"), "output was {output:?}");
        process.kill();
    }
}
