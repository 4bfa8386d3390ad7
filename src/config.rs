//! Environment-driven broker configuration.

use crate::error::BrokerError;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_STARTUP_DELAY_MS: u64 = 300;

/// Options of the `serve` subcommand. Every flag can also come from the environment.
#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Host to bind
    #[arg(long, env = "BROKER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "BROKER_PORT", default_value = "8080")]
    pub port: u16,

    /// Shared secret clients must pass as `token`
    #[arg(long, env = "BROKER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Extra session identifiers to accept (comma separated)
    #[arg(long, env = "BROKER_ALLOWED_SESSIONS", value_delimiter = ',')]
    pub allowed_sessions: Vec<String>,

    /// Honor the `initialCommand` query parameter
    #[arg(long, env = "BROKER_ALLOW_INITIAL_COMMAND")]
    pub allow_initial_command: bool,

    /// Shell executable (defaults to $SHELL, then /bin/sh)
    #[arg(long, env = "BROKER_SHELL")]
    pub shell: Option<String>,

    /// Spawn shells behind a pseudo-terminal
    #[arg(long = "pty", env = "BROKER_USE_PTY")]
    pub use_pty: bool,

    /// JSON file with per-system start commands and step templates
    #[arg(long = "commands", env = "BROKER_COMMANDS_FILE")]
    pub commands_file: Option<PathBuf>,

    /// Delay before the initial command is written to a new shell
    #[arg(long, env = "BROKER_STARTUP_DELAY_MS", default_value_t = DEFAULT_STARTUP_DELAY_MS)]
    pub startup_delay_ms: u64,

    /// Working directory for spawned shells (defaults to the home directory)
    #[arg(long, env = "BROKER_CWD")]
    pub cwd: Option<PathBuf>,
}

/// Resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub allowed_sessions: BTreeSet<String>,
    pub allow_initial_command: bool,
    pub shell: String,
    pub use_pty: bool,
    pub commands_file: Option<PathBuf>,
    pub startup_delay: Duration,
    pub cwd: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            token: None,
            allowed_sessions: BTreeSet::new(),
            allow_initial_command: false,
            shell: resolve_shell(None),
            use_pty: false,
            commands_file: None,
            startup_delay: Duration::from_millis(DEFAULT_STARTUP_DELAY_MS),
            cwd: resolve_cwd(None),
        }
    }
}

impl BrokerConfig {
    pub fn from_args(args: ServeArgs) -> Result<Self, BrokerError> {
        if args.host.trim().is_empty() {
            return Err(BrokerError::Config("host must not be empty".to_string()));
        }
        if let Some(cwd) = &args.cwd {
            if !cwd.is_dir() {
                return Err(BrokerError::Config(format!(
                    "working directory {} does not exist",
                    cwd.display()
                )));
            }
        }

        let allowed_sessions = args
            .allowed_sessions
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            host: args.host,
            port: args.port,
            token: args.token.filter(|t| !t.is_empty()),
            allowed_sessions,
            allow_initial_command: args.allow_initial_command,
            shell: resolve_shell(args.shell),
            use_pty: args.use_pty,
            commands_file: args.commands_file,
            startup_delay: Duration::from_millis(args.startup_delay_ms),
            cwd: resolve_cwd(args.cwd),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Explicit override, then `$SHELL`, then the platform default.
pub fn resolve_shell(shell: Option<String>) -> String {
    shell
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| DEFAULT_SHELL.to_string())
}

fn resolve_cwd(cwd: Option<PathBuf>) -> PathBuf {
    cwd.or_else(dirs::home_dir)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"))
}
