//! Shared application state.

use crate::catalog::CommandCatalog;
use crate::config::BrokerConfig;
use crate::process::SpawnOptions;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<BrokerConfig>,
    pub catalog: Arc<CommandCatalog>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(config: BrokerConfig, catalog: CommandCatalog) -> Self {
        let registry = SessionRegistry::new(SpawnOptions::from_config(&config), config.startup_delay);
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            config: Arc::new(config),
            catalog: Arc::new(catalog),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Tells every open connection to close.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
