//! Command catalog: per-system start commands and named step templates.

use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Command templates keyed by system and step name.
///
/// Every system listed here is implicitly allowed as a session identifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandCatalog {
    #[serde(default)]
    pub systems: BTreeMap<String, SystemCommands>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepCommand>,
}

impl CommandCatalog {
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let raw = std::fs::read_to_string(path).map_err(|source| BrokerError::CatalogRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| BrokerError::CatalogParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn system_ids(&self) -> impl Iterator<Item = &str> {
        self.systems.keys().map(String::as_str)
    }

    pub fn start_command(&self, system: &str) -> Option<&str> {
        self.systems
            .get(system)
            .and_then(|s| s.start_command.as_deref())
            .filter(|c| !c.trim().is_empty())
    }

    /// Step templates shadow system start commands with the same key.
    pub fn template(&self, key: &str) -> Option<&str> {
        self.steps
            .get(key)
            .map(|s| s.command.as_str())
            .or_else(|| self.start_command(key))
    }
}
