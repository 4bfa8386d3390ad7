//! HTTP endpoints served next to the terminal socket.

use crate::error::ClientError;
use serde::Deserialize;
use std::collections::BTreeMap;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub status: String,
    pub active_sessions: usize,
    #[serde(default)]
    pub sessions: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemTemplate {
    pub start_command: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTemplate {
    pub command: String,
    pub system: Option<String>,
    pub description: Option<String>,
}

/// Command templates published by `/config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandTemplates {
    #[serde(default)]
    pub systems: BTreeMap<String, SystemTemplate>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepTemplate>,
}

impl CommandTemplates {
    /// Step command by name, falling back to a system's start command.
    pub fn command(&self, key: &str) -> Option<&str> {
        self.steps
            .get(key)
            .map(|s| s.command.as_str())
            .or_else(|| self.systems.get(key)?.start_command.as_deref())
    }
}

#[derive(Clone)]
pub struct BrokerHttpClient {
    base: Url,
    client: reqwest::Client,
}

impl BrokerHttpClient {
    pub fn new(base: &str) -> Result<Self, ClientError> {
        let base = Url::parse(base).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            base,
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))
    }

    pub async fn health(&self) -> Result<Health, ClientError> {
        let resp = self.client.get(self.url("/health")?).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }

    pub async fn command_templates(&self) -> Result<CommandTemplates, ClientError> {
        let resp = self.client.get(self.url("/config")?).send().await?;
        Ok(resp.error_for_status()?.json().await?)
    }
}
