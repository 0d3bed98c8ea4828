use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::Connection;

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_file: PathBuf,
    pub max_messages: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
    #[error("Workspace error: {0}")]
    Workspace(String),
}

impl Config {
    /// Validate retention bounds before anything is cached.
    fn validate_retention(&self) -> Result<(), ConfigError> {
        const MIN_MESSAGES: usize = 1;
        const MAX_MESSAGES: usize = 100_000;

        if !(MIN_MESSAGES..=MAX_MESSAGES).contains(&self.max_messages) {
            return Err(ConfigError::ParsingError(format!(
                "MAX_MESSAGES must be between {} and {}",
                MIN_MESSAGES, MAX_MESSAGES
            )));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let config = Self {
            workspace_file: env::var("WORKSPACE_FILE")
                .unwrap_or_else(|_| "workspace.json".to_string())
                .into(),
            max_messages: env::var("MAX_MESSAGES")
                .unwrap_or_else(|_| "100".to_string())
                .parse::<usize>()
                .map_err(|_| {
                    ConfigError::ParsingError("MAX_MESSAGES must be a valid number".to_string())
                })?,
        };

        config.validate_retention()?;

        Ok(config)
    }
}

/// A user-declared action: a named publish shortcut bound to one topic of one
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    pub client_key: String,
    pub name: String,
    pub topic: String,
}

/// The persisted workspace: every configured connection plus the actions
/// declared on their topics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

impl Workspace {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Workspace(format!("{}: {e}", path.display())))?;

        serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Workspace(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_parses_connections_and_actions() {
        let workspace: Workspace = serde_json::from_str(
            r#"{
                "connections": [{
                    "clientKey": "home",
                    "protocol": "mqtt",
                    "hostname": "broker.local",
                    "port": 1883,
                    "clientId": "topicscope-1"
                }],
                "actions": [{
                    "clientKey": "home",
                    "name": "All lights off",
                    "topic": "home/+/light"
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(workspace.connections.len(), 1);
        assert_eq!(workspace.actions[0].topic, "home/+/light");
    }

    #[test]
    fn empty_workspace_is_valid() {
        let workspace: Workspace = serde_json::from_str("{}").unwrap();
        assert!(workspace.connections.is_empty());
        assert!(workspace.actions.is_empty());
    }

    #[test]
    fn retention_bounds_are_enforced() {
        let config = Config {
            workspace_file: "workspace.json".into(),
            max_messages: 0,
        };
        assert!(config.validate_retention().is_err());

        let config = Config {
            workspace_file: "workspace.json".into(),
            max_messages: 100,
        };
        assert!(config.validate_retention().is_ok());
    }
}
