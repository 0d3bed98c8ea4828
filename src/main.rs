mod actions_cache;
mod broker_session;
mod config;
mod connection_manager;
mod models;
mod registry;
mod topic_index;
mod topic_matcher;

use crate::config::{Config, Workspace};
use crate::connection_manager::{ConnectionManager, ManagerEvent};
use crate::registry::Registry;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let workspace = match Workspace::load(&config.workspace_file) {
        Ok(workspace) => workspace,
        Err(e) => {
            warn!("Could not load workspace, starting empty: {:?}", e);
            Workspace::default()
        }
    };
    info!(
        connections = workspace.connections.len(),
        actions = workspace.actions.len(),
        "workspace loaded"
    );

    let registry = Arc::new(Registry::new(config.max_messages));
    let manager = Arc::new(ConnectionManager::new(registry.clone()));

    for action in &workspace.actions {
        registry.add_action_topic(&action.client_key, &action.topic).await;
    }

    // Log the event bus so broker activity is visible on the console.
    let mut events = manager.subscribe();
    let observer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ManagerEvent::Status { client_key, state }) => {
                    info!(client_key, ?state, "connection status");
                }
                Ok(ManagerEvent::Error { client_key, error }) => {
                    warn!(client_key, error, "connection error");
                }
                Ok(ManagerEvent::Message { client_key, topic, .. }) => {
                    info!(client_key, topic, "message received");
                }
                Ok(ManagerEvent::Latency { client_key, round_trip_ms }) => {
                    info!(client_key, round_trip_ms, "broker latency");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event observer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    for connection in workspace.connections {
        manager.connect(connection).await;
    }

    // Run until interrupted
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {:?}", e);
    }

    info!("Shutting down...");
    manager.disconnect_all().await;
    observer.abort();
    info!("All connections shut down successfully.");
}
