//! Owns every broker session and its lifecycle state.
//!
//! One manager per application. Each connect spawns a session plus a
//! forwarding task that translates protocol events into state transitions,
//! registry updates and bus events. Consumers subscribe to the broadcast bus;
//! a lagging or dropped receiver never blocks the forwarders.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::broker_session::{BrokerSession, SessionError, SessionEvent};
use crate::models::{Connection, ConnectionState, Message};
use crate::registry::Registry;

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no active session for client key '{0}'")]
    NotConnected(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// What the manager broadcasts to the application.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Status {
        client_key: String,
        state: ConnectionState,
    },
    Error {
        client_key: String,
        error: String,
    },
    Message {
        client_key: String,
        topic: String,
        payload: String,
        qos: u8,
        retained: bool,
    },
    Latency {
        client_key: String,
        round_trip_ms: u64,
    },
}

pub struct ConnectionManager {
    registry: Arc<Registry>,
    sessions: Mutex<HashMap<String, BrokerSession>>,
    states: Mutex<HashMap<String, ConnectionState>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<Registry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        ConnectionManager {
            registry,
            sessions: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self, client_key: &str) -> ConnectionState {
        self.states
            .lock()
            .await
            .get(client_key)
            .copied()
            .unwrap_or_default()
    }

    /// Opens a session for the connection. A second connect while the first
    /// is still establishing is ignored. `.local` hostnames are resolved to
    /// an IPv4 address up front since mDNS answers tend to confuse the OS
    /// resolver mid-handshake; a failed lookup aborts the attempt.
    pub async fn connect(self: &Arc<Self>, mut connection: Connection) {
        let client_key = connection.client_key.clone();

        {
            let mut states = self.states.lock().await;
            if states.get(&client_key) == Some(&ConnectionState::Connecting) {
                debug!(client_key, "connect already in progress, ignoring");
                return;
            }
            states.insert(client_key.clone(), ConnectionState::Connecting);
        }
        self.broadcast_status(&client_key, ConnectionState::Connecting);

        if connection.hostname.ends_with(".local") {
            match resolve_ipv4(&connection.hostname, connection.port).await {
                Ok(address) => {
                    info!(client_key, host = %connection.hostname, %address, "resolved mDNS host");
                    connection.hostname = address.ip().to_string();
                }
                Err(e) => {
                    let error = format!("could not resolve '{}': {e}", connection.hostname);
                    warn!(client_key, error, "aborting connect");
                    self.states
                        .lock()
                        .await
                        .insert(client_key.clone(), ConnectionState::Disconnected);
                    let _ = self.events.send(ManagerEvent::Error {
                        client_key: client_key.clone(),
                        error,
                    });
                    self.broadcast_status(&client_key, ConnectionState::Disconnected);
                    return;
                }
            }
        }

        let (session, session_events) = BrokerSession::open(&connection);

        for subscription in &connection.subscribed_topics {
            if let Err(e) = session
                .subscribe(&subscription.topic, subscription.qos, false)
                .await
            {
                warn!(client_key, topic = %subscription.topic, "subscribe failed: {e}");
            }
        }

        let previous = self.sessions.lock().await.insert(client_key.clone(), session);
        if let Some(previous) = previous {
            previous.disconnect().await;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.forward_session_events(client_key, session_events).await;
        });
    }

    /// Tears the session down and forgets its state. Safe to call for keys
    /// that were never connected.
    pub async fn disconnect(&self, client_key: &str) {
        let session = self.sessions.lock().await.remove(client_key);
        if let Some(session) = session {
            session.disconnect().await;
            info!(client_key, "disconnected");
        }

        self.states
            .lock()
            .await
            .insert(client_key.to_string(), ConnectionState::Disconnected);
        self.broadcast_status(client_key, ConnectionState::Disconnected);
    }

    pub async fn disconnect_all(&self) {
        let keys: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for key in keys {
            self.disconnect(&key).await;
        }
    }

    pub async fn subscribe_topic(
        &self,
        client_key: &str,
        topic: &str,
        qos: u8,
        retain_as_published: bool,
    ) -> Result<(), ConnectionError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(client_key)
            .ok_or_else(|| ConnectionError::NotConnected(client_key.to_string()))?;
        session.subscribe(topic, qos, retain_as_published).await?;
        Ok(())
    }

    /// Publishes and records the message in the per-connection publish
    /// history.
    pub async fn publish(
        &self,
        client_key: &str,
        topic: &str,
        payload: String,
        qos: u8,
        retain: bool,
    ) -> Result<(), ConnectionError> {
        {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(client_key)
                .ok_or_else(|| ConnectionError::NotConnected(client_key.to_string()))?;
            session.publish(topic, payload.clone(), qos, retain).await?;
        }

        self.registry
            .record_publish(client_key, topic, Message::new(payload, qos, retain))
            .await;
        Ok(())
    }

    async fn forward_session_events(
        self: Arc<Self>,
        client_key: String,
        mut session_events: mpsc::Receiver<SessionEvent>,
    ) {
        while let Some(event) = session_events.recv().await {
            match event {
                SessionEvent::Connected => {
                    self.set_state(&client_key, ConnectionState::Connected).await;
                }
                SessionEvent::Reconnecting => {
                    self.set_state(&client_key, ConnectionState::Reconnecting).await;
                }
                // Terminal transitions happen through explicit disconnect;
                // a broker-initiated DISCONNECT is followed by a poll error
                // that moves the state to reconnecting.
                SessionEvent::Disconnected => {}
                SessionEvent::Message {
                    topic,
                    payload,
                    qos,
                    retained,
                } => {
                    let payload = String::from_utf8_lossy(&payload).into_owned();
                    let message = Message::new(payload.clone(), qos, retained);
                    self.registry.record_message(&client_key, &topic, message).await;
                    let _ = self.events.send(ManagerEvent::Message {
                        client_key: client_key.clone(),
                        topic,
                        payload,
                        qos,
                        retained,
                    });
                }
                SessionEvent::Error(error) => {
                    warn!(client_key, "session error: {error}");
                    let _ = self.events.send(ManagerEvent::Error {
                        client_key: client_key.clone(),
                        error,
                    });
                }
                SessionEvent::Latency(round_trip) => {
                    let _ = self.events.send(ManagerEvent::Latency {
                        client_key: client_key.clone(),
                        round_trip_ms: round_trip.as_millis() as u64,
                    });
                }
            }
        }

        debug!(client_key, "session event stream closed");
    }

    async fn set_state(&self, client_key: &str, state: ConnectionState) {
        self.states
            .lock()
            .await
            .insert(client_key.to_string(), state);
        self.broadcast_status(client_key, state);
    }

    fn broadcast_status(&self, client_key: &str, state: ConnectionState) {
        let _ = self.events.send(ManagerEvent::Status {
            client_key: client_key.to_string(),
            state,
        });
    }
}

async fn resolve_ipv4(hostname: &str, port: u16) -> std::io::Result<SocketAddr> {
    lookup_host((hostname, port))
        .await?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no IPv4 address for '{hostname}'"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Protocol, ProtocolVersion};

    fn connection(client_key: &str, hostname: &str) -> Connection {
        Connection {
            client_key: client_key.to_string(),
            name: String::new(),
            protocol: Protocol::Mqtt,
            hostname: hostname.to_string(),
            path: String::new(),
            port: 1883,
            client_id: format!("{client_key}-test"),
            credentials: None,
            protocol_version: ProtocolVersion::V4,
            subscribed_topics: Vec::new(),
            connect_timeout_secs: 30,
            reconnect_period_ms: 5000,
            clean_session: true,
            last_will: None,
            v5_properties: None,
        }
    }

    #[tokio::test]
    async fn second_connect_while_connecting_is_ignored() {
        let registry = Arc::new(Registry::new(10));
        let manager = Arc::new(ConnectionManager::new(registry));
        let mut events = manager.subscribe();

        // 192.0.2.1 never answers, so the first attempt stays in connecting.
        manager.connect(connection("c1", "192.0.2.1")).await;
        manager.connect(connection("c1", "192.0.2.1")).await;

        assert_eq!(manager.state("c1").await, ConnectionState::Connecting);

        let first = events.try_recv().unwrap();
        assert!(matches!(
            first,
            ManagerEvent::Status {
                state: ConnectionState::Connecting,
                ..
            }
        ));
        // The duplicate connect produced no second status event.
        assert!(events.try_recv().is_err());

        manager.disconnect("c1").await;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let registry = Arc::new(Registry::new(10));
        let manager = Arc::new(ConnectionManager::new(registry));

        manager.disconnect("never-connected").await;
        manager.disconnect("never-connected").await;

        assert_eq!(
            manager.state("never-connected").await,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn failed_mdns_lookup_aborts_the_connect() {
        let registry = Arc::new(Registry::new(10));
        let manager = Arc::new(ConnectionManager::new(registry));
        let mut events = manager.subscribe();

        manager
            .connect(connection("c1", "definitely-not-a-real-host.local"))
            .await;

        assert_eq!(manager.state("c1").await, ConnectionState::Disconnected);

        // connecting status, then the error, then disconnected status.
        let mut saw_error = false;
        let mut saw_disconnected = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ManagerEvent::Error { .. } => saw_error = true,
                ManagerEvent::Status {
                    state: ConnectionState::Disconnected,
                    ..
                } => saw_disconnected = true,
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(saw_disconnected);

        assert!(manager.sessions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn publish_without_a_session_is_an_error() {
        let registry = Arc::new(Registry::new(10));
        let manager = Arc::new(ConnectionManager::new(registry));

        let result = manager
            .publish("ghost", "cmd/light", "on".to_string(), 0, false)
            .await;
        assert!(matches!(result, Err(ConnectionError::NotConnected(_))));
    }
}
