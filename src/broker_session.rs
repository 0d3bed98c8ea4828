//! One broker connection: protocol options building, the rumqttc event loop,
//! and a typed event stream for the connection manager.
//!
//! The session never drives its own lifecycle. It reports what the protocol
//! layer does (connack, publish, ping round-trips, errors) through a
//! `SessionEvent` channel and leaves every state decision to the caller.

use bytes::Bytes;
use rumqttc::v5;
use rumqttc::v5::mqttbytes::v5::{
    ConnectProperties, Filter, LastWill as LastWillV5, Packet as PacketV5,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::models::{Connection, ProtocolVersion, V5Properties};

/// Keep-alive interval; doubles as the latency sampling period since every
/// ping round-trip is timed.
const PING_INTERVAL: Duration = Duration::from_secs(5);
/// rumqttc request channel capacity.
const REQUEST_CAPACITY: usize = 100;
/// Session event channel capacity towards the manager.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("MQTT v5 client error: {0}")]
    ClientV5(#[from] v5::ClientError),
}

/// What the protocol layer reports upwards.
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Reconnecting,
    Disconnected,
    Message {
        topic: String,
        payload: Bytes,
        qos: u8,
        retained: bool,
    },
    Error(String),
    Latency(Duration),
}

enum SessionClient {
    V4(AsyncClient),
    V5(v5::AsyncClient),
}

/// A live broker connection. Dropping it does not stop the event loop; call
/// `disconnect`.
pub struct BrokerSession {
    client: SessionClient,
    event_loop: JoinHandle<()>,
}

impl BrokerSession {
    /// Builds protocol options from the connection record, spawns the event
    /// loop and returns the session handle plus its event stream.
    pub fn open(connection: &Connection) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let reconnect_period = Duration::from_millis(connection.reconnect_period_ms.max(1));

        let session = match connection.protocol_version {
            ProtocolVersion::V4 => {
                let options = build_v4_options(connection);
                let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
                event_loop
                    .network_options
                    .set_connection_timeout(connection.connect_timeout_secs);
                let task = tokio::spawn(run_v4(event_loop, events, reconnect_period));
                BrokerSession {
                    client: SessionClient::V4(client),
                    event_loop: task,
                }
            }
            ProtocolVersion::V5 => {
                let options = build_v5_options(connection);
                let (client, mut event_loop) = v5::AsyncClient::new(options, REQUEST_CAPACITY);
                let mut network_options = event_loop.options.network_options();
                network_options.set_connection_timeout(connection.connect_timeout_secs);
                event_loop.options.set_network_options(network_options);
                let task = tokio::spawn(run_v5(event_loop, events, reconnect_period));
                BrokerSession {
                    client: SessionClient::V5(client),
                    event_loop: task,
                }
            }
        };

        (session, events_rx)
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        qos: u8,
        retain_as_published: bool,
    ) -> Result<(), SessionError> {
        match &self.client {
            SessionClient::V4(client) => {
                client.subscribe(topic, qos_v4(qos)).await?;
            }
            SessionClient::V5(client) => {
                let mut filter = Filter::new(topic, qos_v5(qos));
                filter.preserve_retain = retain_as_published;
                client.subscribe_many([filter]).await?;
            }
        }
        Ok(())
    }

    pub async fn publish(
        &self,
        topic: &str,
        payload: String,
        qos: u8,
        retain: bool,
    ) -> Result<(), SessionError> {
        match &self.client {
            SessionClient::V4(client) => {
                client
                    .publish(topic, qos_v4(qos), retain, payload.into_bytes())
                    .await?;
            }
            SessionClient::V5(client) => {
                client
                    .publish(topic, qos_v5(qos), retain, Bytes::from(payload))
                    .await?;
            }
        }
        Ok(())
    }

    /// Idempotent hard stop. The event loop task owns the ping timer, so
    /// aborting it always stops latency sampling, connected or not.
    pub async fn disconnect(&self) {
        let result = match &self.client {
            SessionClient::V4(client) => client.disconnect().await.map_err(SessionError::from),
            SessionClient::V5(client) => client.disconnect().await.map_err(SessionError::from),
        };
        if let Err(e) = result {
            debug!("disconnect request not deliverable: {e}");
        }

        self.event_loop.abort();
    }
}

fn qos_v4(qos: u8) -> QoS {
    match qos {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

fn qos_v5(qos: u8) -> v5::mqttbytes::QoS {
    match qos {
        2 => v5::mqttbytes::QoS::ExactlyOnce,
        1 => v5::mqttbytes::QoS::AtLeastOnce,
        _ => v5::mqttbytes::QoS::AtMostOnce,
    }
}

fn build_v4_options(connection: &Connection) -> MqttOptions {
    let mut options = if connection.protocol.uses_websocket() {
        // rumqttc expects the full URL as the broker address for websockets.
        let mut options =
            MqttOptions::new(&connection.client_id, connection.broker_url(), connection.port);
        options.set_transport(if connection.protocol.is_secure() {
            Transport::wss_with_default_config()
        } else {
            Transport::Ws
        });
        options
    } else {
        let mut options =
            MqttOptions::new(&connection.client_id, &connection.hostname, connection.port);
        if connection.protocol.is_secure() {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    };

    options
        .set_keep_alive(PING_INTERVAL)
        .set_clean_session(connection.clean_session);

    if let Some(credentials) = &connection.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    if let Some(will) = &connection.last_will {
        options.set_last_will(rumqttc::LastWill::new(
            &will.topic,
            will.payload.clone(),
            qos_v4(will.qos),
            will.retain,
        ));
    }

    options
}

fn build_v5_options(connection: &Connection) -> v5::MqttOptions {
    let mut options = if connection.protocol.uses_websocket() {
        let mut options =
            v5::MqttOptions::new(&connection.client_id, connection.broker_url(), connection.port);
        options.set_transport(if connection.protocol.is_secure() {
            Transport::wss_with_default_config()
        } else {
            Transport::Ws
        });
        options
    } else {
        let mut options =
            v5::MqttOptions::new(&connection.client_id, &connection.hostname, connection.port);
        if connection.protocol.is_secure() {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    };

    options
        .set_keep_alive(PING_INTERVAL)
        .set_clean_start(connection.clean_session);

    if let Some(credentials) = &connection.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    options.set_connect_properties(connect_properties(
        connection.v5_properties.clone().unwrap_or_default(),
        connection.clean_session,
    ));

    if let Some(will) = &connection.last_will {
        options.set_last_will(LastWillV5 {
            topic: Bytes::from(will.topic.clone()),
            message: Bytes::from(will.payload.clone()),
            qos: qos_v5(will.qos),
            retain: will.retain,
            properties: None,
        });
    }

    options
}

/// v5 CONNECT properties. A session expiry the user never set defaults to
/// "persist indefinitely" for durable sessions and stays unset otherwise;
/// zero-valued limits are treated as unset.
fn connect_properties(properties: V5Properties, clean_session: bool) -> ConnectProperties {
    let session_expiry_interval = properties
        .session_expiry_interval
        .or_else(|| (!clean_session).then_some(u32::MAX));

    ConnectProperties {
        session_expiry_interval,
        receive_maximum: properties.receive_maximum.filter(|v| *v > 0),
        max_packet_size: properties.maximum_packet_size.filter(|v| *v > 0),
        topic_alias_max: None,
        request_response_info: None,
        request_problem_info: None,
        user_properties: properties.user_properties.into_iter().collect(),
        authentication_method: None,
        authentication_data: None,
    }
}

async fn run_v4(
    mut event_loop: rumqttc::EventLoop,
    events: mpsc::Sender<SessionEvent>,
    reconnect_period: Duration,
) {
    let mut ping_sent: Option<Instant> = None;

    loop {
        let event = match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => Some(SessionEvent::Connected),
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(SessionEvent::Message {
                topic: publish.topic.clone(),
                payload: publish.payload.clone(),
                qos: publish.qos as u8,
                retained: publish.retain,
            }),
            Ok(Event::Outgoing(Outgoing::PingReq)) => {
                ping_sent = Some(Instant::now());
                None
            }
            Ok(Event::Incoming(Packet::PingResp)) => ping_sent
                .take()
                .map(|sent| SessionEvent::Latency(sent.elapsed())),
            Ok(Event::Incoming(Packet::Disconnect)) => Some(SessionEvent::Disconnected),
            Ok(_) => None,
            Err(e) => {
                ping_sent = None;
                if events.send(SessionEvent::Error(e.to_string())).await.is_err() {
                    return;
                }
                if events.send(SessionEvent::Reconnecting).await.is_err() {
                    return;
                }
                sleep(reconnect_period).await;
                continue;
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

async fn run_v5(
    mut event_loop: v5::EventLoop,
    events: mpsc::Sender<SessionEvent>,
    reconnect_period: Duration,
) {
    let mut ping_sent: Option<Instant> = None;

    loop {
        let event = match event_loop.poll().await {
            Ok(v5::Event::Incoming(PacketV5::ConnAck(_))) => Some(SessionEvent::Connected),
            Ok(v5::Event::Incoming(PacketV5::Publish(publish))) => Some(SessionEvent::Message {
                topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                payload: publish.payload.clone(),
                qos: publish.qos as u8,
                retained: publish.retain,
            }),
            Ok(v5::Event::Outgoing(Outgoing::PingReq)) => {
                ping_sent = Some(Instant::now());
                None
            }
            Ok(v5::Event::Incoming(PacketV5::PingResp(_))) => ping_sent
                .take()
                .map(|sent| SessionEvent::Latency(sent.elapsed())),
            Ok(v5::Event::Incoming(PacketV5::Disconnect(_))) => Some(SessionEvent::Disconnected),
            Ok(_) => None,
            Err(e) => {
                ping_sent = None;
                if events.send(SessionEvent::Error(e.to_string())).await.is_err() {
                    return;
                }
                if events.send(SessionEvent::Reconnecting).await.is_err() {
                    return;
                }
                sleep(reconnect_period).await;
                continue;
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn durable_sessions_default_to_indefinite_expiry() {
        let props = connect_properties(V5Properties::default(), false);
        assert_eq!(props.session_expiry_interval, Some(u32::MAX));
    }

    #[test]
    fn clean_sessions_leave_expiry_unset() {
        let props = connect_properties(V5Properties::default(), true);
        assert_eq!(props.session_expiry_interval, None);
    }

    #[test]
    fn explicit_expiry_wins_over_the_default() {
        let properties = V5Properties {
            session_expiry_interval: Some(3600),
            ..Default::default()
        };
        let props = connect_properties(properties, false);
        assert_eq!(props.session_expiry_interval, Some(3600));
    }

    #[test]
    fn zero_limits_are_treated_as_unset() {
        let properties = V5Properties {
            receive_maximum: Some(0),
            maximum_packet_size: Some(0),
            ..Default::default()
        };
        let props = connect_properties(properties, true);
        assert_eq!(props.receive_maximum, None);
        assert_eq!(props.max_packet_size, None);
    }

    #[test]
    fn user_properties_are_merged() {
        let mut user_properties = HashMap::new();
        user_properties.insert("app".to_string(), "topicscope".to_string());

        let properties = V5Properties {
            user_properties,
            ..Default::default()
        };
        let props = connect_properties(properties, true);
        assert_eq!(
            props.user_properties,
            vec![("app".to_string(), "topicscope".to_string())]
        );
    }

    #[test]
    fn qos_levels_map_to_protocol_values() {
        assert_eq!(qos_v4(0), QoS::AtMostOnce);
        assert_eq!(qos_v4(1), QoS::AtLeastOnce);
        assert_eq!(qos_v4(2), QoS::ExactlyOnce);
        // Out-of-range values degrade to the weakest guarantee.
        assert_eq!(qos_v4(7), QoS::AtMostOnce);
    }
}
