use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Transport scheme of a broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Mqtts,
    Ws,
    Wss,
}

impl Protocol {
    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::Mqtts | Protocol::Wss)
    }

    pub fn uses_websocket(self) -> bool {
        matches!(self, Protocol::Ws | Protocol::Wss)
    }

    pub fn scheme(self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::Mqtts => "mqtts",
            Protocol::Ws => "ws",
            Protocol::Wss => "wss",
        }
    }
}

/// MQTT protocol revision, stored as the wire version number (4 or 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProtocolVersion {
    #[default]
    V4,
    V5,
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            4 => Ok(ProtocolVersion::V4),
            5 => Ok(ProtocolVersion::V5),
            other => Err(format!("unsupported MQTT protocol version: {other}")),
        }
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(version: ProtocolVersion) -> Self {
        match version {
            ProtocolVersion::V4 => 4,
            ProtocolVersion::V5 => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedTopic {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWillConfig {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// MQTT v5 connect properties the user may set explicitly.
///
/// Unset numeric limits are omitted from the CONNECT packet rather than sent
/// as zero; see `broker_session::connect_properties` for the defaulting rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V5Properties {
    pub session_expiry_interval: Option<u32>,
    pub receive_maximum: Option<u16>,
    pub maximum_packet_size: Option<u32>,
    #[serde(default)]
    pub user_properties: HashMap<String, String>,
}

/// One configured broker connection, identified by `client_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub client_key: String,
    #[serde(default)]
    pub name: String,
    pub protocol: Protocol,
    pub hostname: String,
    #[serde(default)]
    pub path: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub protocol_version: ProtocolVersion,
    #[serde(default)]
    pub subscribed_topics: Vec<SubscribedTopic>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period_ms: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default)]
    pub last_will: Option<LastWillConfig>,
    #[serde(default)]
    pub v5_properties: Option<V5Properties>,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_reconnect_period() -> u64 {
    5000
}

fn default_clean_session() -> bool {
    true
}

impl Connection {
    /// URL path component. Bare TCP schemes have none; websocket schemes use
    /// whatever the user configured.
    pub fn broker_path(&self) -> &str {
        if self.protocol.uses_websocket() {
            &self.path
        } else {
            ""
        }
    }

    pub fn broker_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol.scheme(),
            self.hostname,
            self.port,
            self.broker_path()
        )
    }
}

/// Lifecycle state of one broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Best-effort guess at the payload's content type, used by the UI to pick a
/// formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    Raw,
    Json,
    Xml,
}

impl PayloadType {
    pub fn guess(payload: &str) -> Self {
        if serde_json::from_str::<serde_json::Value>(payload).is_ok() {
            return PayloadType::Json;
        }

        let trimmed = payload.trim();
        if trimmed.starts_with('<') && trimmed.ends_with('>') {
            return PayloadType::Xml;
        }

        PayloadType::Raw
    }
}

/// One observed message, owned by the topic index.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub uid: Uuid,
    pub payload: String,
    pub qos: u8,
    pub retained: bool,
    pub content_type: PayloadType,
    pub created_at: DateTime<Utc>,
    /// Milliseconds since the previous message on the same topic. `None` for
    /// the first message.
    pub created_diff_ms: Option<i64>,
}

impl Message {
    pub fn new(payload: String, qos: u8, retained: bool) -> Self {
        let content_type = PayloadType::guess(&payload);

        Message {
            uid: Uuid::new_v4(),
            payload,
            qos,
            retained,
            content_type,
            created_at: Utc::now(),
            created_diff_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(protocol: Protocol, path: &str) -> Connection {
        Connection {
            client_key: "c1".to_string(),
            name: String::new(),
            protocol,
            hostname: "broker.example".to_string(),
            path: path.to_string(),
            port: 1883,
            client_id: "tester".to_string(),
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

    #[test]
    fn bare_tcp_schemes_have_no_path() {
        let conn = connection(Protocol::Mqtt, "/mqtt");
        assert_eq!(conn.broker_path(), "");
        assert_eq!(conn.broker_url(), "mqtt://broker.example:1883");
    }

    #[test]
    fn websocket_schemes_keep_the_user_path() {
        let conn = connection(Protocol::Wss, "/mqtt");
        assert_eq!(conn.broker_path(), "/mqtt");
        assert_eq!(conn.broker_url(), "wss://broker.example:1883/mqtt");
    }

    #[test]
    fn protocol_version_parses_from_wire_number() {
        assert_eq!(ProtocolVersion::try_from(4), Ok(ProtocolVersion::V4));
        assert_eq!(ProtocolVersion::try_from(5), Ok(ProtocolVersion::V5));
        assert!(ProtocolVersion::try_from(3).is_err());
    }

    #[test]
    fn connection_deserializes_with_defaults() {
        let conn: Connection = serde_json::from_str(
            r#"{
                "clientKey": "home",
                "protocol": "mqtt",
                "hostname": "broker.local",
                "port": 1883,
                "clientId": "topicscope-1"
            }"#,
        )
        .unwrap();

        assert_eq!(conn.client_key, "home");
        assert_eq!(conn.protocol_version, ProtocolVersion::V4);
        assert!(conn.clean_session);
        assert_eq!(conn.connect_timeout_secs, 30);
        assert_eq!(conn.reconnect_period_ms, 5000);
        assert!(conn.subscribed_topics.is_empty());
    }

    #[test]
    fn payload_type_guess() {
        assert_eq!(PayloadType::guess(r#"{"a": 1}"#), PayloadType::Json);
        assert_eq!(PayloadType::guess("<root><a/></root>"), PayloadType::Xml);
        assert_eq!(PayloadType::guess("21.5 degrees"), PayloadType::Raw);
    }
}
