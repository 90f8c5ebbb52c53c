/*!
 * Broker abstraction: the seam between the publish pipeline and a concrete
 * message bus SDK.
 *
 * A `BrokerConnector` opens connections to a namespace. A connection hands
 * out `EntitySender`s for individual queues or topics. Connections and
 * senders are both `Closeable`, so they can live in a `ResourcePool` and a
 * `KeyedClientCache` respectively.
 */

pub mod error;
pub mod memory;

pub use error::BrokerError;

use async_trait::async_trait;
use busguard_core_resilience::Closeable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Connection settings for one broker namespace
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Namespace name, e.g. `orders-prod`
    #[serde(alias = "Namespace")]
    pub name: String,

    /// Connection string or endpoint credentials
    #[serde(alias = "ConnectionString")]
    pub connection_string: String,
}

impl NamespaceConfig {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
        }
    }
}

// Keep credentials out of logs
impl fmt::Debug for NamespaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceConfig")
            .field("name", &self.name)
            .field("connection_string", &"<redacted>")
            .finish()
    }
}

/// An outbound message. The payload is opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id
    pub id: String,

    /// Target queue or topic name
    pub entity: String,

    /// Identity of the publishing service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,

    /// Application properties, passed through unmodified
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl Message {
    /// Create a message with a fresh random id
    pub fn new(entity: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity: entity.into(),
            publisher: None,
            payload: payload.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Check the routing metadata the pipeline depends on
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("message id is empty".to_string());
        }
        if self.entity.trim().is_empty() {
            return Err(format!("message {} has no target entity", self.id));
        }
        Ok(())
    }
}

mod payload_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Opens live connections to a broker namespace
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(&self, namespace: &NamespaceConfig) -> Result<Self::Connection, BrokerError>;
}

/// A live connection to one namespace
#[async_trait]
pub trait BrokerConnection: Closeable<Error = BrokerError> {
    type Sender: EntitySender;

    /// Open a sender for a queue or topic
    async fn create_sender(&self, entity: &str) -> Result<Self::Sender, BrokerError>;

    fn namespace(&self) -> &str;
}

/// Sends messages to a single queue or topic
#[async_trait]
pub trait EntitySender: Closeable<Error = BrokerError> {
    async fn send(&self, message: &Message) -> Result<(), BrokerError>;

    fn entity(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_gets_unique_id() {
        let a = Message::new("orders", b"{}".to_vec());
        let b = Message::new("orders", b"{}".to_vec());
        assert_ne!(a.id, b.id);
        assert!(uuid::Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(Message::new("orders", Vec::new()).validate().is_ok());
        assert!(Message::new("  ", Vec::new()).validate().is_err());
        assert!(Message::new("orders", Vec::new())
            .with_id("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_payload_serializes_as_base64() {
        let message = Message::new("orders", b"hello".to_vec())
            .with_id("m-1")
            .with_publisher("billing")
            .with_property("tenant", "acme");

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["payload"], "aGVsbG8=");
        assert_eq!(json["properties"]["tenant"], "acme");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_namespace_debug_redacts_secret() {
        let ns = NamespaceConfig::new("orders-prod", "Endpoint=sb://x;SharedAccessKey=secret");
        let rendered = format!("{:?}", ns);
        assert!(rendered.contains("orders-prod"));
        assert!(!rendered.contains("secret"));
    }
}
