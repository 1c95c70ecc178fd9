//! The pub/sub relay as seen by the chat core.
//!
//! A [`Connector`] opens a connection and hands back a [`Broker`] handle for
//! outbound operations plus a channel of [`BrokerEvent`]s. Handle methods only
//! enqueue work, so they are safe to call while holding a lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use mqchat_shared::constants::DEFAULT_KEEP_ALIVE_SECS;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker client error: {0}")]
    Client(String),

    #[error("Connection closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Connection options
// ---------------------------------------------------------------------------

/// Broker account, distinct from the chat username.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Message the broker publishes on our behalf if we vanish without a clean
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub last_will: Option<LastWill>,
    pub keep_alive: Duration,
}

impl BrokerOptions {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            credentials: None,
            last_will: None,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
        }
    }
}

// ---------------------------------------------------------------------------
// Events / handles
// ---------------------------------------------------------------------------

/// Events delivered from the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The broker accepted the connection.
    Connected,
    /// The broker refused the connection or it never came up.
    ConnectionFailed(String),
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// An established connection ended.
    Disconnected { reason: Option<String> },
}

/// Outbound half of a broker connection.
pub trait Broker: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError>;

    fn subscribe(&self, filter: &str) -> Result<(), BrokerError>;

    /// Close the connection without triggering the last will.
    fn disconnect(&self) -> Result<(), BrokerError>;
}

/// Opens broker connections. Returns immediately; the outcome arrives as
/// [`BrokerEvent::Connected`] or [`BrokerEvent::ConnectionFailed`].
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        options: BrokerOptions,
    ) -> Result<(Arc<dyn Broker>, mpsc::UnboundedReceiver<BrokerEvent>), BrokerError>;
}

/// MQTT topic filter matching with `+` (one level) and `#` (remaining levels).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("chat/general/messages", "chat/general/messages"));
        assert!(!topic_matches("chat/general/messages", "chat/general/presence"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("chat/general/presence/+", "chat/general/presence/alice"));
        assert!(!topic_matches("chat/general/presence/+", "chat/general/presence"));
        assert!(!topic_matches("chat/general/presence/+", "chat/general/presence/a/b"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("chat/#", "chat/general/presence/alice"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("chat/#", "other/general"));
    }
}
