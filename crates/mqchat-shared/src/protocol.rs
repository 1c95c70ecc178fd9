use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Seconds since the Unix epoch, with microsecond precision.
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn unknown_user() -> String {
    "Unknown".to_string()
}

/// Plaintext of one chat message, encrypted before it reaches the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEnvelope {
    #[serde(default = "unknown_user")]
    pub user: String,
    #[serde(default)]
    pub message: String,
    /// Sender clock, seconds since epoch. Peers' clocks are independent.
    #[serde(default = "now_secs")]
    pub timestamp: f64,
}

impl ChatEnvelope {
    pub fn new(user: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            message: message.into(),
            timestamp: now_secs(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    /// Missing or unrecognised; ignored apart from a list refresh.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Retained per-user presence record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEnvelope {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub status: PresenceStatus,
    #[serde(default = "now_secs")]
    pub timestamp: f64,
}

impl PresenceEnvelope {
    pub fn online(user: impl Into<String>) -> Self {
        Self::with_status(user, PresenceStatus::Online)
    }

    pub fn offline(user: impl Into<String>) -> Self {
        Self::with_status(user, PresenceStatus::Offline)
    }

    fn with_status(user: impl Into<String>, status: PresenceStatus) -> Self {
        Self {
            user: user.into(),
            status,
            timestamp: now_secs(),
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a presence payload published on `topic_user`'s topic.
    ///
    /// The payload's `user` must match the topic segment it arrived on.
    pub fn parse_for(topic_user: &str, payload: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_slice(payload)?;
        if envelope.user != topic_user {
            return Err(ProtocolError::UserMismatch {
                topic_user: topic_user.to_string(),
                payload_user: envelope.user,
            });
        }
        Ok(envelope)
    }
}
