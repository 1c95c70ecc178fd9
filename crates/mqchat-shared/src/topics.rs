use crate::constants::{RESERVED_NAME_CHARS, TOPIC_ROOT};
use crate::error::ProtocolError;

/// What an inbound topic carries, relative to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// Encrypted chat payload.
    Chat,
    /// Presence payload for the named user (last topic segment).
    Presence(String),
    /// Not ours.
    Unrelated,
}

/// Topic names for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    channel: String,
    messages: String,
    presence_root: String,
}

/// Reject names that cannot be used as a single topic segment.
pub fn validate_name(kind: &str, name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::InvalidName(format!("{kind} must not be empty")));
    }
    if name.contains(RESERVED_NAME_CHARS) {
        return Err(ProtocolError::InvalidName(format!(
            "{kind} must not contain '/', '+' or '#'"
        )));
    }
    Ok(())
}

impl TopicScheme {
    pub fn new(channel: &str) -> Result<Self, ProtocolError> {
        validate_name("channel", channel)?;
        Ok(Self {
            channel: channel.to_string(),
            messages: format!("{TOPIC_ROOT}/{channel}/messages"),
            presence_root: format!("{TOPIC_ROOT}/{channel}/presence"),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn messages_topic(&self) -> &str {
        &self.messages
    }

    pub fn presence_root_topic(&self) -> &str {
        &self.presence_root
    }

    pub fn presence_topic_for(&self, user: &str) -> String {
        format!("{}/{user}", self.presence_root)
    }

    /// Subscription filter matching every user's presence topic.
    pub fn presence_wildcard(&self) -> String {
        format!("{}/+", self.presence_root)
    }

    pub fn classify(&self, topic: &str) -> TopicKind {
        if topic == self.messages {
            return TopicKind::Chat;
        }
        if topic.starts_with(&self.presence_root) {
            let user = topic.rsplit('/').next().unwrap_or_default();
            return TopicKind::Presence(user.to_string());
        }
        TopicKind::Unrelated
    }
}
