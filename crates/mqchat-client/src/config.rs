//! Client configuration loaded from environment variables.
//!
//! Every timing knob defaults to the value the desktop and mobile clients use,
//! so peers running different implementations behave alike.

use std::fmt;
use std::time::Duration;

use mqchat_shared::constants::{
    DEFAULT_BROKER_PORT, DEFAULT_DISCONNECT_GRACE_MS, DEFAULT_HEARTBEAT_SECS,
    DEFAULT_JOIN_DEBOUNCE_SECS, DEFAULT_KEEP_ALIVE_SECS,
};

use crate::session::ConnectParams;

/// Timing behaviour of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How often the session re-announces itself online.
    /// Env: `MQCHAT_HEARTBEAT_SECS`
    pub heartbeat_interval: Duration,

    /// Minimum spacing between two "joined" notices for the same user.
    /// Env: `MQCHAT_JOIN_DEBOUNCE_SECS`
    pub join_debounce: Duration,

    /// Pause between announcing offline and clearing retained presence.
    /// Env: `MQCHAT_DISCONNECT_GRACE_MS`
    pub disconnect_grace: Duration,

    /// Evict users silent for this long. `None` relies on explicit leave
    /// signals and last wills only.
    /// Env: `MQCHAT_STALE_AFTER_SECS`
    pub stale_after: Option<Duration>,

    /// Drop chat tokens older than this. `None` accepts any age.
    /// Env: `MQCHAT_MESSAGE_TTL_SECS`
    pub message_ttl: Option<Duration>,

    /// Broker keep-alive.
    pub keep_alive: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            join_debounce: Duration::from_secs(DEFAULT_JOIN_DEBOUNCE_SECS),
            disconnect_grace: Duration::from_millis(DEFAULT_DISCONNECT_GRACE_MS),
            stale_after: None,
            message_ttl: None,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
        }
    }
}

/// Everything the terminal client needs to join a room.
#[derive(Clone)]
pub struct ClientConfig {
    /// Env: `MQCHAT_SERVER`, default `localhost`
    pub server: String,
    /// Env: `MQCHAT_PORT`, default `1883`
    pub port: u16,
    /// Env: `MQCHAT_CHANNEL`, default `general`
    pub channel: String,
    /// Env: `MQCHAT_USERNAME`
    pub username: String,
    /// Env: `MQCHAT_PASSPHRASE`
    pub passphrase: String,
    /// Env: `MQCHAT_BROKER_USER`; anonymous when unset.
    pub broker_user: Option<String>,
    /// Env: `MQCHAT_BROKER_PASSWORD`
    pub broker_password: Option<String>,
    pub session: SessionConfig,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("channel", &self.channel)
            .field("username", &self.username)
            .field("passphrase", &"<redacted>")
            .field("broker_user", &self.broker_user)
            .field("session", &self.session)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "localhost".to_string(),
            port: DEFAULT_BROKER_PORT,
            channel: "general".to_string(),
            username: String::new(),
            passphrase: String::new(),
            broker_user: None,
            broker_password: None,
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(server) = lookup("MQCHAT_SERVER") {
            config.server = server;
        }

        if let Some(val) = lookup("MQCHAT_PORT") {
            match val.trim().parse::<u16>() {
                Ok(port) if port > 0 => config.port = port,
                _ => tracing::warn!(value = %val, "Invalid MQCHAT_PORT, using default"),
            }
        }

        if let Some(channel) = lookup("MQCHAT_CHANNEL") {
            config.channel = channel;
        }

        if let Some(username) = lookup("MQCHAT_USERNAME") {
            config.username = username;
        }

        if let Some(passphrase) = lookup("MQCHAT_PASSPHRASE") {
            config.passphrase = passphrase;
        }

        config.broker_user = lookup("MQCHAT_BROKER_USER").filter(|u| !u.trim().is_empty());
        config.broker_password = lookup("MQCHAT_BROKER_PASSWORD");

        // -- Timing knobs --

        if let Some(secs) = parse_secs(&lookup, "MQCHAT_HEARTBEAT_SECS") {
            if secs > 0 {
                config.session.heartbeat_interval = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = parse_secs(&lookup, "MQCHAT_JOIN_DEBOUNCE_SECS") {
            config.session.join_debounce = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_secs(&lookup, "MQCHAT_DISCONNECT_GRACE_MS") {
            config.session.disconnect_grace = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_secs(&lookup, "MQCHAT_STALE_AFTER_SECS") {
            config.session.stale_after = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(secs) = parse_secs(&lookup, "MQCHAT_MESSAGE_TTL_SECS") {
            config.session.message_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn connect_params(&self) -> ConnectParams {
        let params = ConnectParams::new(
            self.server.clone(),
            self.port,
            self.channel.clone(),
            self.passphrase.clone(),
            self.username.clone(),
        );
        match &self.broker_user {
            Some(user) => params.with_credentials(
                user.clone(),
                self.broker_password.clone().unwrap_or_default(),
            ),
            None => params,
        }
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let val = lookup(name)?;
    match val.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(var = name, value = %val, "Invalid number, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::from_lookup(|_| None);
        assert_eq!(config.server, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.channel, "general");
        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.session.join_debounce, Duration::from_secs(60));
        assert!(config.session.stale_after.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("MQCHAT_SERVER", "broker.example"),
            ("MQCHAT_PORT", "8883"),
            ("MQCHAT_CHANNEL", "ops"),
            ("MQCHAT_USERNAME", "alice"),
            ("MQCHAT_BROKER_USER", "svc"),
            ("MQCHAT_BROKER_PASSWORD", "pw"),
            ("MQCHAT_HEARTBEAT_SECS", "10"),
            ("MQCHAT_STALE_AFTER_SECS", "90"),
        ]));
        assert_eq!(config.server, "broker.example");
        assert_eq!(config.port, 8883);
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.session.stale_after, Some(Duration::from_secs(90)));

        let params = config.connect_params();
        assert_eq!(params.channel, "ops");
        assert_eq!(params.credentials.as_ref().map(|c| c.username.as_str()), Some("svc"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("MQCHAT_PORT", "0"),
            ("MQCHAT_HEARTBEAT_SECS", "soon"),
            ("MQCHAT_BROKER_USER", "  "),
        ]));
        assert_eq!(config.port, 1883);
        assert_eq!(config.session.heartbeat_interval, Duration::from_secs(30));
        assert!(config.broker_user.is_none());
    }

    #[test]
    fn test_debug_redacts_passphrase() {
        let config = ClientConfig {
            passphrase: "hunter2".into(),
            ..ClientConfig::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
