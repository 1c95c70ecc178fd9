//! Connection lifecycle of a [`ChatSession`](crate::ChatSession).

use std::fmt;

use serde::Serialize;

/// Where the session is in its lifecycle. Only the session mutates it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl SessionState {
    /// Whether a broker connection exists or is being set up or torn down.
    pub fn is_active(self) -> bool {
        self != Self::Disconnected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(label)
    }
}
