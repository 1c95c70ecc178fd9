//! Events the session emits towards a front end.
//!
//! The core never touches presentation state. Each front end supplies an
//! [`EventSink`] and moves events onto its own thread or render loop; the
//! simplest sink is a tokio channel sender drained by the UI.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::state::SessionState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChatEvent {
    ChatMessage {
        user: String,
        text: String,
        timestamp: f64,
    },
    SystemNotice {
        text: String,
    },
    /// Sorted online users.
    UserListChanged {
        users: Vec<String>,
    },
    Error {
        message: String,
    },
    StateChanged {
        state: SessionState,
    },
}

impl ChatEvent {
    pub fn notice(text: impl Into<String>) -> Self {
        Self::SystemNotice { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn users(users: Vec<String>) -> Self {
        Self::UserListChanged { users }
    }

    pub fn state(state: SessionState) -> Self {
        Self::StateChanged { state }
    }
}

/// Receives session events in order.
///
/// `emit` runs with the session lock held: it must return promptly and must
/// not call back into the session.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ChatEvent);
}

impl EventSink for mpsc::UnboundedSender<ChatEvent> {
    fn emit(&self, event: ChatEvent) {
        if self.send(event).is_err() {
            tracing::debug!("Event receiver dropped");
        }
    }
}
