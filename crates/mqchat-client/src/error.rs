use thiserror::Error;

use mqchat_net::BrokerError;
use mqchat_shared::{CryptoError, ProtocolError};

use crate::state::SessionState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Session is {0}, disconnect first")]
    AlreadyActive(SessionState),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection error: {0}")]
    Connection(#[from] BrokerError),
}
