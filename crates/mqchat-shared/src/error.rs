use thiserror::Error;

#[derive(Error, Debug)]
pub enum MqchatError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Passphrase must not be empty")]
    EmptyPassphrase,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid transport encoding: {0}")]
    Decode(String),

    #[error("Malformed token")]
    MalformedToken,

    #[error("Authentication failed: wrong key or corrupted data")]
    Authentication,

    #[error("Token outside its validity window")]
    Expired,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Presence user mismatch: topic says {topic_user:?}, payload says {payload_user:?}")]
    UserMismatch {
        topic_user: String,
        payload_user: String,
    },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}
