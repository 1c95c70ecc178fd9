// Protocol core shared by every mqchat front end: key derivation, the
// encrypted payload codec, envelopes and topic naming.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod topics;

pub use crypto::{derive_key, generate_passphrase, MessageCodec, SymmetricKey};
pub use error::{CryptoError, MqchatError, ProtocolError};
pub use protocol::{now_secs, ChatEnvelope, PresenceEnvelope, PresenceStatus};
pub use topics::{validate_name, TopicKind, TopicScheme};
