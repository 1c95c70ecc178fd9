/// Application name
pub const APP_NAME: &str = "MQChat";

/// Root segment of every topic the chat uses
pub const TOPIC_ROOT: &str = "chat";

/// Fernet token version byte
pub const TOKEN_VERSION: u8 = 0x80;

/// AES-CBC IV size in bytes
pub const IV_SIZE: usize = 16;

/// HMAC-SHA256 tag size in bytes
pub const MAC_SIZE: usize = 32;

/// Derived key size in bytes (signing half + encryption half)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Accepted clock skew for tokens stamped in the future, in seconds
pub const MAX_CLOCK_SKEW_SECS: u64 = 60;

/// Default presence re-announcement interval in seconds
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30;

/// Default window suppressing repeated "joined" notices, in seconds
pub const DEFAULT_JOIN_DEBOUNCE_SECS: u64 = 60;

/// Default pause between "offline" and clearing retained presence, in millis
pub const DEFAULT_DISCONNECT_GRACE_MS: u64 = 500;

/// Default broker keep-alive in seconds
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// Default broker port
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Characters that cannot appear in a channel or user name (topic syntax)
pub const RESERVED_NAME_CHARS: &[char] = &['/', '+', '#'];
