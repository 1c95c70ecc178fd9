pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod session;
pub mod state;

pub use config::{ClientConfig, SessionConfig};
pub use error::SessionError;
pub use events::{ChatEvent, EventSink};
pub use heartbeat::HeartbeatScheduler;
pub use session::{ChatSession, ConnectParams};
pub use state::SessionState;
