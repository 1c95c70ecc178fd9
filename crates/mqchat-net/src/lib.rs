// Broker seam (MQTT and in-process implementations) and presence tracking.

pub mod broker;
pub mod memory;
pub mod mqtt;
pub mod presence;

pub use broker::{
    topic_matches, Broker, BrokerError, BrokerEvent, BrokerOptions, Connector, Credentials,
    LastWill,
};
pub use memory::LocalBroker;
pub use mqtt::MqttConnector;
pub use presence::{PresenceNotice, PresenceTracker, PresenceUpdate};
