//! In-process broker with retained messages and last-will delivery.
//!
//! Behaves like a single MQTT broker for any number of local clients: publishes
//! fan out to matching subscriptions (including the publisher's own), empty
//! retained payloads clear the retained slot, and [`LocalBroker::sever`] drops
//! a client the way a network failure would, publishing its last will.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::broker::{
    topic_matches, Broker, BrokerError, BrokerEvent, BrokerOptions, Connector, LastWill,
};

struct Client {
    /// Distinguishes a reconnect under the same client id from the old handle.
    conn: u64,
    tx: mpsc::UnboundedSender<BrokerEvent>,
    filters: Vec<String>,
    will: Option<LastWill>,
}

#[derive(Default)]
struct Hub {
    retained: BTreeMap<String, Vec<u8>>,
    clients: HashMap<String, Client>,
    refuse: Option<String>,
    next_conn: u64,
}

impl Hub {
    fn publish(&mut self, topic: &str, payload: Vec<u8>, retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.clone());
            }
        }

        for client in self.clients.values() {
            if client.filters.iter().any(|f| topic_matches(f, topic)) {
                let _ = client.tx.send(BrokerEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
    }

    fn client(&mut self, client_id: &str, conn: u64) -> Result<&mut Client, BrokerError> {
        match self.clients.get_mut(client_id) {
            Some(client) if client.conn == conn => Ok(client),
            _ => Err(BrokerError::Closed),
        }
    }
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct LocalBroker {
    hub: Arc<Mutex<Hub>>,
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every new connection with `reason`, or accept again with `None`.
    pub fn refuse_connections(&self, reason: Option<&str>) {
        lock(&self.hub).refuse = reason.map(str::to_string);
    }

    /// Current retained payload for `topic`.
    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        lock(&self.hub).retained.get(topic).cloned()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        lock(&self.hub).clients.contains_key(client_id)
    }

    /// Drop a client as if its network died: its last will is published and
    /// it sees a `Disconnected` event. Returns false if it was not connected.
    pub fn sever(&self, client_id: &str) -> bool {
        let mut hub = lock(&self.hub);
        let Some(client) = hub.clients.remove(client_id) else {
            return false;
        };

        debug!(client = %client_id, "Severing local broker client");
        let _ = client.tx.send(BrokerEvent::Disconnected {
            reason: Some("connection lost".to_string()),
        });
        if let Some(will) = client.will {
            hub.publish(&will.topic, will.payload, will.retain);
        }
        true
    }
}

impl Connector for LocalBroker {
    fn connect(
        &self,
        options: BrokerOptions,
    ) -> Result<(Arc<dyn Broker>, mpsc::UnboundedReceiver<BrokerEvent>), BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = lock(&self.hub);
        hub.next_conn += 1;
        let conn = hub.next_conn;

        let handle = Arc::new(LocalHandle {
            hub: self.hub.clone(),
            client_id: options.client_id.clone(),
            conn,
        });

        if let Some(reason) = hub.refuse.clone() {
            let _ = tx.send(BrokerEvent::ConnectionFailed(reason));
            return Ok((handle, rx));
        }

        debug!(client = %options.client_id, "Local broker client connected");
        hub.clients.insert(
            options.client_id,
            Client {
                conn,
                tx: tx.clone(),
                filters: Vec::new(),
                will: options.last_will,
            },
        );
        let _ = tx.send(BrokerEvent::Connected);
        Ok((handle, rx))
    }
}

struct LocalHandle {
    hub: Arc<Mutex<Hub>>,
    client_id: String,
    conn: u64,
}

impl Broker for LocalHandle {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError> {
        let mut hub = lock(&self.hub);
        hub.client(&self.client_id, self.conn)?;
        hub.publish(topic, payload, retain);
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), BrokerError> {
        let mut hub = lock(&self.hub);
        let replay: Vec<(String, Vec<u8>)> = hub
            .retained
            .iter()
            .filter(|(topic, _)| topic_matches(filter, topic))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect();

        let client = hub.client(&self.client_id, self.conn)?;
        if !client.filters.iter().any(|f| f == filter) {
            client.filters.push(filter.to_string());
        }
        for (topic, payload) in replay {
            let _ = client.tx.send(BrokerEvent::Message { topic, payload });
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        let mut hub = lock(&self.hub);
        hub.client(&self.client_id, self.conn)?;
        if let Some(client) = hub.clients.remove(&self.client_id) {
            let _ = client.tx.send(BrokerEvent::Disconnected { reason: None });
        }
        Ok(())
    }
}
