//! MQTT transport backed by `rumqttc`.
//!
//! The event loop runs in its own tokio task and forwards what the chat core
//! cares about as [`BrokerEvent`]s. It stops at the first connection error:
//! reconnecting is the user's decision, not the transport's. It also stops,
//! dropping the socket, as soon as the event receiver goes away.

use std::sync::Arc;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, LastWill as MqttWill, MqttOptions,
    Outgoing, Packet, QoS,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError, BrokerEvent, BrokerOptions, Connector};

/// At most once, for every publish and subscription.
const QOS: QoS = QoS::AtMostOnce;

/// Opens real MQTT connections.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    /// Capacity of the outbound request queue.
    pub request_capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            request_capacity: 64,
        }
    }
}

impl Connector for MqttConnector {
    fn connect(
        &self,
        options: BrokerOptions,
    ) -> Result<(Arc<dyn Broker>, mpsc::UnboundedReceiver<BrokerEvent>), BrokerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BrokerError::Client(format!("no async runtime: {e}")))?;

        let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
        mqtt_options
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true);
        if let Some(credentials) = &options.credentials {
            mqtt_options.set_credentials(&credentials.username, &credentials.password);
        }
        if let Some(will) = options.last_will {
            mqtt_options.set_last_will(MqttWill::new(will.topic, will.payload, QOS, will.retain));
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, self.request_capacity);
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            host = %options.host,
            port = options.port,
            client = %options.client_id,
            "Connecting to MQTT broker"
        );

        runtime.spawn(async move {
            let mut connected = false;
            loop {
                let polled = tokio::select! {
                    _ = tx.closed() => {
                        debug!("Broker event receiver dropped, stopping MQTT loop");
                        break;
                    }
                    polled = eventloop.poll() => polled,
                };
                let event = match polled {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            connected = true;
                            BrokerEvent::Connected
                        } else {
                            let _ = tx.send(BrokerEvent::ConnectionFailed(format!("{:?}", ack.code)));
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => BrokerEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    },
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        let _ = tx.send(BrokerEvent::Disconnected { reason: None });
                        break;
                    }
                    Ok(_) => continue,
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        let _ = tx.send(BrokerEvent::ConnectionFailed(format!("{code:?}")));
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "MQTT connection error");
                        let event = if connected {
                            BrokerEvent::Disconnected {
                                reason: Some(e.to_string()),
                            }
                        } else {
                            BrokerEvent::ConnectionFailed(e.to_string())
                        };
                        let _ = tx.send(event);
                        break;
                    }
                };

                if tx.send(event).is_err() {
                    debug!("Broker event receiver dropped, stopping MQTT loop");
                    break;
                }
            }
            debug!("MQTT event loop terminated");
        });

        Ok((Arc::new(MqttBroker { client }), rx))
    }
}

struct MqttBroker {
    client: AsyncClient,
}

impl Broker for MqttBroker {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError> {
        self.client
            .try_publish(topic, QOS, retain, payload)
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    fn subscribe(&self, filter: &str) -> Result<(), BrokerError> {
        self.client
            .try_subscribe(filter, QOS)
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    fn disconnect(&self) -> Result<(), BrokerError> {
        self.client
            .try_disconnect()
            .map_err(|e| BrokerError::Client(e.to_string()))
    }
}
