//! MQTT integration test helpers
//!
//! Starts a throwaway Mosquitto broker with testcontainers and provides a
//! minimal settings responder that answers requests the way a MADS broker
//! does: on the request's response topic, echoing its correlation data.

use bytes::Bytes;
use mads_agent::config::BrokerConfig;
use mads_agent::protocol::{Envelope, SETTINGS_REQUEST_TOPIC};
use mads_agent::transport::{ConnectOptions, Transport};
use mads_agent::MqttClient;
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use serde_json::Value;
use std::time::Duration;
use testcontainers::clients::Cli;
use testcontainers::GenericImage;
use testcontainers::Container;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Mosquitto 1.6 speaks MQTT v5 and accepts anonymous clients out of the box
const MOSQUITTO_IMAGE: &str = "eclipse-mosquitto";
const MOSQUITTO_TAG: &str = "1.6";
const MQTT_PORT: u16 = 1883;

const CONNECT_ATTEMPTS: usize = 40;
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// How the responder fills in correlation data
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum Correlation {
    /// Copy the request's correlation data
    Echo,
    /// Answer with correlation data no request carries
    Foreign,
}

/// Running Mosquitto container
pub struct MosquittoHarness<'d> {
    _container: Container<'d, GenericImage>,
    port: u16,
}

#[allow(dead_code)]
impl<'d> MosquittoHarness<'d> {
    pub fn start(docker: &'d Cli) -> Self {
        let image = GenericImage::new(MOSQUITTO_IMAGE, MOSQUITTO_TAG);
        let container = docker.run(image);
        let port = container.get_host_port_ipv4(MQTT_PORT);
        Self {
            _container: container,
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn broker_url(&self) -> String {
        format!("mqtt://127.0.0.1:{}", self.port)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::for_url(self.broker_url())
    }

    /// Connect a transport, retrying while the broker is still starting
    pub async fn connect(&self, client_id: &str, subscriptions: &[&str]) -> MqttClient {
        let mut options = ConnectOptions::new(client_id, self.broker_config());
        options.subscriptions = subscriptions.iter().map(|topic| topic.to_string()).collect();

        let mut client = MqttClient::new(client_id);
        for _ in 0..CONNECT_ATTEMPTS {
            match client.connect(&options).await {
                Ok(()) => {
                    // Let the broker process the initial SUBSCRIBE packets
                    sleep(Duration::from_millis(200)).await;
                    return client;
                }
                Err(_) => sleep(Duration::from_millis(250)).await,
            }
        }
        panic!("Mosquitto did not accept connections at {}", self.broker_url());
    }

    /// Answer settings requests with `document` plus the requesting agent's name
    ///
    /// Returns once the responder's subscription is acknowledged. Call after
    /// the broker accepted at least one connection.
    pub async fn spawn_settings_responder(
        &self,
        document: Value,
        correlation: Correlation,
    ) -> JoinHandle<()> {
        let client_id = format!("settings-responder-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, "127.0.0.1", self.port);
        options.set_keep_alive(Duration::from_secs(5));

        let (client, mut event_loop) = AsyncClient::new(options, 16);
        client
            .subscribe(SETTINGS_REQUEST_TOPIC, QoS::AtLeastOnce)
            .await
            .expect("responder subscribe request should queue");

        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            loop {
                let publish = match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        if let Some(ready) = ready_tx.take() {
                            let _ = ready.send(());
                        }
                        continue;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => publish,
                    Ok(_) => continue,
                    Err(_) => break,
                };

                let Some(properties) = publish.properties else {
                    continue;
                };
                let Some(reply_topic) = properties.response_topic else {
                    continue;
                };
                let correlation_data = match correlation {
                    Correlation::Echo => properties.correlation_data,
                    Correlation::Foreign => Some(Bytes::from_static(b"not-a-pending-request")),
                };

                let request: Value = serde_json::from_slice(&publish.payload).unwrap_or_default();
                let mut reply = document.clone();
                reply["agent"] = request["agent"].clone();

                let reply_properties = PublishProperties {
                    content_type: Some("application/json".to_string()),
                    correlation_data,
                    ..Default::default()
                };
                let payload = serde_json::to_vec(&reply).unwrap_or_default();
                if client
                    .publish_with_properties(reply_topic, QoS::AtLeastOnce, false, payload, reply_properties)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        timeout(Duration::from_secs(10), ready_rx)
            .await
            .expect("responder subscription should be acknowledged")
            .expect("responder should still be running");
        handle
    }
}

/// Next envelope on `client`, failing the test after a few seconds
#[allow(dead_code)]
pub async fn next_envelope(client: &mut MqttClient) -> Envelope {
    timeout(RECEIVE_TIMEOUT, client.receive())
        .await
        .expect("an envelope should arrive in time")
        .expect("connection should stay open")
}
