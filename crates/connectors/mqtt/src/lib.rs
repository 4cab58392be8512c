//! MQTT connector. Fire-and-forget transport: there is no broker-native
//! ack, so `ack`/`nak` on the source side are no-ops (spec §4.5's
//! "fire-and-forget" family, alongside Kafka and Pub/Sub).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use events_bridge_core::contract::{Source, SourceMessage, Target};
use events_bridge_core::message::{Message, ReplyData};
use events_bridge_core::{Error, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const METADATA_TOPIC_KEY: &str = "topic";

fn default_qos() -> u8 {
    1
}

fn qos_from(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttSourceConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
}

impl MqttSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid mqtt source options: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttTargetConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

impl MqttTargetConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid mqtt target options: {e}")))
    }
}

struct MqttSourceMessage {
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

impl SourceMessage for MqttSourceMessage {
    fn id(&self) -> &[u8] {
        &self.id
    }
    fn metadata(&self) -> Result<HashMap<String, String>> {
        Ok(self.metadata.clone())
    }
    fn data(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
    }
    fn ack(&self, _reply: Option<ReplyData>) -> Result<()> {
        Ok(())
    }
    fn nak(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MqttSource {
    config: MqttSourceConfig,
    client: tokio::sync::Mutex<Option<AsyncClient>>,
}

impl MqttSource {
    pub fn new(config: MqttSourceConfig) -> Self {
        Self {
            config,
            client: tokio::sync::Mutex::new(None),
        }
    }
}

#[async_trait]
impl Source for MqttSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let mut options = MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, buffer.max(10));
        client
            .subscribe(&self.config.topic, qos_from(self.config.qos))
            .await
            .map_err(|e| Error::transport(format!("mqtt subscribe failed: {e}")))?;
        *self.client.lock().await = Some(client.clone());

        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let mut metadata = HashMap::new();
                        metadata.insert(METADATA_TOPIC_KEY.to_string(), publish.topic.clone());
                        let source_msg = MqttSourceMessage {
                            id: Vec::new(),
                            data: publish.payload.to_vec(),
                            metadata,
                        };
                        match Message::new(Box::new(source_msg)) {
                            Ok(msg) => {
                                if tx.send(msg).await.is_err() {
                                    debug!("mqtt source queue closed, stopping poll loop");
                                    break;
                                }
                            }
                            Err(e) => error!(error = %e, "failed to wrap mqtt message"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt eventloop error");
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.lock().await.take() {
            client
                .disconnect()
                .await
                .map_err(|e| Error::transport(format!("mqtt disconnect failed: {e}")))?;
        }
        Ok(())
    }
}

pub struct MqttTarget {
    config: MqttTargetConfig,
    client: tokio::sync::OnceCell<AsyncClient>,
}

impl MqttTarget {
    pub fn new(config: MqttTargetConfig) -> Self {
        Self {
            config,
            client: tokio::sync::OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&AsyncClient> {
        self.client
            .get_or_try_init(|| async {
                let mut options =
                    MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
                options.set_keep_alive(Duration::from_secs(30));
                let (client, mut eventloop) = AsyncClient::new(options, 10);
                tokio::spawn(async move {
                    loop {
                        if eventloop.poll().await.is_err() {
                            break;
                        }
                    }
                });
                Ok::<_, Error>(client)
            })
            .await
    }
}

#[async_trait]
impl Target for MqttTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let metadata = msg.metadata();
        let topic = metadata
            .get(METADATA_TOPIC_KEY)
            .cloned()
            .or_else(|| self.config.topic.clone())
            .ok_or_else(|| {
                Error::config("mqtt target requires a 'topic' metadata key or static config")
            })?;
        let client = self.client().await?;
        client
            .publish(topic, qos_from(self.config.qos), self.config.retain, msg.data())
            .await
            .map_err(|e| Error::transport(format!("mqtt publish failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.get() {
            client
                .disconnect()
                .await
                .map_err(|e| Error::transport(format!("mqtt disconnect failed: {e}")))?;
        }
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("mqtt", |options| {
        let config = MqttSourceConfig::from_options(options)?;
        Ok(Arc::new(MqttSource::new(config)) as Arc<dyn Source>)
    });
    registry.register_target("mqtt", |options| {
        let config = MqttTargetConfig::from_options(options)?;
        Ok(Arc::new(MqttTarget::new(config)) as Arc<dyn Target>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_defaults_to_at_least_once() {
        let config = MqttSourceConfig::from_options(&serde_json::json!({
            "host": "localhost",
            "port": 1883,
            "client_id": "eb-test",
            "topic": "events/#"
        }))
        .unwrap();
        assert_eq!(config.qos, 1);
    }

    #[test]
    fn qos_from_maps_known_levels() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtLeastOnce);
    }
}
