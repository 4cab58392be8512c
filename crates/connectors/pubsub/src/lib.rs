//! Google Cloud Pub/Sub connector. Unlike MQTT/Kafka/Redis, Pub/Sub has
//! a native per-message ack (`ackDeadline`), so the source's `ack`/`nak`
//! map directly onto `ReceivedMessage::ack`/`nack` rather than being
//! no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use events_bridge_core::contract::{Source, SourceMessage, Target};
use events_bridge_core::message::{Message, ReplyData};
use events_bridge_core::{Error, Result};
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use google_cloud_pubsub::subscriber::ReceivedMessage;
use google_cloud_pubsub::subscription::Subscription;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PubsubSourceConfig {
    pub project_id: String,
    pub subscription: String,
}

impl PubsubSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid pubsub source options: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PubsubTargetConfig {
    pub project_id: String,
    pub topic: String,
}

impl PubsubTargetConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid pubsub target options: {e}")))
    }
}

struct PubsubSourceMessage {
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    received: parking_lot::Mutex<Option<ReceivedMessage>>,
}

impl SourceMessage for PubsubSourceMessage {
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
        let Some(received) = self.received.lock().take() else {
            return Ok(());
        };
        tokio::spawn(async move {
            if let Err(e) = received.ack().await {
                error!(error = %e, "failed to ack pubsub message");
            }
        });
        Ok(())
    }
    fn nak(&self) -> Result<()> {
        let Some(received) = self.received.lock().take() else {
            return Ok(());
        };
        tokio::spawn(async move {
            if let Err(e) = received.nack().await {
                error!(error = %e, "failed to nack pubsub message");
            }
        });
        Ok(())
    }
}

pub struct PubsubSource {
    config: PubsubSourceConfig,
}

impl PubsubSource {
    pub fn new(config: PubsubSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Source for PubsubSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let client_config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| Error::config(format!("pubsub auth failed: {e}")))?;
        let client = Client::new(client_config)
            .await
            .map_err(|e| Error::transport(format!("pubsub client build failed: {e}")))?;
        let subscription: Subscription = client.subscription(&self.config.subscription);

        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(async move {
            let result = subscription
                .receive(
                    move |received: ReceivedMessage, _ctx| {
                        let tx = tx.clone();
                        async move {
                            let mut metadata = HashMap::new();
                            for (k, v) in received.message.attributes.iter() {
                                metadata.insert(k.clone(), v.clone());
                            }
                            let data = received.message.data.clone();
                            let source_msg = PubsubSourceMessage {
                                id: received.message.message_id.clone().into_bytes(),
                                data,
                                metadata,
                                received: parking_lot::Mutex::new(Some(received)),
                            };
                            match Message::new(Box::new(source_msg)) {
                                Ok(msg) => {
                                    if tx.send(msg).await.is_err() {
                                        debug!("pubsub source queue closed");
                                    }
                                }
                                Err(e) => error!(error = %e, "failed to wrap pubsub message"),
                            }
                        }
                    },
                    Default::default(),
                )
                .await;
            if let Err(e) = result {
                error!(error = %e, "pubsub receive loop ended");
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct PubsubTarget {
    config: PubsubTargetConfig,
    publisher: tokio::sync::Mutex<Option<Publisher>>,
}

impl PubsubTarget {
    pub fn new(config: PubsubTargetConfig) -> Self {
        Self {
            config,
            publisher: tokio::sync::Mutex::new(None),
        }
    }

    async fn publisher(&self) -> Result<Publisher> {
        let mut guard = self.publisher.lock().await;
        if let Some(publisher) = guard.as_ref() {
            return Ok(publisher.clone());
        }
        let client_config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| Error::config(format!("pubsub auth failed: {e}")))?;
        let client = Client::new(client_config)
            .await
            .map_err(|e| Error::transport(format!("pubsub client build failed: {e}")))?;
        let topic = client.topic(&self.config.topic);
        let publisher = topic.new_publisher(Default::default());
        *guard = Some(publisher.clone());
        Ok(publisher)
    }
}

#[async_trait]
impl Target for PubsubTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let publisher = self.publisher().await?;
        let pubsub_msg = google_cloud_googleapis::pubsub::v1::PubsubMessage {
            data: msg.data(),
            attributes: msg.metadata(),
            ..Default::default()
        };
        let awaiter = publisher.publish(pubsub_msg).await;
        awaiter
            .get()
            .await
            .map_err(|e| Error::transport(format!("pubsub publish failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(publisher) = self.publisher.lock().await.as_mut() {
            publisher.shutdown().await;
        }
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("pubsub", |options| {
        let config = PubsubSourceConfig::from_options(options)?;
        Ok(Arc::new(PubsubSource::new(config)) as Arc<dyn Source>)
    });
    registry.register_target("pubsub", |options| {
        let config = PubsubTargetConfig::from_options(options)?;
        Ok(Arc::new(PubsubTarget::new(config)) as Arc<dyn Target>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_requires_subscription() {
        let err = PubsubSourceConfig::from_options(&serde_json::json!({ "project_id": "p" }))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
