//! NATS connector: subscribes as a [`Source`], publishes as a [`Target`].
//!
//! Ack delivery follows the plain request/reply convention used by the
//! test harness in spec §8 scenario 1: when a producer publishes with a
//! `reply` subject set (`client.request(...)` or an explicit `reply-to`
//! header), `ack(reply)` sends the reply payload back on that subject;
//! `ack(None)`/`nak()` are otherwise no-ops on core NATS, which has no
//! ack primitive outside JetStream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use events_bridge_core::contract::{Source, SourceMessage, Target};
use events_bridge_core::message::{Message, ReplyData};
use events_bridge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

const METADATA_SUBJECT_KEY: &str = "subject";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatsSourceConfig {
    pub url: String,
    pub subject: String,
    #[serde(default)]
    pub queue_group: Option<String>,
}

impl NatsSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid nats source options: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatsTargetConfig {
    pub url: String,
    #[serde(default)]
    pub subject: Option<String>,
}

impl NatsTargetConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid nats target options: {e}")))
    }
}

pub struct NatsSource {
    config: NatsSourceConfig,
    client: tokio::sync::Mutex<Option<async_nats::Client>>,
}

impl NatsSource {
    pub fn new(config: NatsSourceConfig) -> Self {
        Self {
            config,
            client: tokio::sync::Mutex::new(None),
        }
    }
}

struct NatsSourceMessage {
    client: async_nats::Client,
    reply_subject: Option<String>,
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

impl SourceMessage for NatsSourceMessage {
    fn id(&self) -> &[u8] {
        &self.id
    }
    fn metadata(&self) -> Result<HashMap<String, String>> {
        Ok(self.metadata.clone())
    }
    fn data(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
    }
    fn ack(&self, reply: Option<ReplyData>) -> Result<()> {
        let Some(subject) = self.reply_subject.clone() else {
            return Ok(());
        };
        let Some(reply) = reply else {
            return Ok(());
        };
        let client = self.client.clone();
        let payload = bytes::Bytes::from(reply.data);
        tokio::spawn(async move {
            if let Err(e) = client.publish(subject, payload).await {
                error!(error = %e, "failed to publish nats reply");
            }
        });
        Ok(())
    }
    fn nak(&self) -> Result<()> {
        let Some(subject) = self.reply_subject.clone() else {
            return Ok(());
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.publish(subject, bytes::Bytes::from_static(b"")).await {
                error!(error = %e, "failed to publish nats nak marker");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Source for NatsSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let client = async_nats::connect(&self.config.url)
            .await
            .map_err(|e| Error::transport(format!("nats connect failed: {e}")))?;
        *self.client.lock().await = Some(client.clone());

        let mut subscriber = match &self.config.queue_group {
            Some(group) => client
                .queue_subscribe(self.config.subject.clone(), group.clone())
                .await
                .map_err(|e| Error::transport(format!("nats subscribe failed: {e}")))?,
            None => client
                .subscribe(self.config.subject.clone())
                .await
                .map_err(|e| Error::transport(format!("nats subscribe failed: {e}")))?,
        };

        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(nats_msg) = subscriber.next().await {
                let mut metadata = HashMap::new();
                metadata.insert(METADATA_SUBJECT_KEY.to_string(), nats_msg.subject.to_string());
                let reply_subject = nats_msg.reply.clone().map(|s| s.to_string());
                let source_msg = NatsSourceMessage {
                    client: client.clone(),
                    reply_subject,
                    id: Vec::new(),
                    data: nats_msg.payload.to_vec(),
                    metadata,
                };
                match Message::new(Box::new(source_msg)) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            debug!("nats source queue closed, stopping subscriber loop");
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "failed to wrap nats message"),
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.lock().await.take() {
            client
                .drain()
                .await
                .map_err(|e| Error::transport(format!("nats drain failed: {e}")))?;
        }
        Ok(())
    }
}

pub struct NatsTarget {
    config: NatsTargetConfig,
    client: tokio::sync::OnceCell<async_nats::Client>,
}

impl NatsTarget {
    pub fn new(config: NatsTargetConfig) -> Self {
        Self {
            config,
            client: tokio::sync::OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&async_nats::Client> {
        self.client
            .get_or_try_init(|| async {
                async_nats::connect(&self.config.url)
                    .await
                    .map_err(|e| Error::transport(format!("nats connect failed: {e}")))
            })
            .await
    }
}

#[async_trait]
impl Target for NatsTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let metadata = msg.metadata();
        let subject = metadata
            .get(METADATA_SUBJECT_KEY)
            .cloned()
            .or_else(|| self.config.subject.clone())
            .ok_or_else(|| {
                Error::config("nats target requires a 'subject' metadata key or static config")
            })?;
        let client = self.client().await?;
        client
            .publish(subject, bytes::Bytes::from(msg.data()))
            .await
            .map_err(|e| Error::transport(format!("nats publish failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.get() {
            client
                .clone()
                .drain()
                .await
                .map_err(|e| Error::transport(format!("nats drain failed: {e}")))?;
        }
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("nats", |options| {
        let config = NatsSourceConfig::from_options(options)?;
        Ok(Arc::new(NatsSource::new(config)) as Arc<dyn Source>)
    });
    registry.register_target("nats", |options| {
        let config = NatsTargetConfig::from_options(options)?;
        Ok(Arc::new(NatsTarget::new(config)) as Arc<dyn Target>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_requires_subject() {
        let err = NatsSourceConfig::from_options(&serde_json::json!({ "url": "nats://x" }))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn source_config_parses_minimal_options() {
        let config = NatsSourceConfig::from_options(&serde_json::json!({
            "url": "nats://localhost:4222",
            "subject": "ab.*"
        }))
        .unwrap();
        assert_eq!(config.subject, "ab.*");
        assert!(config.queue_group.is_none());
    }
}
