//! Redis connector: Pub/Sub channel as [`Source`], `PUBLISH` as
//! [`Target`]. Fire-and-forget like MQTT/Kafka — Redis Pub/Sub has no
//! delivery acknowledgment, so the source's `ack`/`nak` are no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use events_bridge_core::contract::{Source, SourceMessage, Target};
use events_bridge_core::message::{Message, ReplyData};
use events_bridge_core::{Error, Result};
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

const METADATA_CHANNEL_KEY: &str = "channel";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisSourceConfig {
    pub url: String,
    pub channel: String,
}

impl RedisSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid redis source options: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisTargetConfig {
    pub url: String,
    #[serde(default)]
    pub channel: Option<String>,
}

impl RedisTargetConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid redis target options: {e}")))
    }
}

struct RedisSourceMessage {
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

impl SourceMessage for RedisSourceMessage {
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

pub struct RedisSource {
    config: RedisSourceConfig,
}

impl RedisSource {
    pub fn new(config: RedisSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Source for RedisSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let client = redis::Client::open(self.config.url.as_str())
            .map_err(|e| Error::config(format!("invalid redis url: {e}")))?;
        let pubsub_conn = client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::transport(format!("redis pubsub connect failed: {e}")))?;
        let mut pubsub = pubsub_conn;
        pubsub
            .subscribe(&self.config.channel)
            .await
            .map_err(|e| Error::transport(format!("redis subscribe failed: {e}")))?;

        let (tx, rx) = mpsc::channel(buffer);
        let channel = self.config.channel.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(payload) = stream.next().await {
                let data: Vec<u8> = match payload.get_payload() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, "failed to read redis payload");
                        continue;
                    }
                };
                let mut metadata = HashMap::new();
                metadata.insert(METADATA_CHANNEL_KEY.to_string(), channel.clone());
                let source_msg = RedisSourceMessage {
                    id: Vec::new(),
                    data,
                    metadata,
                };
                match Message::new(Box::new(source_msg)) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            debug!("redis source queue closed, stopping subscriber loop");
                            break;
                        }
                    }
                    Err(e) => error!(error = %e, "failed to wrap redis message"),
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct RedisTarget {
    config: RedisTargetConfig,
    conn: tokio::sync::OnceCell<redis::aio::MultiplexedConnection>,
}

impl RedisTarget {
    pub fn new(config: RedisTargetConfig) -> Self {
        Self {
            config,
            conn: tokio::sync::OnceCell::new(),
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let client = redis::Client::open(self.config.url.as_str())
                    .map_err(|e| Error::config(format!("invalid redis url: {e}")))?;
                client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| Error::transport(format!("redis connect failed: {e}")))
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl Target for RedisTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let metadata = msg.metadata();
        let channel = metadata
            .get(METADATA_CHANNEL_KEY)
            .cloned()
            .or_else(|| self.config.channel.clone())
            .ok_or_else(|| {
                Error::config("redis target requires a 'channel' metadata key or static config")
            })?;
        let mut conn = self.connection().await?;
        conn.publish::<_, _, i64>(channel, msg.data())
            .await
            .map_err(|e| Error::transport(format!("redis publish failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("redis", |options| {
        let config = RedisSourceConfig::from_options(options)?;
        Ok(Arc::new(RedisSource::new(config)) as Arc<dyn Source>)
    });
    registry.register_target("redis", |options| {
        let config = RedisTargetConfig::from_options(options)?;
        Ok(Arc::new(RedisTarget::new(config)) as Arc<dyn Target>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_requires_channel() {
        let err = RedisSourceConfig::from_options(&serde_json::json!({ "url": "redis://x" }))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
