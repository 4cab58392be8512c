//! Kafka connector. Fire-and-forget: the consumer commits offsets on its
//! own schedule rather than per-worker-ack, so `ack`/`nak` here only
//! influence whether this message's offset is included in the next
//! commit, never block or retry delivery (spec §4.5 "fire-and-forget").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use events_bridge_core::contract::{Source, SourceMessage, Target};
use events_bridge_core::message::{Message, ReplyData};
use events_bridge_core::{Error, Result};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message as _, TopicPartitionList};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const METADATA_TOPIC_KEY: &str = "topic";
const METADATA_KEY_KEY: &str = "key";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaSourceConfig {
    pub brokers: String,
    pub group_id: String,
    pub topic: String,
}

impl KafkaSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid kafka source options: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaTargetConfig {
    pub brokers: String,
    #[serde(default)]
    pub topic: Option<String>,
}

impl KafkaTargetConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid kafka target options: {e}")))
    }
}

struct KafkaSourceMessage {
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl SourceMessage for KafkaSourceMessage {
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
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, rdkafka::Offset::Offset(self.offset + 1))
            .map_err(|e| Error::transport(format!("kafka offset build failed: {e}")))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| Error::transport(format!("kafka commit failed: {e}")))?;
        Ok(())
    }
    fn nak(&self) -> Result<()> {
        Ok(())
    }
}

pub struct KafkaSource {
    config: KafkaSourceConfig,
}

impl KafkaSource {
    pub fn new(config: KafkaSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.group_id)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| Error::transport(format!("kafka consumer build failed: {e}")))?;
        consumer
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|e| Error::transport(format!("kafka subscribe failed: {e}")))?;
        let consumer = Arc::new(consumer);

        let (tx, rx) = mpsc::channel(buffer);
        let consumer_loop = Arc::clone(&consumer);
        tokio::spawn(async move {
            loop {
                match consumer_loop.recv().await {
                    Ok(borrowed) => {
                        let mut metadata = HashMap::new();
                        metadata.insert(METADATA_TOPIC_KEY.to_string(), borrowed.topic().to_string());
                        if let Some(key) = borrowed.key() {
                            metadata.insert(METADATA_KEY_KEY.to_string(), String::from_utf8_lossy(key).to_string());
                        }
                        let data = borrowed.payload().unwrap_or(&[]).to_vec();
                        let source_msg = KafkaSourceMessage {
                            id: Vec::new(),
                            data,
                            metadata,
                            consumer: Arc::clone(&consumer_loop),
                            topic: borrowed.topic().to_string(),
                            partition: borrowed.partition(),
                            offset: borrowed.offset(),
                        };
                        match Message::new(Box::new(source_msg)) {
                            Ok(msg) => {
                                if tx.send(msg).await.is_err() {
                                    debug!("kafka source queue closed, stopping poll loop");
                                    break;
                                }
                            }
                            Err(e) => error!(error = %e, "failed to wrap kafka message"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "kafka recv error");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct KafkaTarget {
    config: KafkaTargetConfig,
    producer: tokio::sync::OnceCell<FutureProducer>,
}

impl KafkaTarget {
    pub fn new(config: KafkaTargetConfig) -> Self {
        Self {
            config,
            producer: tokio::sync::OnceCell::new(),
        }
    }

    async fn producer(&self) -> Result<&FutureProducer> {
        self.producer
            .get_or_try_init(|| async {
                ClientConfig::new()
                    .set("bootstrap.servers", &self.config.brokers)
                    .create()
                    .map_err(|e| Error::transport(format!("kafka producer build failed: {e}")))
            })
            .await
    }
}

#[async_trait]
impl Target for KafkaTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let metadata = msg.metadata();
        let topic = metadata
            .get(METADATA_TOPIC_KEY)
            .cloned()
            .or_else(|| self.config.topic.clone())
            .ok_or_else(|| {
                Error::config("kafka target requires a 'topic' metadata key or static config")
            })?;
        let producer = self.producer().await?;
        let data = msg.data();
        let mut record = FutureRecord::to(&topic).payload(&data);
        let key_owned = metadata.get(METADATA_KEY_KEY).cloned();
        if let Some(key) = key_owned.as_deref() {
            record = record.key(key);
        }
        producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _owned)| Error::transport(format!("kafka send failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("kafka", |options| {
        let config = KafkaSourceConfig::from_options(options)?;
        Ok(Arc::new(KafkaSource::new(config)) as Arc<dyn Source>)
    });
    registry.register_target("kafka", |options| {
        let config = KafkaTargetConfig::from_options(options)?;
        Ok(Arc::new(KafkaTarget::new(config)) as Arc<dyn Target>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_requires_group_id() {
        let err = KafkaSourceConfig::from_options(&serde_json::json!({
            "brokers": "localhost:9092",
            "topic": "events"
        }))
        .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn source_config_parses_full_options() {
        let config = KafkaSourceConfig::from_options(&serde_json::json!({
            "brokers": "localhost:9092",
            "group_id": "events-bridge",
            "topic": "events"
        }))
        .unwrap();
        assert_eq!(config.group_id, "events-bridge");
    }
}
