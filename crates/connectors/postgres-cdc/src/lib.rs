//! PostgreSQL change-data-capture source.
//!
//! Rather than speak the logical-replication `COPY BOTH` wire protocol
//! directly, this polls a `wal2json`-backed logical replication slot
//! with `pg_logical_slot_get_changes`, which is the same output plugin
//! and poll-based consumption model most lightweight CDC tools built on
//! `tokio-postgres` use. Each change row becomes one `Message`, fully
//! fire-and-forget: the slot has already advanced once the row is
//! fetched, so `ack`/`nak` are no-ops (spec §4.5 "fire-and-forget"). A
//! companion `Target` is a plain parameterized `INSERT`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use events_bridge_core::contract::{Source, SourceMessage, Target};
use events_bridge_core::message::{Message, ReplyData};
use events_bridge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_postgres::NoTls;
use tracing::{debug, error, warn};

fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresCdcSourceConfig {
    pub conninfo: String,
    pub slot_name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl PostgresCdcSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid postgres-cdc source options: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresCdcTargetConfig {
    pub conninfo: String,
    pub table: String,
    pub column: String,
}

impl PostgresCdcTargetConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid postgres-cdc target options: {e}")))
    }
}

struct CdcSourceMessage {
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
}

impl SourceMessage for CdcSourceMessage {
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

pub struct PostgresCdcSource {
    config: PostgresCdcSourceConfig,
}

impl PostgresCdcSource {
    pub fn new(config: PostgresCdcSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Source for PostgresCdcSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let (client, connection) = tokio_postgres::connect(&self.config.conninfo, NoTls)
            .await
            .map_err(|e| Error::transport(format!("postgres connect failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres-cdc connection closed with error");
            }
        });

        let create_slot_sql = format!(
            "SELECT 1 FROM pg_create_logical_replication_slot('{}', 'wal2json') \
             WHERE NOT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = '{}')",
            self.config.slot_name, self.config.slot_name
        );
        if let Err(e) = client.batch_execute(&create_slot_sql).await {
            warn!(error = %e, "failed to ensure logical replication slot exists (may already exist)");
        }

        let (tx, rx) = mpsc::channel(buffer);
        let slot_name = self.config.slot_name.clone();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        tokio::spawn(async move {
            loop {
                let rows = match client
                    .query(
                        "SELECT data FROM pg_logical_slot_get_changes($1, NULL, NULL)",
                        &[&slot_name],
                    )
                    .await
                {
                    Ok(rows) => rows,
                    Err(e) => {
                        error!(error = %e, "failed to poll logical replication slot");
                        tokio::time::sleep(poll_interval).await;
                        continue;
                    }
                };

                for row in rows {
                    let raw: String = row.get(0);
                    let mut metadata = HashMap::new();
                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) {
                        if let Some(kind) = parsed.get("kind").and_then(|v| v.as_str()) {
                            metadata.insert("pg-change-kind".to_string(), kind.to_string());
                        }
                        if let Some(table) = parsed.get("table").and_then(|v| v.as_str()) {
                            metadata.insert("pg-table".to_string(), table.to_string());
                        }
                    }
                    let source_msg = CdcSourceMessage {
                        id: Vec::new(),
                        data: raw.into_bytes(),
                        metadata,
                    };
                    match Message::new(Box::new(source_msg)) {
                        Ok(msg) => {
                            if tx.send(msg).await.is_err() {
                                debug!("postgres-cdc source queue closed, stopping poll loop");
                                return;
                            }
                        }
                        Err(e) => error!(error = %e, "failed to wrap postgres-cdc change"),
                    }
                }

                tokio::time::sleep(poll_interval).await;
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct PostgresCdcTarget {
    config: PostgresCdcTargetConfig,
    client: tokio::sync::OnceCell<tokio_postgres::Client>,
}

impl PostgresCdcTarget {
    pub fn new(config: PostgresCdcTargetConfig) -> Self {
        Self {
            config,
            client: tokio::sync::OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&tokio_postgres::Client> {
        self.client
            .get_or_try_init(|| async {
                let (client, connection) = tokio_postgres::connect(&self.config.conninfo, NoTls)
                    .await
                    .map_err(|e| Error::transport(format!("postgres connect failed: {e}")))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        error!(error = %e, "postgres-cdc target connection closed with error");
                    }
                });
                Ok::<_, Error>(client)
            })
            .await
    }
}

#[async_trait]
impl Target for PostgresCdcTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let client = self.client().await?;
        let data = String::from_utf8(msg.data())
            .map_err(|e| Error::DecodeError(format!("postgres-cdc target requires utf8 payload: {e}")))?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ($1)",
            self.config.table, self.config.column
        );
        client
            .execute(&sql, &[&data])
            .await
            .map_err(|e| Error::transport(format!("postgres insert failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("postgres-cdc", |options| {
        let config = PostgresCdcSourceConfig::from_options(options)?;
        Ok(Arc::new(PostgresCdcSource::new(config)) as Arc<dyn Source>)
    });
    registry.register_target("postgres-cdc", |options| {
        let config = PostgresCdcTargetConfig::from_options(options)?;
        Ok(Arc::new(PostgresCdcTarget::new(config)) as Arc<dyn Target>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_defaults_poll_interval() {
        let config = PostgresCdcSourceConfig::from_options(&serde_json::json!({
            "conninfo": "host=localhost user=postgres",
            "slot_name": "events_bridge_slot"
        }))
        .unwrap();
        assert_eq!(config.poll_interval_ms, 500);
    }
}
