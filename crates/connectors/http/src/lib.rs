//! HTTP connector: an Axum server as [`Source`] (request held open until
//! the worker's ack/nak/reply or the configured deadline), a `reqwest`
//! client as [`Target`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as AxumResponse};
use axum::routing::post;
use axum::Router;
use events_bridge_core::ack::{await_outcome, AckHandle, DeliveryOutcome};
use events_bridge_core::contract::{Source, SourceMessage, Target};
use events_bridge_core::message::{Message, ReplyData};
use events_bridge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::error;

fn default_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpSourceConfig {
    pub bind: String,
    pub path: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl HttpSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid http source options: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpTargetConfig {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl HttpTargetConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid http target options: {e}")))
    }
}

struct HttpSourceMessage {
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    handle: AckHandle,
}

impl SourceMessage for HttpSourceMessage {
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
        self.handle.ack(reply);
        Ok(())
    }
    fn nak(&self) -> Result<()> {
        self.handle.nak();
        Ok(())
    }
}

#[derive(Clone)]
struct HttpSourceState {
    tx: mpsc::Sender<Message>,
    timeout: Duration,
}

async fn handle_ingest(
    State(state): State<HttpSourceState>,
    headers: HeaderMap,
    body: Bytes,
) -> AxumResponse {
    let mut metadata = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(value) = value.to_str() {
            metadata.insert(name.to_string(), value.to_string());
        }
    }

    let (handle, outcome_rx) = AckHandle::new();
    let source_msg = HttpSourceMessage {
        id: Vec::new(),
        data: body.to_vec(),
        metadata,
        handle,
    };
    let msg = match Message::new(Box::new(source_msg)) {
        Ok(msg) => msg,
        Err(e) => {
            error!(error = %e, "failed to wrap http request");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to accept request").into_response();
        }
    };
    if state.tx.send(msg).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "source queue closed").into_response();
    }

    match await_outcome(outcome_rx, state.timeout).await {
        DeliveryOutcome::Ack(None) => StatusCode::NO_CONTENT.into_response(),
        DeliveryOutcome::Ack(Some(reply)) => {
            let content_type = reply
                .metadata
                .get("Content-Type")
                .cloned()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            (
                StatusCode::OK,
                [("content-type", content_type)],
                reply.data,
            )
                .into_response()
        }
        DeliveryOutcome::Nak => (StatusCode::INTERNAL_SERVER_ERROR, "naked").into_response(),
        DeliveryOutcome::TimedOut => (StatusCode::GATEWAY_TIMEOUT, "no response from worker").into_response(),
    }
}

pub struct HttpSource {
    config: HttpSourceConfig,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(buffer);
        let state = HttpSourceState {
            tx,
            timeout: Duration::from_millis(self.config.timeout_ms),
        };
        let app = Router::new()
            .route(&self.config.path, post(handle_ingest))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind(&self.config.bind)
            .await
            .map_err(|e| Error::transport(format!("http bind failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "http source server exited");
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct HttpTarget {
    config: HttpTargetConfig,
    client: reqwest::Client,
}

impl HttpTarget {
    pub fn new(config: HttpTargetConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::config(format!("failed to build http client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Target for HttpTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let method = match self.config.method.as_deref().unwrap_or("POST") {
            "PUT" => reqwest::Method::PUT,
            "PATCH" => reqwest::Method::PATCH,
            _ => reqwest::Method::POST,
        };
        let mut request = self.client.request(method, &self.config.url).body(msg.data());
        for (key, value) in msg.metadata() {
            request = request.header(key, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(format!("http request failed: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(format!("http response read failed: {e}")))?;
        msg.set_metadata(
            events_bridge_core::message::METADATA_STATUS_KEY,
            status.as_u16().to_string(),
        );
        if !status.is_success() {
            return Err(Error::transport(format!("http target received status {status}")));
        }
        msg.set_data(body.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("http", |options| {
        let config = HttpSourceConfig::from_options(options)?;
        Ok(Arc::new(HttpSource::new(config)) as Arc<dyn Source>)
    });
    registry.register_target("http", |options| {
        let config = HttpTargetConfig::from_options(options)?;
        Ok(Arc::new(HttpTarget::new(config)?) as Arc<dyn Target>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_defaults_timeout() {
        let config = HttpSourceConfig::from_options(&serde_json::json!({
            "bind": "127.0.0.1:0",
            "path": "/ingest"
        }))
        .unwrap();
        assert_eq!(config.timeout_ms, 5000);
    }

    #[test]
    fn target_config_defaults_to_post() {
        let config = HttpTargetConfig::from_options(&serde_json::json!({
            "url": "http://localhost/ingest"
        }))
        .unwrap();
        assert_eq!(config.method, None);
    }
}
