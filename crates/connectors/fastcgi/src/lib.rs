//! FastCGI connector: Events Bridge acts as the FastCGI *responder*
//! (the role normally played by PHP-FPM or a similar app server), with
//! a web server such as nginx configured to forward requests to it.
//! FastCGI is request/response like CoAP and HTTP, so the same
//! `AckHandle`/`await_outcome` race delivers the worker's decision back
//! to the waiting connection (spec §4.5). There is no idiomatic
//! FastCGI egress direction, so this connector only registers a
//! [`Source`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use events_bridge_core::ack::{await_outcome, AckHandle, DeliveryOutcome};
use events_bridge_core::contract::{Source, SourceMessage};
use events_bridge_core::message::ReplyData;
use events_bridge_core::{Error, Message, Result};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_fastcgi::{Request as FastcgiRequest, Requests, RequestResult};
use tracing::{debug, error};

fn default_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FastcgiSourceConfig {
    pub bind: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_concurrent_requests: Option<u8>,
}

impl FastcgiSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid fastcgi source options: {e}")))
    }
}

struct FastcgiSourceMessage {
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    handle: AckHandle,
}

impl SourceMessage for FastcgiSourceMessage {
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

pub struct FastcgiSource {
    config: FastcgiSourceConfig,
}

impl FastcgiSource {
    pub fn new(config: FastcgiSourceConfig) -> Self {
        Self { config }
    }
}

async fn handle_request(
    request: &mut FastcgiRequest<tokio::net::tcp::OwnedReadHalf>,
    tx: mpsc::Sender<Message>,
    timeout: Duration,
) -> std::io::Result<RequestResult> {
    let mut metadata = HashMap::new();
    for (key, value) in request.str_params.iter() {
        metadata.insert(key.to_string(), value.to_string());
    }
    let body = request
        .get_str_stdin_contents()
        .unwrap_or_default()
        .into_bytes();

    let (handle, outcome_rx) = AckHandle::new();
    let source_msg = FastcgiSourceMessage {
        id: Vec::new(),
        data: body,
        metadata,
        handle,
    };
    let msg = match Message::new(Box::new(source_msg)) {
        Ok(msg) => msg,
        Err(e) => {
            error!(error = %e, "failed to wrap fastcgi request");
            return Ok(RequestResult::Complete(1));
        }
    };
    if tx.send(msg).await.is_err() {
        return Ok(RequestResult::Complete(1));
    }

    match await_outcome(outcome_rx, timeout).await {
        DeliveryOutcome::Ack(None) => {
            request
                .write(b"Status: 204 No Content\r\n\r\n")
                .await?;
            Ok(RequestResult::Complete(0))
        }
        DeliveryOutcome::Ack(Some(reply)) => {
            let content_type = reply
                .metadata
                .get("Content-Type")
                .cloned()
                .unwrap_or_else(|| "application/octet-stream".to_string());
            request
                .write(format!("Content-Type: {content_type}\r\n\r\n").as_bytes())
                .await?;
            request.write(&reply.data).await?;
            Ok(RequestResult::Complete(0))
        }
        DeliveryOutcome::Nak => {
            request
                .write(b"Status: 500 Internal Server Error\r\n\r\n")
                .await?;
            Ok(RequestResult::Complete(1))
        }
        DeliveryOutcome::TimedOut => {
            request
                .write(b"Status: 504 Gateway Timeout\r\n\r\n")
                .await?;
            Ok(RequestResult::Complete(1))
        }
    }
}

#[async_trait]
impl Source for FastcgiSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let listener = TcpListener::bind(&self.config.bind)
            .await
            .map_err(|e| Error::transport(format!("fastcgi bind failed: {e}")))?;
        let (tx, rx) = mpsc::channel(buffer);
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let max_concurrent = self.config.max_concurrent_requests.unwrap_or(10);

        tokio::spawn(async move {
            loop {
                let (stream, _peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "fastcgi accept failed, stopping listener");
                        break;
                    }
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (read_half, write_half) = stream.into_split();
                    let mut requests = Requests::from_split_socket(
                        (read_half, write_half),
                        max_concurrent,
                        max_concurrent,
                    );
                    loop {
                        match requests.next().await {
                            Ok(Some(mut request)) => {
                                let tx = tx.clone();
                                tokio::spawn(async move {
                                    let result = request
                                        .process(|req| handle_request(req, tx.clone(), timeout))
                                        .await;
                                    if let Err(e) = result {
                                        error!(error = %e, "fastcgi request processing failed");
                                    }
                                });
                            }
                            Ok(None) => {
                                debug!("fastcgi connection closed");
                                break;
                            }
                            Err(e) => {
                                error!(error = %e, "fastcgi protocol error");
                                break;
                            }
                        }
                    }
                });
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("fastcgi", |options| {
        let config = FastcgiSourceConfig::from_options(options)?;
        Ok(Arc::new(FastcgiSource::new(config)) as Arc<dyn Source>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_defaults_timeout_and_concurrency() {
        let config = FastcgiSourceConfig::from_options(&serde_json::json!({
            "bind": "127.0.0.1:9000"
        }))
        .unwrap();
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(config.max_concurrent_requests, None);
    }
}
