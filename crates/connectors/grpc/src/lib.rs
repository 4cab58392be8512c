//! Generic gRPC connector.
//!
//! Events Bridge does not ship a fixed `.proto`, so the payload is treated
//! as an opaque byte string. This is implemented the way `tonic-build`
//! generated code would be, but by hand: a pass-through [`BytesCodec`] in
//! place of a Protobuf codec, and a single [`GrpcSourceService`] always
//! registered under the fixed service name [`SERVICE_NAME`]. The
//! configured `method` is not used to pick a handler (there is only one)
//! but is enforced: calls to any other method on the service are rejected
//! with `UNIMPLEMENTED` rather than silently accepted.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut};
use events_bridge_core::ack::{await_outcome, AckHandle, DeliveryOutcome};
use events_bridge_core::contract::{Source, SourceMessage, Target};
use events_bridge_core::message::{Message, ReplyData};
use events_bridge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http;
use tonic::server::NamedService;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};
use tracing::error;

fn default_timeout_ms() -> u64 {
    5000
}

/// Fixed service name every [`GrpcSource`] registers under.
///
/// `tonic::server::NamedService::NAME` is a compile-time associated
/// constant, so it cannot be driven by a runtime config value; operators
/// point clients at this fixed name rather than configuring their own.
const SERVICE_NAME: &str = "events_bridge.DynamicBridge";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GrpcSourceConfig {
    pub bind: String,
    pub method: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl GrpcSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid grpc source options: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GrpcTargetConfig {
    pub endpoint: String,
    pub path: String,
}

impl GrpcTargetConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid grpc target options: {e}")))
    }
}

#[derive(Clone, Default)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Vec<u8>;
    type Decode = Vec<u8>;
    type Encoder = BytesCodec;
    type Decoder = BytesCodec;

    fn encoder(&mut self) -> Self::Encoder {
        BytesCodec
    }
    fn decoder(&mut self) -> Self::Decoder {
        BytesCodec
    }
}

impl Encoder for BytesCodec {
    type Item = Vec<u8>;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, buf: &mut EncodeBuf<'_>) -> std::result::Result<(), Status> {
        buf.put_slice(&item);
        Ok(())
    }
}

impl Decoder for BytesCodec {
    type Item = Vec<u8>;
    type Error = Status;

    fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> std::result::Result<Option<Self::Item>, Status> {
        let len = buf.remaining();
        Ok(Some(buf.copy_to_bytes(len).to_vec()))
    }
}

struct GrpcSourceMessage {
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    handle: AckHandle,
}

impl SourceMessage for GrpcSourceMessage {
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
struct GrpcUnaryHandler {
    tx: mpsc::Sender<Message>,
    timeout: Duration,
}

impl tonic::server::UnaryService<Vec<u8>> for GrpcUnaryHandler {
    type Response = Vec<u8>;
    type Future = Pin<Box<dyn std::future::Future<Output = std::result::Result<Response<Vec<u8>>, Status>> + Send>>;

    fn call(&mut self, request: Request<Vec<u8>>) -> Self::Future {
        let tx = self.tx.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            let mut metadata = HashMap::new();
            for entry in request.metadata().iter() {
                if let tonic::metadata::KeyAndValueRef::Ascii(key, value) = entry {
                    if let Ok(value) = value.to_str() {
                        metadata.insert(key.to_string(), value.to_string());
                    }
                }
            }
            let (handle, outcome_rx) = AckHandle::new();
            let source_msg = GrpcSourceMessage {
                id: Vec::new(),
                data: request.into_inner(),
                metadata,
                handle,
            };
            let msg = Message::new(Box::new(source_msg))
                .map_err(|e| Status::internal(format!("failed to wrap grpc request: {e}")))?;
            tx.send(msg)
                .await
                .map_err(|_| Status::unavailable("grpc source queue closed"))?;

            match await_outcome(outcome_rx, timeout).await {
                DeliveryOutcome::Ack(reply) => {
                    Ok(Response::new(reply.map(|r| r.data).unwrap_or_default()))
                }
                DeliveryOutcome::Nak => Err(Status::aborted("message naked by worker")),
                DeliveryOutcome::TimedOut => Err(Status::deadline_exceeded("worker did not respond in time")),
            }
        })
    }
}

#[derive(Clone)]
struct GrpcSourceService {
    handler: GrpcUnaryHandler,
    method_path: Arc<str>,
}

impl NamedService for GrpcSourceService {
    const NAME: &'static str = SERVICE_NAME;
}

impl tonic::codegen::Service<http::Request<tonic::transport::Body>> for GrpcSourceService {
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<tonic::transport::Body>) -> Self::Future {
        let handler = self.handler.clone();
        let method_path = self.method_path.clone();
        Box::pin(async move {
            if req.uri().path() != method_path.as_ref() {
                return Ok(Status::unimplemented(format!(
                    "no handler registered for {}, expected {}",
                    req.uri().path(),
                    method_path
                ))
                .to_http());
            }
            let mut grpc = tonic::server::Grpc::new(BytesCodec::default());
            Ok(grpc.unary(handler, req).await)
        })
    }
}

pub struct GrpcSource {
    config: GrpcSourceConfig,
}

impl GrpcSource {
    pub fn new(config: GrpcSourceConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Source for GrpcSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(buffer);
        let addr = self
            .config
            .bind
            .parse()
            .map_err(|e| Error::config(format!("invalid grpc bind address: {e}")))?;
        let service = GrpcSourceService {
            handler: GrpcUnaryHandler {
                tx,
                timeout: Duration::from_millis(self.config.timeout_ms),
            },
            method_path: Arc::from(format!("/{SERVICE_NAME}/{}", self.config.method).as_str()),
        };

        tokio::spawn(async move {
            if let Err(e) = tonic::transport::Server::builder()
                .add_service(service)
                .serve(addr)
                .await
            {
                error!(error = %e, "grpc source server exited");
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct GrpcTarget {
    config: GrpcTargetConfig,
    channel: tokio::sync::OnceCell<Channel>,
}

impl GrpcTarget {
    pub fn new(config: GrpcTargetConfig) -> Self {
        Self {
            config,
            channel: tokio::sync::OnceCell::new(),
        }
    }

    async fn channel(&self) -> Result<Channel> {
        let channel = self
            .channel
            .get_or_try_init(|| async {
                Channel::from_shared(self.config.endpoint.clone())
                    .map_err(|e| Error::config(format!("invalid grpc endpoint: {e}")))?
                    .connect()
                    .await
                    .map_err(|e| Error::transport(format!("grpc connect failed: {e}")))
            })
            .await?;
        Ok(channel.clone())
    }
}

#[async_trait]
impl Target for GrpcTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let channel = self.channel().await?;
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| Error::transport(format!("grpc channel not ready: {e}")))?;
        let path = tonic::codegen::http::uri::PathAndQuery::try_from(self.config.path.as_str())
            .map_err(|e| Error::config(format!("invalid grpc method path: {e}")))?;
        let response = grpc
            .unary(Request::new(msg.data()), path, BytesCodec::default())
            .await
            .map_err(|e| Error::transport(format!("grpc unary call failed: {e}")))?;
        msg.set_data(response.into_inner());
        msg.set_metadata(events_bridge_core::message::METADATA_STATUS_KEY, "ok");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("grpc", |options| {
        let config = GrpcSourceConfig::from_options(options)?;
        Ok(Arc::new(GrpcSource::new(config)) as Arc<dyn Source>)
    });
    registry.register_target("grpc", |options| {
        let config = GrpcTargetConfig::from_options(options)?;
        Ok(Arc::new(GrpcTarget::new(config)) as Arc<dyn Target>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_parses() {
        let config = GrpcSourceConfig::from_options(&serde_json::json!({
            "bind": "127.0.0.1:50051",
            "method": "Ingest"
        }))
        .unwrap();
        assert_eq!(config.timeout_ms, 5000);
    }

    #[test]
    fn source_config_rejects_missing_method() {
        let result = GrpcSourceConfig::from_options(&serde_json::json!({
            "bind": "127.0.0.1:50051"
        }));
        assert!(result.is_err());
    }
}
