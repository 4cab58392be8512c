//! CoAP connector: a UDP server [`Source`] answering each request with the
//! worker's ack decision, and a client [`Target`] that POSTs outbound.
//!
//! The source's per-request handler races the worker's ack/nak/reply
//! against the configured response deadline using the same
//! [`events_bridge_core::ack::AckHandle`]/`await_outcome` pair every
//! request/response connector uses, then maps the outcome onto a CoAP
//! response code: `2.04 Changed` for a bare ack, `2.05 Content` for a
//! reply carrying a body, `5.00` for a nak, and `5.04 Gateway Timeout`
//! when nothing lands before the deadline (spec §8 scenarios 2-4).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coap_lite::{CoapOption, ContentFormat, MessageClass, Packet, PacketType, RequestType, ResponseType};
use events_bridge_core::ack::{await_outcome, AckHandle};
use events_bridge_core::contract::{Source, SourceMessage, Target};
use events_bridge_core::message::{Message, ReplyData};
use events_bridge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const METADATA_PATH_KEY: &str = "coap-path";
const METADATA_CONTENT_FORMAT_KEY: &str = "coap-content-format";
const METADATA_CONTENT_TYPE_KEY: &str = "Content-Type";

fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoapSourceConfig {
    pub bind: String,
    pub path: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl CoapSourceConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid coap source options: {e}")))
    }

    fn normalized_path(&self) -> String {
        self.path.trim_start_matches('/').to_string()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoapTargetConfig {
    pub addr: String,
    pub path: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl CoapTargetConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid coap target options: {e}")))
    }
}

struct CoapSourceMessage {
    id: Vec<u8>,
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    handle: AckHandle,
}

impl SourceMessage for CoapSourceMessage {
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

pub struct CoapSource {
    config: CoapSourceConfig,
    socket: tokio::sync::Mutex<Option<Arc<UdpSocket>>>,
}

impl CoapSource {
    pub fn new(config: CoapSourceConfig) -> Self {
        Self {
            config,
            socket: tokio::sync::Mutex::new(None),
        }
    }
}

fn response_packet(request: &Packet, code: ResponseType, payload: Vec<u8>, content_format: Option<ContentFormat>) -> Packet {
    let mut response = Packet::new();
    response.header.set_version(1);
    response.header.set_type(PacketType::Acknowledgement);
    response.header.code = MessageClass::Response(code);
    response.header.message_id = request.header.message_id;
    response.set_token(request.get_token().to_vec());
    if let Some(cf) = content_format {
        response.set_content_format(cf);
    }
    response.payload = payload;
    response
}

fn content_format_for(metadata: &HashMap<String, String>) -> Option<ContentFormat> {
    let content_type = metadata
        .get(METADATA_CONTENT_TYPE_KEY)
        .map(|s| s.as_str())?;
    match content_type {
        "application/json" => Some(ContentFormat::ApplicationJSON),
        "text/plain" | "text/plain;charset=utf-8" => Some(ContentFormat::TextPlain),
        "application/octet-stream" => Some(ContentFormat::ApplicationOctetStream),
        _ => None,
    }
}

async fn handle_one_datagram(
    socket: Arc<UdpSocket>,
    buf: Vec<u8>,
    peer: SocketAddr,
    path: String,
    timeout: Duration,
    tx: mpsc::Sender<Message>,
) {
    let request = match Packet::from_bytes(&buf) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "dropping unparseable coap datagram");
            return;
        }
    };

    if request.header.code != MessageClass::Request(RequestType::Post) {
        let response = response_packet(&request, ResponseType::MethodNotAllowed, Vec::new(), None);
        send_response(&socket, &response, peer).await;
        return;
    }
    if request.get_path() != path {
        let response = response_packet(&request, ResponseType::NotFound, Vec::new(), None);
        send_response(&socket, &response, peer).await;
        return;
    }

    let mut metadata = HashMap::new();
    metadata.insert(METADATA_PATH_KEY.to_string(), request.get_path());
    if let Some(format) = request.get_content_format() {
        metadata.insert(METADATA_CONTENT_FORMAT_KEY.to_string(), format!("{format:?}"));
    }

    let (handle, outcome_rx) = AckHandle::new();
    let source_msg = CoapSourceMessage {
        id: request.get_token().to_vec(),
        data: request.payload.clone(),
        metadata,
        handle,
    };

    let msg = match Message::new(Box::new(source_msg)) {
        Ok(msg) => msg,
        Err(e) => {
            error!(error = %e, "failed to wrap coap request");
            return;
        }
    };

    if tx.send(msg).await.is_err() {
        debug!("coap source queue closed, dropping request");
        return;
    }

    let response = match await_outcome(outcome_rx, timeout).await {
        events_bridge_core::ack::DeliveryOutcome::Ack(None) => {
            response_packet(&request, ResponseType::Changed, Vec::new(), None)
        }
        events_bridge_core::ack::DeliveryOutcome::Ack(Some(reply)) => {
            let content_format = content_format_for(&reply.metadata);
            response_packet(&request, ResponseType::Content, reply.data, content_format)
        }
        events_bridge_core::ack::DeliveryOutcome::Nak => {
            response_packet(&request, ResponseType::InternalServerError, Vec::new(), None)
        }
        events_bridge_core::ack::DeliveryOutcome::TimedOut => {
            response_packet(&request, ResponseType::GatewayTimeout, Vec::new(), None)
        }
    };
    send_response(&socket, &response, peer).await;
}

async fn send_response(socket: &UdpSocket, response: &Packet, peer: SocketAddr) {
    match response.to_bytes() {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                error!(error = %e, "failed to send coap response");
            }
        }
        Err(e) => error!(error = %e, "failed to encode coap response"),
    }
}

#[async_trait]
impl Source for CoapSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let socket = UdpSocket::bind(&self.config.bind)
            .await
            .map_err(|e| Error::transport(format!("coap bind failed: {e}")))?;
        let socket = Arc::new(socket);
        *self.socket.lock().await = Some(Arc::clone(&socket));

        let (tx, rx) = mpsc::channel(buffer);
        let path = self.config.normalized_path();
        let timeout = Duration::from_millis(self.config.timeout_ms);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf).await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(error = %e, "coap socket recv failed, stopping listener");
                        break;
                    }
                };
                let datagram = buf[..n].to_vec();
                let socket = Arc::clone(&socket);
                let path = path.clone();
                let tx = tx.clone();
                tokio::spawn(handle_one_datagram(socket, datagram, peer, path, timeout, tx));
            }
        });

        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        *self.socket.lock().await = None;
        Ok(())
    }
}

static CLIENT_COUNTER: AtomicU16 = AtomicU16::new(1);

pub struct CoapTarget {
    config: CoapTargetConfig,
}

impl CoapTarget {
    pub fn new(config: CoapTargetConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Target for CoapTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| Error::transport(format!("coap client bind failed: {e}")))?;
        socket
            .connect(&self.config.addr)
            .await
            .map_err(|e| Error::transport(format!("coap connect failed: {e}")))?;

        let mut request = Packet::new();
        request.header.set_version(1);
        request.header.set_type(PacketType::Confirmable);
        request.header.code = MessageClass::Request(RequestType::Post);
        let id = CLIENT_COUNTER.fetch_add(1, Ordering::SeqCst);
        request.header.message_id = id;
        request.set_token(id.to_be_bytes().to_vec());
        request.add_option(CoapOption::UriPath, self.config.path.clone().into_bytes());
        request.payload = msg.data();

        let bytes = request
            .to_bytes()
            .map_err(|e| Error::transport(format!("coap encode failed: {e}")))?;
        socket
            .send(&bytes)
            .await
            .map_err(|e| Error::transport(format!("coap send failed: {e}")))?;

        let mut buf = vec![0u8; 64 * 1024];
        let n = tokio::time::timeout(
            Duration::from_millis(self.config.timeout_ms),
            socket.recv(&mut buf),
        )
        .await
        .map_err(|_| Error::TimeoutError(Duration::from_millis(self.config.timeout_ms)))?
        .map_err(|e| Error::transport(format!("coap recv failed: {e}")))?;

        let response = Packet::from_bytes(&buf[..n])
            .map_err(|e| Error::transport(format!("coap response decode failed: {e}")))?;

        match response.header.code {
            MessageClass::Response(ResponseType::Content) => {
                msg.set_data(response.payload);
                msg.set_metadata(events_bridge_core::message::METADATA_STATUS_KEY, "content");
                Ok(())
            }
            MessageClass::Response(ResponseType::Changed)
            | MessageClass::Response(ResponseType::Created)
            | MessageClass::Response(ResponseType::Valid) => {
                msg.set_metadata(events_bridge_core::message::METADATA_STATUS_KEY, "changed");
                Ok(())
            }
            MessageClass::Response(ResponseType::GatewayTimeout) => {
                Err(Error::TimeoutError(Duration::from_millis(self.config.timeout_ms)))
            }
            other => Err(Error::transport(format!("coap target received {other:?}"))),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_source("coap", |options| {
        let config = CoapSourceConfig::from_options(options)?;
        Ok(Arc::new(CoapSource::new(config)) as Arc<dyn Source>)
    });
    registry.register_target("coap", |options| {
        let config = CoapTargetConfig::from_options(options)?;
        Ok(Arc::new(CoapTarget::new(config)) as Arc<dyn Target>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_config_defaults_timeout() {
        let config = CoapSourceConfig::from_options(&serde_json::json!({
            "bind": "127.0.0.1:0",
            "path": "/ingest"
        }))
        .unwrap();
        assert_eq!(config.timeout_ms, 2000);
        assert_eq!(config.normalized_path(), "ingest");
    }

    #[test]
    fn content_format_maps_known_mime_types() {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_CONTENT_TYPE_KEY.to_string(), "application/json".to_string());
        assert_eq!(content_format_for(&metadata), Some(ContentFormat::ApplicationJSON));
    }

    #[test]
    fn content_format_is_none_for_unknown_mime_type() {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_CONTENT_TYPE_KEY.to_string(), "application/x-weird".to_string());
        assert_eq!(content_format_for(&metadata), None);
    }

    #[tokio::test]
    async fn ack_with_no_reply_yields_changed_response() {
        let request = {
            let mut p = Packet::new();
            p.header.set_type(PacketType::Confirmable);
            p.header.code = MessageClass::Request(RequestType::Post);
            p.header.message_id = 7;
            p.set_token(vec![1, 2, 3]);
            p.add_option(CoapOption::UriPath, b"ingest".to_vec());
            p.payload = b"hello-udp-ack".to_vec();
            p
        };
        let response = response_packet(&request, ResponseType::Changed, Vec::new(), None);
        assert_eq!(response.header.code, MessageClass::Response(ResponseType::Changed));
        assert_eq!(response.get_token(), request.get_token());
        assert_eq!(response.header.message_id, request.header.message_id);
    }
}
