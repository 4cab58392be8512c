//! events-bridge-core: the transport-independent message pipeline.
//!
//! This crate is the part of Events Bridge that every transport plugs
//! into: a uniform [`message::Message`] abstraction with per-message
//! ack/reply state, a back-pressured channel between source and
//! runner/target ([`pipeline`]), the [`contract`]s any transport must
//! satisfy, the [`registry`] that maps a connector kind string to
//! concrete implementations, a [`vfs`] for structured payloads, and the
//! [`frame`] codec used by subprocess-based connectors.
//!
//! Individual transports (NATS, CoAP, MQTT, Kafka, Redis, Pub/Sub, gRPC,
//! HTTP, PostgreSQL CDC, FastCGI, Docker exec, embedded scripts) are
//! separate crates under `crates/connectors/`; this crate knows nothing
//! about any of them.

pub mod ack;
pub mod config;
pub mod contract;
pub mod error;
pub mod frame;
pub mod message;
pub mod pipeline;
pub mod registry;
pub mod resilience;
pub mod vfs;

pub use error::{Error, Result};
pub use message::{AckState, Message, ReplyData};
pub use pipeline::{Pipeline, PipelineConfig, PipelineHandle};
pub use registry::ConnectorRegistry;
