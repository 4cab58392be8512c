//! Connector contracts (spec §4.2–§4.4, §6).
//!
//! Grounded in `runtime-core/src/transport/mod.rs`'s `PipelineTransport`
//! and `runtime-core/src/nodes/registry.rs`'s `NodeFactory`: async,
//! object-safe traits behind `Box`/`Arc` so the registry can hand out
//! trait objects without the pipeline knowing which transport it wound up
//! with.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::{Message, ReplyData};
use crate::vfs::Filesystem;

/// The uniform ack/reply contract on a source-specific message (spec §6).
///
/// Implemented by each connector's own message type (e.g. a NATS message
/// wrapping a `Subscriber` reply handle, a CoAP message wrapping the
/// request's response channel). `ack`/`nak` must be one-shot: a second
/// call is a no-op that returns `Ok(())`, never an error, matching spec
/// §8 invariant 1.
pub trait SourceMessage: Send + Sync {
    /// Opaque id supplied by the source. Need not be unique; may be empty.
    fn id(&self) -> &[u8];

    /// Metadata snapshot at the time the source produced this message.
    fn metadata(&self) -> Result<HashMap<String, String>>;

    /// Payload snapshot at the time the source produced this message.
    fn data(&self) -> Result<Vec<u8>>;

    /// One-shot positive terminal transition. `reply.is_some()` sends a
    /// transport-native response body; `None` sends a bare success
    /// indicator.
    fn ack(&self, reply: Option<ReplyData>) -> Result<()>;

    /// One-shot negative terminal transition.
    fn nak(&self) -> Result<()>;

    /// Optional filesystem view backing this message's payload. Returning
    /// `None` lets `Message` fall back to a default virtual single-file
    /// view over `data()`.
    fn filesystem(&self) -> Option<Arc<dyn Filesystem>> {
        None
    }
}

/// Produces a bounded stream of messages from an external input
/// (spec §4.2).
#[async_trait]
pub trait Source: Send + Sync {
    /// Start background production and return the receiving half of a
    /// channel of capacity `buffer`. The source MUST send at most
    /// `buffer` un-consumed messages before its producer task blocks —
    /// the system's sole ingress back-pressure mechanism (spec §8
    /// invariant 2).
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>>;

    /// Idempotent. Stops accepting new input, drains in-flight
    /// terminations, and closes the stream.
    async fn close(&self) -> Result<()>;
}

/// Transforms a message in place, synchronously with respect to the
/// pipeline's per-message ordering guarantee (never invoked concurrently
/// on the same message), though the call itself is `async` so runners can
/// cooperate with cancellation (spec §4.3, §9 "Coroutines → tasks").
#[async_trait]
pub trait Runner: Send + Sync {
    /// Must return within the runner's configured timeout. On timeout the
    /// pipeline engine returns a `TimeoutError` on the runner's behalf and
    /// the runner must not go on mutating the message after that point —
    /// runners that spawn background work must check a cancellation
    /// signal rather than relying on the engine to kill a thread.
    async fn process(&self, msg: &mut Message) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Consumes a message, emitting it to an external sink (spec §4.4).
#[async_trait]
pub trait Target: Send + Sync {
    /// Publishes the message's current data/metadata (falling back to
    /// source values for anything unmodified). For request/response
    /// targets, a successful call may rewrite `msg`'s data/metadata with
    /// the captured response (setting `eb-status` and a transport-native
    /// content-format key) before returning.
    async fn consume(&self, msg: &mut Message) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoopRunner {
        ran: AtomicBool,
    }

    #[async_trait]
    impl Runner for NoopRunner {
        async fn process(&self, msg: &mut Message) -> Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            msg.set_metadata("seen-by", "noop");
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FixtureSourceMessage {
        data: Vec<u8>,
    }

    impl SourceMessage for FixtureSourceMessage {
        fn id(&self) -> &[u8] {
            b"fixture"
        }
        fn metadata(&self) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
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

    #[tokio::test]
    async fn runner_trait_object_is_callable() {
        let runner: Box<dyn Runner> = Box::new(NoopRunner {
            ran: AtomicBool::new(false),
        });
        let src = FixtureSourceMessage {
            data: b"x".to_vec(),
        };
        let mut msg = Message::new(Box::new(src)).unwrap();
        runner.process(&mut msg).await.unwrap();
        assert_eq!(msg.metadata().get("seen-by").unwrap(), "noop");
    }
}
