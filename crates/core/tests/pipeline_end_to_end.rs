//! End-to-end integration test for the pipeline engine.
//!
//! Exercises the full Source -> Runner -> Target wiring through the
//! public `Pipeline`/`PipelineHandle` API only, the way a connector
//! crate would use it, rather than reaching into pipeline internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use events_bridge_core::contract::{Runner, Source, SourceMessage, Target};
use events_bridge_core::message::ReplyData;
use events_bridge_core::{Error, Message, Pipeline, PipelineConfig, Result};
use tokio::sync::{mpsc, Mutex};

struct FixtureMessage {
    data: Vec<u8>,
    acked: Arc<AtomicUsize>,
    naked: Arc<AtomicUsize>,
}

impl SourceMessage for FixtureMessage {
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
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn nak(&self) -> Result<()> {
        self.naked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FixedSource {
    payloads: Vec<&'static str>,
    acked: Arc<AtomicUsize>,
    naked: Arc<AtomicUsize>,
}

#[async_trait]
impl Source for FixedSource {
    async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
        let (tx, rx) = mpsc::channel(buffer);
        let payloads = self.payloads.clone();
        let acked = self.acked.clone();
        let naked = self.naked.clone();
        tokio::spawn(async move {
            for payload in payloads {
                let src = FixtureMessage {
                    data: payload.as_bytes().to_vec(),
                    acked: acked.clone(),
                    naked: naked.clone(),
                };
                let msg = Message::new(Box::new(src)).unwrap();
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A runner that uppercases the payload and tags it with a sequence
/// number, mirroring what a real transform connector does in-place.
struct UppercaseRunner {
    seen: AtomicUsize,
}

#[async_trait]
impl Runner for UppercaseRunner {
    async fn process(&self, msg: &mut Message) -> Result<()> {
        let upper = String::from_utf8_lossy(&msg.data()).to_uppercase();
        let seq = self.seen.fetch_add(1, Ordering::SeqCst);
        msg.set_data(upper.into_bytes());
        msg.set_metadata("seq", seq.to_string());
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct RejectingRunner;

#[async_trait]
impl Runner for RejectingRunner {
    async fn process(&self, _msg: &mut Message) -> Result<()> {
        Err(Error::transport("runner refuses everything"))
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct CapturingTarget {
    captured: Mutex<Vec<(String, HashMap<String, String>)>>,
}

#[async_trait]
impl Target for CapturingTarget {
    async fn consume(&self, msg: &mut Message) -> Result<()> {
        let body = String::from_utf8_lossy(&msg.data()).to_string();
        self.captured.lock().await.push((body, msg.metadata()));
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn messages_flow_through_runner_chain_and_are_acked() {
    let acked = Arc::new(AtomicUsize::new(0));
    let naked = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(FixedSource {
        payloads: vec!["hello", "world"],
        acked: acked.clone(),
        naked: naked.clone(),
    });
    let runner: Arc<dyn Runner> = Arc::new(UppercaseRunner {
        seen: AtomicUsize::new(0),
    });
    let target = Arc::new(CapturingTarget {
        captured: Mutex::new(Vec::new()),
    });

    let pipeline = Pipeline::new(
        source,
        vec![runner],
        target.clone(),
        PipelineConfig {
            buffer_size: 8,
            worker_count: 1,
            ..Default::default()
        },
    );
    let handle = pipeline.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await.unwrap();

    let results = target.captured.lock().await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "HELLO");
    assert_eq!(results[1].0, "WORLD");
    assert_eq!(acked.load(Ordering::SeqCst), 2);
    assert_eq!(naked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn runner_failure_naks_and_never_reaches_the_target() {
    let acked = Arc::new(AtomicUsize::new(0));
    let naked = Arc::new(AtomicUsize::new(0));
    let source = Arc::new(FixedSource {
        payloads: vec!["doomed"],
        acked: acked.clone(),
        naked: naked.clone(),
    });
    let runner: Arc<dyn Runner> = Arc::new(RejectingRunner);
    let target = Arc::new(CapturingTarget {
        captured: Mutex::new(Vec::new()),
    });

    let pipeline = Pipeline::new(source, vec![runner], target.clone(), PipelineConfig::default());
    let handle = pipeline.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await.unwrap();

    assert!(target.captured.lock().await.is_empty());
    assert_eq!(acked.load(Ordering::SeqCst), 0);
    assert_eq!(naked.load(Ordering::SeqCst), 1);
}
