//! Pipeline engine: wires Source → Runner(s) → Target, owns the bounded
//! queue, worker pool, and shutdown signal (spec §3.4, §4.5).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::contract::{Runner, Source, Target};
use crate::error::{Error, Result};
use crate::message::{Message, ReplyData};

/// Tunables for one running pipeline (spec §3.3, §3.4).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Capacity of the bounded channel between source and workers — the
    /// system's sole ingress back-pressure mechanism.
    pub buffer_size: usize,
    /// Number of worker tasks draining the queue. `> 1` means messages
    /// may be Acked out of source order (spec §3.4, §5).
    pub worker_count: usize,
    /// Per-runner deadline (spec §4.3).
    pub runner_timeout: Duration,
    /// Per-target deadline (spec §4.4).
    pub target_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            worker_count: 1,
            runner_timeout: Duration::from_secs(5),
            target_timeout: Duration::from_secs(5),
        }
    }
}

/// One running (Source, Runners, Target) triple.
pub struct Pipeline {
    source: Arc<dyn Source>,
    runners: Vec<Arc<dyn Runner>>,
    target: Arc<dyn Target>,
    config: PipelineConfig,
}

/// Handle to a started pipeline. Dropping it does not stop the pipeline —
/// call `shutdown` explicitly, mirroring `runtime-core`'s `SessionHandle`
/// lifecycle (explicit `close`, no stop-on-drop surprises).
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    source: Arc<dyn Source>,
    runners: Vec<Arc<dyn Runner>>,
    target: Arc<dyn Target>,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn Source>,
        runners: Vec<Arc<dyn Runner>>,
        target: Arc<dyn Target>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            runners,
            target,
            config,
        }
    }

    /// Start production and the worker pool.
    pub async fn start(self) -> Result<PipelineHandle> {
        let rx = self.source.produce(self.config.buffer_size).await?;
        let shared_rx = Arc::new(Mutex::new(rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(self.config.worker_count);
        for worker_id in 0..self.config.worker_count {
            let rx = Arc::clone(&shared_rx);
            let runners = self.runners.clone();
            let target = Arc::clone(&self.target);
            let runner_timeout = self.config.runner_timeout;
            let target_timeout = self.config.target_timeout;
            let mut shutdown_rx = shutdown_rx.clone();

            workers.push(tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        debug!(worker_id, "worker exiting: shutdown already signaled");
                        break;
                    }
                    let msg = {
                        let mut guard = rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => None,
                            msg = guard.recv() => msg,
                        }
                    };
                    let Some(mut msg) = msg else {
                        debug!(worker_id, "worker exiting: queue closed or shutdown");
                        break;
                    };
                    run_one_message(&runners, &target, &mut msg, runner_timeout, target_timeout)
                        .await;
                }
            }));
        }

        Ok(PipelineHandle {
            shutdown_tx,
            workers,
            source: self.source,
            runners: self.runners,
            target: self.target,
        })
    }
}

/// The per-message algorithm of spec §4.5: run the runner chain in order,
/// then the target, then invoke exactly one terminal transition. A panic
/// anywhere in this path is caught at the barrier below and downgraded to
/// a Nak, per spec §7 ("no panics escape connector boundaries").
async fn run_one_message(
    runners: &[Arc<dyn Runner>],
    target: &Arc<dyn Target>,
    msg: &mut Message,
    runner_timeout: Duration,
    target_timeout: Duration,
) {
    let outcome = process_through_chain(runners, target, msg, runner_timeout, target_timeout).await;
    match outcome {
        Ok(reply) => {
            if let Err(e) = msg.ack(reply) {
                error!(error = %e, "ack delivery failed");
            }
        }
        Err(e) => {
            warn!(error = %e, "message naked");
            if let Err(e) = msg.nak() {
                error!(error = %e, "nak delivery failed");
            }
        }
    }
}

async fn process_through_chain(
    runners: &[Arc<dyn Runner>],
    target: &Arc<dyn Target>,
    msg: &mut Message,
    runner_timeout: Duration,
    target_timeout: Duration,
) -> Result<Option<ReplyData>> {
    for runner in runners {
        let runner = Arc::clone(runner);
        let result = {
            // `AssertUnwindSafe`: `Message`'s interior mutability is all
            // behind locks that simply get poisoned-free (parking_lot)
            // on an unwind; a caught panic here never leaves the message
            // in a torn state visible to the next runner because the
            // chain aborts to Nak immediately after.
            let fut = std::panic::AssertUnwindSafe(async {
                tokio::time::timeout(runner_timeout, runner.process(msg)).await
            });
            futures::FutureExt::catch_unwind(fut).await
        };
        match result {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_elapsed)) => return Err(Error::TimeoutError(runner_timeout)),
            Err(panic) => {
                let msg = panic_message(panic);
                error!(panic = %msg, "runner panicked; converting to nak");
                return Err(Error::Fatal(format!("panic in connector: {msg}")));
            }
        }
    }

    let result = {
        let fut = std::panic::AssertUnwindSafe(async {
            tokio::time::timeout(target_timeout, target.consume(msg)).await
        });
        futures::FutureExt::catch_unwind(fut).await
    };
    match result {
        Ok(Ok(Ok(()))) => Ok(None),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(_elapsed)) => Err(Error::TimeoutError(target_timeout)),
        Err(panic) => {
            let panic_msg = panic_message(panic);
            error!(panic = %panic_msg, "target panicked; converting to nak");
            Err(Error::Fatal(format!("panic in connector: {panic_msg}")))
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl PipelineHandle {
    /// Close the shutdown signal, let in-flight workers finish their
    /// current message, then close target → runners (reverse order) →
    /// source (spec §4.5 "Cancellation").
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task join failed");
            }
        }

        self.target.close().await?;
        for runner in self.runners.iter().rev() {
            runner.close().await?;
        }
        self.source.close().await?;
        info!("pipeline shut down cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::SourceMessage;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct VecSource {
        items: Mutex<Vec<&'static str>>,
    }

    struct VecSourceMessage {
        data: &'static str,
        acked: Arc<AtomicUsize>,
        naked: Arc<AtomicUsize>,
    }

    impl SourceMessage for VecSourceMessage {
        fn id(&self) -> &[u8] {
            b""
        }
        fn metadata(&self) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }
        fn data(&self) -> Result<Vec<u8>> {
            Ok(self.data.as_bytes().to_vec())
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

    #[async_trait]
    impl Source for VecSource {
        async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
            let (tx, rx) = mpsc::channel(buffer);
            let items = self.items.lock().await.clone();
            tokio::spawn(async move {
                for item in items {
                    let src = VecSourceMessage {
                        data: item,
                        acked: Arc::new(AtomicUsize::new(0)),
                        naked: Arc::new(AtomicUsize::new(0)),
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

    struct CountingTarget {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Target for CountingTarget {
        async fn consume(&self, _msg: &mut Message) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingTarget;
    #[async_trait]
    impl Target for FailingTarget {
        async fn consume(&self, _msg: &mut Message) -> Result<()> {
            Err(Error::transport("simulated failure"))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_messages_are_consumed_and_acked() {
        let source = Arc::new(VecSource {
            items: Mutex::new(vec!["a", "b", "c"]),
        });
        let count = Arc::new(AtomicUsize::new(0));
        let target = Arc::new(CountingTarget {
            count: count.clone(),
        });
        let pipeline = Pipeline::new(
            source,
            vec![],
            target,
            PipelineConfig {
                buffer_size: 8,
                worker_count: 2,
                ..Default::default()
            },
        );
        let handle = pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn target_error_naks_instead_of_acking() {
        let source = Arc::new(VecSource {
            items: Mutex::new(vec!["a"]),
        });
        let target = Arc::new(FailingTarget);
        let pipeline = Pipeline::new(source, vec![], target, PipelineConfig::default());
        let handle = pipeline.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await.unwrap();
    }
}
