//! Embedded-script runner (spec §4.3, §9 "Interpreter runners").
//!
//! The original family of embedded interpreters (ES5, Scriggo-Go) is
//! specified only by the `Runner` contract; this crate picks one
//! concrete, idiomatically-Rust embeddable JS engine to satisfy it.
//! Rather than bind the raw `Message` into the interpreter, each
//! invocation serializes `data`/`metadata` to JSON, evaluates a small
//! wrapper around the configured source that calls the user's `handle`
//! function, and deserializes the JSON the script hands back — the
//! "small narrow API struct" the specification calls for, expressed as
//! a value instead of a binding object since `boa_engine`'s `Context`
//! is `!Send` and cannot be captured into the trait object's `&self`
//! across an `.await`.
//!
//! The interpreter runs on a dedicated OS thread owned by this runner
//! (spec's "MAY maintain internal state... provided they synchronize
//! it"); `process` hands work to it over a channel and awaits the
//! reply, enforcing the per-script timeout on the awaiting side.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use boa_engine::{Context, Source};
use events_bridge_core::contract::Runner;
use events_bridge_core::{Error, Message, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::error;

fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptRunnerConfig {
    /// ES5-style JavaScript source defining a top-level `function
    /// handle(data, metadata) { ... return { data, metadata }; }`.
    pub source: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl ScriptRunnerConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid script runner options: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct ScriptOutput {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

struct Job {
    data: String,
    metadata: HashMap<String, String>,
    reply: oneshot::Sender<Result<ScriptOutput>>,
}

pub struct ScriptRunner {
    jobs: std_mpsc::Sender<Job>,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(config: ScriptRunnerConfig) -> Result<Self> {
        let (tx, rx) = std_mpsc::channel::<Job>();
        let source = config.source.clone();
        std::thread::Builder::new()
            .name("events-bridge-script".to_string())
            .spawn(move || interpreter_thread(source, rx))
            .map_err(|e| Error::config(format!("failed to spawn script interpreter thread: {e}")))?;
        Ok(Self {
            jobs: tx,
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }
}

fn interpreter_thread(source: String, rx: std_mpsc::Receiver<Job>) {
    let mut context = Context::default();
    while let Ok(job) = rx.recv() {
        let result = run_once(&mut context, &source, &job.data, &job.metadata);
        let _ = job.reply.send(result);
    }
}

fn run_once(
    context: &mut Context,
    user_source: &str,
    data: &str,
    metadata: &HashMap<String, String>,
) -> Result<ScriptOutput> {
    let data_json = serde_json::to_string(data)
        .map_err(|e| Error::config(format!("failed to encode script input data: {e}")))?;
    let metadata_json = serde_json::to_string(metadata)
        .map_err(|e| Error::config(format!("failed to encode script input metadata: {e}")))?;

    let wrapped = format!(
        "(function() {{\n\
         var data = {data_json};\n\
         var metadata = {metadata_json};\n\
         {user_source}\n\
         var __out = (typeof handle === \"function\") ? handle(data, metadata) : {{ data: data, metadata: metadata }};\n\
         return JSON.stringify(__out);\n\
         }})();",
    );

    let value = context
        .eval(Source::from_bytes(&wrapped))
        .map_err(|e| Error::Fatal(format!("script evaluation failed: {e}")))?;
    let result_json = value
        .to_string(context)
        .map_err(|e| Error::Fatal(format!("script result was not a string: {e}")))?
        .to_std_string_escaped();

    serde_json::from_str(&result_json)
        .map_err(|e| Error::Fatal(format!("script returned malformed output: {e}")))
}

#[async_trait]
impl Runner for ScriptRunner {
    async fn process(&self, msg: &mut Message) -> Result<()> {
        let data = String::from_utf8_lossy(&msg.data()).to_string();
        let metadata = msg.metadata();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.jobs
            .send(Job {
                data,
                metadata,
                reply: reply_tx,
            })
            .map_err(|_| Error::Fatal("script interpreter thread is gone".to_string()))?;

        let output = tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| Error::TimeoutError(self.timeout))?
            .map_err(|_| Error::Fatal("script interpreter dropped the reply channel".to_string()))??;

        if let Some(data) = output.data {
            msg.set_data(data.into_bytes());
        }
        msg.merge_metadata(output.metadata);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_runner("script", |options| {
        let config = ScriptRunnerConfig::from_options(options)?;
        Ok(Arc::new(ScriptRunner::new(config)?) as Arc<dyn Runner>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_timeout() {
        let config = ScriptRunnerConfig::from_options(&serde_json::json!({
            "source": "function handle(data, metadata) { return { data: data, metadata: metadata }; }"
        }))
        .unwrap();
        assert_eq!(config.timeout_ms, 2000);
    }

    #[tokio::test]
    async fn handle_function_can_rewrite_data_and_metadata() {
        let runner = ScriptRunner::new(ScriptRunnerConfig {
            source: "function handle(data, metadata) { metadata.seen = \"script\"; return { data: data.toUpperCase(), metadata: metadata }; }".to_string(),
            timeout_ms: 2000,
        })
        .unwrap();

        struct FixtureSourceMessage {
            data: Vec<u8>,
        }
        impl events_bridge_core::contract::SourceMessage for FixtureSourceMessage {
            fn id(&self) -> &[u8] {
                b""
            }
            fn metadata(&self) -> Result<HashMap<String, String>> {
                Ok(HashMap::new())
            }
            fn data(&self) -> Result<Vec<u8>> {
                Ok(self.data.clone())
            }
            fn ack(&self, _reply: Option<events_bridge_core::message::ReplyData>) -> Result<()> {
                Ok(())
            }
            fn nak(&self) -> Result<()> {
                Ok(())
            }
        }

        let mut msg = Message::new(Box::new(FixtureSourceMessage {
            data: b"hello".to_vec(),
        }))
        .unwrap();
        runner.process(&mut msg).await.unwrap();
        assert_eq!(msg.data(), b"HELLO");
        assert_eq!(msg.metadata().get("seen").unwrap(), "script");
    }
}
