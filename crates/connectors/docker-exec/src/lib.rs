//! Docker exec connector: a [`Runner`] that pipes a message's data into
//! a command executed inside a running container and replaces the data
//! with the command's stdout. Useful for delegating a transform step to
//! tooling that only exists inside a container image (spec §4.6's
//! filesystem abstraction exists for the same reason: structured
//! payloads that a container-side tool expects as files rather than a
//! single byte string).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use events_bridge_core::contract::Runner;
use events_bridge_core::{Error, Message, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerExecConfig {
    pub container: String,
    pub cmd: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl DockerExecConfig {
    pub fn from_options(options: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("invalid docker-exec options: {e}")))
    }
}

pub struct DockerExecRunner {
    config: DockerExecConfig,
    docker: Docker,
}

impl DockerExecRunner {
    pub fn new(config: DockerExecConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::config(format!("failed to connect to docker daemon: {e}")))?;
        Ok(Self { config, docker })
    }
}

#[async_trait]
impl Runner for DockerExecRunner {
    async fn process(&self, msg: &mut Message) -> Result<()> {
        let exec = self
            .docker
            .create_exec(
                &self.config.container,
                CreateExecOptions {
                    cmd: Some(self.config.cmd.clone()),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::transport(format!("docker exec create failed: {e}")))?;

        let start = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::transport(format!("docker exec start failed: {e}")))?;

        let StartExecResults::Attached { mut output, mut input } = start else {
            return Err(Error::transport("docker exec returned a detached session"));
        };

        input.write_all(&msg.data()).await?;
        drop(input);

        let mut stdout = Vec::new();
        let read_loop = async {
            while let Some(frame) = output.next().await {
                match frame {
                    Ok(bollard::container::LogOutput::StdOut { message }) => {
                        stdout.extend_from_slice(&message);
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        warn!(stderr = %String::from_utf8_lossy(&message), "docker exec stderr");
                    }
                    Ok(_) => {}
                    Err(e) => return Err(Error::transport(format!("docker exec stream error: {e}"))),
                }
            }
            Ok(())
        };
        tokio::time::timeout(Duration::from_millis(self.config.timeout_ms), read_loop)
            .await
            .map_err(|_| Error::TimeoutError(Duration::from_millis(self.config.timeout_ms)))??;

        msg.set_data(stdout);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Register this connector's factories with a shared registry.
pub fn register(registry: &mut events_bridge_core::ConnectorRegistry) {
    registry.register_runner("docker-exec", |options| {
        let config = DockerExecConfig::from_options(options)?;
        Ok(Arc::new(DockerExecRunner::new(config)?) as Arc<dyn Runner>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_cmd() {
        let err = DockerExecConfig::from_options(&serde_json::json!({ "container": "c1" }))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn config_defaults_timeout() {
        let config = DockerExecConfig::from_options(&serde_json::json!({
            "container": "c1",
            "cmd": ["/bin/sh", "-c", "cat"]
        }))
        .unwrap();
        assert_eq!(config.timeout_ms, 10_000);
    }
}
