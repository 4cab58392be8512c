//! Startup configuration loading and secret resolution (spec §6).
//!
//! Grounded in `runtime-core/src/transport/mod.rs`'s
//! `ClientConfig::from_manifest_params`: pull typed fields out of a
//! generic JSON/YAML blob, return `ConfigError` on anything missing or
//! malformed.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// One configured pipeline: a source, an ordered runner chain, and a
/// target, each an opaque `(kind, options)` pair the registry resolves
/// at startup (spec §3.3).
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfigSpec {
    pub source: ConnectorSpec,
    #[serde(default)]
    pub runners: Vec<ConnectorSpec>,
    pub target: ConnectorSpec,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub runner_timeout_ms: Option<u64>,
    #[serde(default)]
    pub target_timeout_ms: Option<u64>,
}

fn default_buffer_size() -> usize {
    64
}

fn default_worker_count() -> usize {
    1
}

/// One connector's `kind` + opaque `options` (spec §3.3).
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorSpec {
    pub kind: String,
    #[serde(default = "serde_json::Value::default")]
    pub options: serde_json::Value,
}

/// Top-level daemon config: one or more named pipelines.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub pipelines: std::collections::HashMap<String, PipelineConfigSpec>,
}

impl DaemonConfig {
    /// Load from a YAML file at startup. Never called again after that
    /// (spec §6, "The core keeps no persisted state").
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("failed to parse config: {e}")))
    }
}

/// Resolve a possibly-indirected secret value (spec §6):
/// - a value with no recognized prefix is returned verbatim, trimmed;
/// - `env:NAME` returns the named environment variable (empty if unset);
/// - `file:/abs/path` reads the file and trims surrounding whitespace;
///   a non-absolute path is a `ConfigError`.
pub fn resolve_secret(value: &str) -> Result<String> {
    if let Some(name) = value.strip_prefix("env:") {
        return Ok(std::env::var(name).unwrap_or_default());
    }
    if let Some(path) = value.strip_prefix("file:") {
        if !path.starts_with('/') {
            return Err(Error::config(format!(
                "file: secret path must be absolute, got '{path}'"
            )));
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read secret file {path}: {e}")))?;
        return Ok(contents.trim().to_string());
    }
    Ok(value.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbatim_value_is_trimmed() {
        assert_eq!(resolve_secret("  hello  ").unwrap(), "hello");
    }

    #[test]
    fn env_prefix_reads_environment() {
        std::env::set_var("EB_TEST_SECRET", "s3cr3t");
        assert_eq!(resolve_secret("env:EB_TEST_SECRET").unwrap(), "s3cr3t");
        std::env::remove_var("EB_TEST_SECRET");
    }

    #[test]
    fn env_prefix_missing_var_is_empty_not_error() {
        std::env::remove_var("EB_TEST_MISSING");
        assert_eq!(resolve_secret("env:EB_TEST_MISSING").unwrap(), "");
    }

    #[test]
    fn file_prefix_requires_absolute_path() {
        let err = resolve_secret("file:relative/path").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn file_prefix_reads_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.txt");
        fs::write(&path, "  topsecret\n").unwrap();
        let value = resolve_secret(&format!("file:{}", path.display())).unwrap();
        assert_eq!(value, "topsecret");
    }

    #[test]
    fn parses_minimal_daemon_config() {
        let yaml = r#"
pipelines:
  echo:
    source:
      kind: nats
      options:
        subject: ab.*
    target:
      kind: nats
      options:
        subject: ab.cd
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, yaml).unwrap();
        let config = DaemonConfig::load(&path).unwrap();
        let pipeline = &config.pipelines["echo"];
        assert_eq!(pipeline.source.kind, "nats");
        assert_eq!(pipeline.buffer_size, 64);
        assert_eq!(pipeline.worker_count, 1);
    }
}
