//! Process-wide connector registry (spec §4.1).
//!
//! Grounded in `runtime-core/src/nodes/registry.rs`'s `NodeRegistry`: a
//! `HashMap<String, Arc<dyn Factory>>` built up once at startup. Unlike
//! `NodeRegistry` (which picks Rust-vs-Python per node), a connector kind
//! here may register any subset of `{source, runner, target}` factories,
//! per spec §4.1.

use std::collections::HashMap;
use std::sync::Arc;

use crate::contract::{Runner, Source, Target};
use crate::error::{Error, Result};

type SourceFactory = dyn Fn(&serde_json::Value) -> Result<Arc<dyn Source>> + Send + Sync;
type RunnerFactory = dyn Fn(&serde_json::Value) -> Result<Arc<dyn Runner>> + Send + Sync;
type TargetFactory = dyn Fn(&serde_json::Value) -> Result<Arc<dyn Target>> + Send + Sync;

/// One connector kind's registered factories. Any subset may be present.
#[derive(Default)]
struct ConnectorEntry {
    new_source: Option<Arc<SourceFactory>>,
    new_runner: Option<Arc<RunnerFactory>>,
    new_target: Option<Arc<TargetFactory>>,
}

/// Maps a lowercase connector `kind` to its factories.
///
/// Registration happens once at startup (`register_*`); after the first
/// pipeline starts, the registry is read-only and requires no lock to
/// read (spec §5 "Shared resource policy").
#[derive(Default)]
pub struct ConnectorRegistry {
    entries: HashMap<String, ConnectorEntry>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Source>> + Send + Sync + 'static,
    {
        self.entries
            .entry(kind.into().to_lowercase())
            .or_default()
            .new_source = Some(Arc::new(factory));
    }

    pub fn register_runner<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Runner>> + Send + Sync + 'static,
    {
        self.entries
            .entry(kind.into().to_lowercase())
            .or_default()
            .new_runner = Some(Arc::new(factory));
    }

    pub fn register_target<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Target>> + Send + Sync + 'static,
    {
        self.entries
            .entry(kind.into().to_lowercase())
            .or_default()
            .new_target = Some(Arc::new(factory));
    }

    pub fn new_source(&self, kind: &str, options: &serde_json::Value) -> Result<Arc<dyn Source>> {
        let entry = self.lookup(kind)?;
        let factory = entry
            .new_source
            .as_ref()
            .ok_or_else(|| Error::config(format!("connector '{kind}' has no source factory")))?;
        factory(options)
    }

    pub fn new_runner(&self, kind: &str, options: &serde_json::Value) -> Result<Arc<dyn Runner>> {
        let entry = self.lookup(kind)?;
        let factory = entry
            .new_runner
            .as_ref()
            .ok_or_else(|| Error::config(format!("connector '{kind}' has no runner factory")))?;
        factory(options)
    }

    pub fn new_target(&self, kind: &str, options: &serde_json::Value) -> Result<Arc<dyn Target>> {
        let entry = self.lookup(kind)?;
        let factory = entry
            .new_target
            .as_ref()
            .ok_or_else(|| Error::config(format!("connector '{kind}' has no target factory")))?;
        factory(options)
    }

    fn lookup(&self, kind: &str) -> Result<&ConnectorEntry> {
        self.entries
            .get(&kind.to_lowercase())
            .ok_or_else(|| Error::config(format!("unknown connector kind '{kind}'")))
    }

    pub fn registered_kinds(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use tokio::sync::mpsc;

    struct DummySource;
    #[async_trait]
    impl Source for DummySource {
        async fn produce(&self, buffer: usize) -> Result<mpsc::Receiver<Message>> {
            let (_tx, rx) = mpsc::channel(buffer);
            Ok(rx)
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_kind_is_config_error() {
        let registry = ConnectorRegistry::new();
        let err = registry
            .new_source("nats", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn missing_factory_subset_is_config_error() {
        let mut registry = ConnectorRegistry::new();
        registry.register_source("nats", |_opts| Ok(Arc::new(DummySource) as Arc<dyn Source>));
        assert!(registry.new_source("nats", &serde_json::json!({})).is_ok());
        let err = registry
            .new_target("nats", &serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn kind_lookup_is_case_insensitive() {
        let mut registry = ConnectorRegistry::new();
        registry.register_source("NATS", |_opts| Ok(Arc::new(DummySource) as Arc<dyn Source>));
        assert!(registry.new_source("nats", &serde_json::json!({})).is_ok());
        let _ = Map::<String, String>::new();
    }
}
