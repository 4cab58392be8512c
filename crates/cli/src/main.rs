//! Events Bridge daemon entry point.
//!
//! Starts every pipeline declared in a YAML config file and keeps them
//! running until a shutdown signal arrives.
//!
//! # Usage
//!
//! ```bash
//! events-bridge --config events-bridge.yaml
//!
//! # With logging
//! RUST_LOG=debug events-bridge --config events-bridge.yaml
//! ```
//!
//! # Environment Variables
//!
//! - `EVENTS_BRIDGE_CONFIG`: path to the YAML config file (default: `events-bridge.yaml`)
//! - `RUST_LOG`: logging level (default: `info`)

use std::sync::Arc;
use std::time::Duration;

use events_bridge_core::config::{ConnectorSpec, DaemonConfig, PipelineConfigSpec};
use events_bridge_core::{ConnectorRegistry, Pipeline, PipelineConfig, PipelineHandle};
use tracing::{error, info, warn};

fn config_path() -> String {
    std::env::args()
        .collect::<Vec<_>>()
        .windows(2)
        .find(|pair| pair[0] == "--config")
        .map(|pair| pair[1].clone())
        .or_else(|| std::env::var("EVENTS_BRIDGE_CONFIG").ok())
        .unwrap_or_else(|| "events-bridge.yaml".to_string())
}

fn build_registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    events_bridge_nats::register(&mut registry);
    events_bridge_coap::register(&mut registry);
    events_bridge_mqtt::register(&mut registry);
    events_bridge_kafka::register(&mut registry);
    events_bridge_redis::register(&mut registry);
    events_bridge_pubsub::register(&mut registry);
    events_bridge_grpc::register(&mut registry);
    events_bridge_http::register(&mut registry);
    events_bridge_postgres_cdc::register(&mut registry);
    events_bridge_fastcgi::register(&mut registry);
    events_bridge_docker_exec::register(&mut registry);
    events_bridge_script::register(&mut registry);
    registry
}

async fn start_pipeline(
    name: &str,
    spec: &PipelineConfigSpec,
    registry: &ConnectorRegistry,
) -> anyhow::Result<PipelineHandle> {
    let source = build_source(&spec.source, registry)?;
    let target = build_target(&spec.target, registry)?;
    let mut runners = Vec::with_capacity(spec.runners.len());
    for runner_spec in &spec.runners {
        runners.push(build_runner(runner_spec, registry)?);
    }

    let config = PipelineConfig {
        buffer_size: spec.buffer_size,
        worker_count: spec.worker_count,
        runner_timeout: spec
            .runner_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(PipelineConfig::default().runner_timeout),
        target_timeout: spec
            .target_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(PipelineConfig::default().target_timeout),
    };

    info!(pipeline = name, source = %spec.source.kind, target = %spec.target.kind, "starting pipeline");
    let handle = Pipeline::new(source, runners, target, config).start().await?;
    Ok(handle)
}

fn build_source(
    spec: &ConnectorSpec,
    registry: &ConnectorRegistry,
) -> anyhow::Result<Arc<dyn events_bridge_core::contract::Source>> {
    registry
        .new_source(&spec.kind, &spec.options)
        .map_err(|e| anyhow::anyhow!("failed to build source '{}': {e}", spec.kind))
}

fn build_runner(
    spec: &ConnectorSpec,
    registry: &ConnectorRegistry,
) -> anyhow::Result<Arc<dyn events_bridge_core::contract::Runner>> {
    registry
        .new_runner(&spec.kind, &spec.options)
        .map_err(|e| anyhow::anyhow!("failed to build runner '{}': {e}", spec.kind))
}

fn build_target(
    spec: &ConnectorSpec,
    registry: &ConnectorRegistry,
) -> anyhow::Result<Arc<dyn events_bridge_core::contract::Target>> {
    registry
        .new_target(&spec.kind, &spec.options)
        .map_err(|e| anyhow::anyhow!("failed to build target '{}': {e}", spec.kind))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler, falling back to ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("events-bridge")
        .build()?;

    runtime.block_on(async move {
        let path = config_path();
        info!(config = %path, version = env!("CARGO_PKG_VERSION"), "events-bridge starting");

        let daemon_config = DaemonConfig::load(&path).map_err(|e| {
            error!(error = %e, "failed to load config");
            e
        })?;
        let registry = build_registry();

        let mut handles = Vec::with_capacity(daemon_config.pipelines.len());
        for (name, spec) in daemon_config.pipelines.iter() {
            match start_pipeline(name, spec, &registry).await {
                Ok(handle) => handles.push((name.clone(), handle)),
                Err(e) => {
                    error!(pipeline = name, error = %e, "failed to start pipeline, shutting down what's already running");
                    for (started_name, handle) in handles {
                        if let Err(e) = handle.shutdown().await {
                            error!(pipeline = started_name, error = %e, "error during emergency shutdown");
                        }
                    }
                    return Err(e);
                }
            }
        }

        info!(pipeline_count = handles.len(), "all pipelines started");
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining pipelines");

        for (name, handle) in handles {
            if let Err(e) = handle.shutdown().await {
                error!(pipeline = name, error = %e, "error during pipeline shutdown");
            }
        }
        info!("events-bridge stopped");
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}
