//! forwarderd: forwards Pulsar messages to an MQTT broker.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use forwarder_api::{ApiState, HealthServer};
use forwarder_core::shutdown::listen_for_signals;
use forwarder_core::{
    ExitReason, ForwardSettings, ForwardStats, ForwarderConfig, HealthState, Pipeline, Resources,
    Shutdown,
};
use forwarder_transport::{MqttSink, PulsarSource};

type DaemonResources = Resources<PulsarSource, MqttSink, HealthServer>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start runtime");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run());
    std::process::exit(code);
}

async fn run() -> i32 {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "forwarderd starting");

    let config = ForwarderConfig::load();
    let shutdown = match &config {
        Ok(config) => {
            Shutdown::with_step_timeout(Duration::from_secs(config.shutdown.step_timeout_secs))
        }
        Err(_) => Shutdown::new(),
    };
    shutdown.install_panic_hook();
    match listen_for_signals(shutdown.clone()) {
        Ok(signals) => {
            tokio::spawn(signals);
        }
        Err(e) => {
            shutdown.trigger(ExitReason::fatal(format!(
                "failed to install signal handlers: {e}"
            )));
        }
    }

    let health = HealthState::new();
    let stats = ForwardStats::new();
    let mut resources = DaemonResources::default();

    match config {
        Err(e) => {
            shutdown.trigger(ExitReason::fatal(format!("invalid configuration: {e}")));
        }
        Ok(config) => {
            // A signal during bring-up abandons whatever is still connecting.
            let started = tokio::select! {
                biased;
                _ = shutdown.triggered() => None,
                started = start(&config, &shutdown, &health, &stats, &mut resources) => Some(started),
            };
            match started {
                Some(Ok(())) => forward(&config, &shutdown, &stats, &mut resources).await,
                Some(Err(e)) => {
                    shutdown.trigger(ExitReason::fatal(format!("{e:#}")));
                }
                None => {}
            }
        }
    }

    shutdown.drain(&health, &mut resources).await.unwrap_or(1)
}

/// Bring up the health check, the sink and the source, in that order. Each
/// resource is registered for teardown as soon as it exists.
async fn start(
    config: &ForwarderConfig,
    shutdown: &Shutdown,
    health: &HealthState,
    stats: &ForwardStats,
    resources: &mut DaemonResources,
) -> Result<()> {
    let state = ApiState {
        health: health.clone(),
        stats: stats.clone(),
    };
    let endpoint = HealthServer::bind(
        &config.health_check.host,
        config.health_check.port,
        state,
        shutdown.clone(),
    )
    .await
    .context("failed to start health check server")?;
    resources.endpoint = Some(endpoint);

    let sink = MqttSink::connect(&config.mqtt, shutdown.clone())
        .await
        .context("failed to connect to mqtt")?;
    resources.sink = Some(sink);

    let source = PulsarSource::connect(&config.pulsar)
        .await
        .context("failed to subscribe to pulsar")?;
    resources.source = Some(source);

    health.set_ready(true);
    tracing::info!("forwarder ready");
    Ok(())
}

async fn forward(
    config: &ForwarderConfig,
    shutdown: &Shutdown,
    stats: &ForwardStats,
    resources: &mut DaemonResources,
) {
    let (source, sink) = match (resources.source.take(), resources.sink.take()) {
        (Some(source), Some(sink)) => (source, sink),
        (source, sink) => {
            resources.source = source;
            resources.sink = sink;
            shutdown.trigger(ExitReason::fatal("forwarding started without transports"));
            return;
        }
    };
    let pipeline = Pipeline::new(
        ForwardSettings::from_config(config),
        stats.clone(),
        shutdown.clone(),
    );
    if let Some((source, sink)) = pipeline.spawn(source, sink).await {
        resources.source = Some(source);
        resources.sink = Some(sink);
    }
}
