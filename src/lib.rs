//! dhcpload -- synthetic DHCPv4 load generator.
//!
//! A fixed pool of workers repeatedly runs the DISCOVER/OFFER/REQUEST/ACK/
//! RELEASE exchange against a broadcast-reachable server, each transaction
//! under a fresh random hardware address.  One shared token bucket bounds
//! the aggregate start rate.  Packet counts, per-phase latency histograms
//! and per-outcome totals are exported for Prometheus.

pub mod codec;
pub mod config;
pub mod engine;
pub mod exporter;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod session;
pub mod sim;
pub mod transport;
pub mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::LoadConfig;
use crate::engine::{Engine, EngineReport};
use crate::limiter::RateLimiter;
use crate::metrics::{MetricsSink, MetricsSnapshot};
use crate::session::SessionParams;
use crate::sim::{SimConfig, SimTransportFactory, SimulatedServer};
use crate::transport::{TransportFactory, UdpTransportFactory};

/// What a finished run hands back to the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub report: EngineReport,
    pub metrics: MetricsSnapshot,
}

/// Generate load against the real network until `cancel` fires.
pub async fn run(config: LoadConfig, cancel: CancellationToken) -> Result<RunSummary> {
    let factory = UdpTransportFactory::new(config.transport.clone());
    run_with(config, factory, cancel).await
}

/// Same as [`run`], but every worker talks to an in-process simulated server.
pub async fn run_simulated(config: LoadConfig, sim: SimConfig, cancel: CancellationToken) -> Result<RunSummary> {
    let server = SimulatedServer::new(sim);
    run_with(config, SimTransportFactory::new(server), cancel).await
}

/// Wire up limiter, metrics, exporter and engine around `factory`.
pub async fn run_with<F: TransportFactory>(
    config: LoadConfig,
    factory: F,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    config.validate().context("invalid configuration")?;

    let limiter = Arc::new(
        RateLimiter::new(config.rate.per_second, config.rate.burst).context("invalid rate limit")?,
    );
    let metrics = Arc::new(MetricsSink::new().context("failed to register metrics")?);

    let exporter_cancel = cancel.child_token();
    let exporter = if config.metrics.enabled {
        let listener = tokio::net::TcpListener::bind(config.metrics.listen_address)
            .await
            .with_context(|| format!("failed to bind metrics listener on {}", config.metrics.listen_address))?;
        Some(tokio::spawn(exporter::serve(
            listener,
            metrics.clone(),
            exporter_cancel.clone(),
        )))
    } else {
        None
    };

    let params = SessionParams {
        deadline: config.session.deadline(),
        server: config.transport.server_address,
        send_release: config.session.send_release,
    };
    let engine = Engine::new(&config.engine, limiter, metrics.clone(), params)
        .with_transport_warn_threshold(config.transport.transport_error_warn_threshold);

    let report = engine.run(factory, cancel).await;

    exporter_cancel.cancel();
    if let Some(handle) = exporter {
        handle.await.context("metrics exporter task panicked")??;
    }

    Ok(RunSummary {
        report,
        metrics: metrics.snapshot(),
    })
}
