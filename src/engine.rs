//! Worker pool.
//!
//! The [`Engine`] spawns one task per worker into a `JoinSet`.  Every worker
//! shares the same rate limiter, metrics sink and cancellation token, and
//! opens its own transport through a [`TransportFactory`].  The engine never
//! aborts a task: it returns once every worker has observed cancellation and
//! finished its in-flight transaction.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::limiter::RateLimiter;
use crate::metrics::MetricsSink;
use crate::session::SessionParams;
use crate::transport::TransportFactory;
use crate::worker::{Worker, WorkerStats};

/// Warn after this many consecutive transport failures unless overridden.
const DEFAULT_WARN_THRESHOLD: u32 = 5;

// ---------------------------------------------------------------------------
// EngineReport
// ---------------------------------------------------------------------------

/// Summary of one engine run.
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Workers that opened a transport and ran.
    pub workers_started: usize,
    /// Workers that ended early (transport creation failed or the task
    /// panicked).
    pub workers_failed: usize,
    pub totals: WorkerStats,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    workers: usize,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsSink>,
    params: Arc<SessionParams>,
    warn_threshold: u32,
}

enum WorkerExit {
    Finished(WorkerStats),
    TransportFailed,
}

impl Engine {
    pub fn new(
        config: &EngineConfig,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsSink>,
        params: SessionParams,
    ) -> Self {
        Self {
            workers: config.workers,
            limiter,
            metrics,
            params: Arc::new(params),
            warn_threshold: DEFAULT_WARN_THRESHOLD,
        }
    }

    /// Warn every `n` consecutive transport failures in a worker.
    pub fn with_transport_warn_threshold(mut self, n: u32) -> Self {
        self.warn_threshold = n;
        self
    }

    /// Run every worker until `cancel` fires, then join them all.
    pub async fn run<F: TransportFactory>(&self, factory: F, cancel: CancellationToken) -> EngineReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let factory = Arc::new(factory);

        info!(
            %run_id,
            workers = self.workers,
            rate = self.limiter.rate(),
            burst = self.limiter.burst(),
            deadline_ms = self.params.deadline.as_millis() as u64,
            "starting load engine"
        );

        let mut tasks = JoinSet::new();
        for id in 0..self.workers {
            let factory = factory.clone();
            let limiter = self.limiter.clone();
            let metrics = self.metrics.clone();
            let params = self.params.clone();
            let cancel = cancel.clone();
            let warn_threshold = self.warn_threshold;

            let span = tracing::info_span!("worker", %run_id, worker = id);
            tasks.spawn(
                async move {
                    let transport = match factory.open(id).await {
                        Ok(t) => t,
                        Err(e) => {
                            error!(worker = id, error = %e, "failed to open transport, worker exiting");
                            return WorkerExit::TransportFailed;
                        }
                    };
                    let worker = Worker::new(id, transport, limiter, metrics, params, warn_threshold);
                    WorkerExit::Finished(worker.run(cancel).await)
                }
                .instrument(span),
            );
        }

        let mut totals = WorkerStats::default();
        let mut workers_started = 0;
        let mut workers_failed = 0;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(WorkerExit::Finished(stats)) => {
                    workers_started += 1;
                    totals.merge(&stats);
                }
                Ok(WorkerExit::TransportFailed) => workers_failed += 1,
                Err(e) => {
                    error!(error = %e, "worker task panicked");
                    workers_failed += 1;
                }
            }
        }

        let duration_secs = start.elapsed().as_secs_f64();
        info!(
            %run_id,
            attempts = totals.attempts,
            succeeded = totals.succeeded,
            workers_failed,
            duration_secs,
            "load engine stopped"
        );

        EngineReport {
            run_id,
            started_at,
            duration_secs,
            workers_started,
            workers_failed,
            totals,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
