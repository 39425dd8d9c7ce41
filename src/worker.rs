//! Worker loop: token, identity, bind, session, record, repeat.

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::HardwareAddr;
use crate::limiter::{Admission, RateLimiter};
use crate::metrics::{MetricsSink, Outcome};
use crate::session::{Session, SessionParams};
use crate::transport::Transport;

/// Per-worker tallies, returned when the worker exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub attempts: u64,
    pub succeeded: u64,
    pub timeouts: u64,
    pub protocol_mismatches: u64,
    pub transport_errors: u64,
    pub random_source_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: Outcome) {
        self.attempts += 1;
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Timeout => self.timeouts += 1,
            Outcome::ProtocolMismatch => self.protocol_mismatches += 1,
            Outcome::TransportError => self.transport_errors += 1,
            Outcome::RandomSourceError => self.random_source_errors += 1,
        }
    }

    /// Fold another worker's tallies into this one.
    pub fn merge(&mut self, other: &WorkerStats) {
        self.attempts += other.attempts;
        self.succeeded += other.succeeded;
        self.timeouts += other.timeouts;
        self.protocol_mismatches += other.protocol_mismatches;
        self.transport_errors += other.transport_errors;
        self.random_source_errors += other.random_source_errors;
    }
}

pub struct Worker<T: Transport, R = OsRng> {
    id: usize,
    transport: T,
    /// Entropy for per-transaction hardware addresses.
    rng: R,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsSink>,
    params: Arc<SessionParams>,
    /// Warn every N consecutive transport failures.  Zero disables.
    warn_threshold: u32,
}

impl<T: Transport> Worker<T, OsRng> {
    pub fn new(
        id: usize,
        transport: T,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsSink>,
        params: Arc<SessionParams>,
        warn_threshold: u32,
    ) -> Self {
        Self {
            id,
            transport,
            rng: OsRng,
            limiter,
            metrics,
            params,
            warn_threshold,
        }
    }
}

impl<T: Transport, R: RngCore + Send> Worker<T, R> {
    /// Draw hardware addresses from `rng` instead of the OS.
    pub fn with_rng<S: RngCore + Send>(self, rng: S) -> Worker<T, S> {
        Worker {
            id: self.id,
            transport: self.transport,
            rng,
            limiter: self.limiter,
            metrics: self.metrics,
            params: self.params,
            warn_threshold: self.warn_threshold,
        }
    }

    /// Run transactions back to back until `cancel` fires.  A transaction
    /// already in flight is allowed to finish.
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        let mut consecutive_transport_errors: u32 = 0;

        debug!(worker = self.id, "worker started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.limiter.acquire(&cancel).await == Admission::Cancelled {
                break;
            }

            let outcome = match HardwareAddr::generate_from(&mut self.rng) {
                Ok(hw) => self.transact(hw).await,
                Err(e) => {
                    warn!(worker = self.id, error = %e, "could not generate hardware address");
                    Outcome::RandomSourceError
                }
            };

            self.metrics.record_outcome(outcome);
            stats.record(outcome);

            if outcome == Outcome::TransportError {
                consecutive_transport_errors += 1;
                if self.warn_threshold > 0 && consecutive_transport_errors % self.warn_threshold == 0 {
                    warn!(
                        worker = self.id,
                        consecutive = consecutive_transport_errors,
                        "transport keeps failing"
                    );
                }
            } else {
                consecutive_transport_errors = 0;
            }
        }

        info!(
            worker = self.id,
            attempts = stats.attempts,
            succeeded = stats.succeeded,
            "worker stopped"
        );
        stats
    }

    async fn transact(&mut self, hw: HardwareAddr) -> Outcome {
        if let Err(e) = self.transport.bind(hw) {
            debug!(worker = self.id, mac = %hw, error = %e, "bind failed");
            return Outcome::TransportError;
        }

        let report = Session::new(&mut self.transport, &self.metrics, &self.params, hw)
            .run()
            .await;
        report.outcome()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Counter;
    use crate::sim::{SimBehavior, SimConfig, SimTransport, SimulatedServer};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::time::Instant;

    fn params() -> Arc<SessionParams> {
        Arc::new(SessionParams {
            deadline: Duration::from_millis(200),
            server: "255.255.255.255:67".parse().unwrap(),
            send_release: true,
        })
    }

    fn worker<T: Transport>(transport: T, rate: f64, metrics: Arc<MetricsSink>) -> Worker<T> {
        let limiter = Arc::new(RateLimiter::new(rate, 1).unwrap());
        Worker::new(0, transport, limiter, metrics, params(), 3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_runs_until_cancelled() {
        let server = SimulatedServer::new(SimConfig::default());
        let metrics = Arc::new(MetricsSink::new().unwrap());
        let w = worker(SimTransport::new(server.clone()), 10.0, metrics.clone());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(w.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(450)).await;
        cancel.cancel();
        let stats = task.await.unwrap();

        // Tokens at 0, 100, 200, 300 and 400 ms.
        assert_eq!(stats.attempts, 5);
        assert_eq!(stats.succeeded, 5);
        assert_eq!(server.discovers_seen(), 5);
        assert_eq!(metrics.outcome_count(Outcome::Succeeded), 5);
        assert_eq!(metrics.counter_value(Counter::ReleaseSent), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_worker_does_nothing() {
        let server = SimulatedServer::new(SimConfig::default());
        let metrics = Arc::new(MetricsSink::new().unwrap());
        let w = worker(SimTransport::new(server.clone()), 10.0, metrics);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = w.run(cancel).await;

        assert_eq!(stats, WorkerStats::default());
        assert_eq!(server.discovers_seen(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_session_finishes_after_cancel() {
        let server = SimulatedServer::new(SimConfig {
            behavior: SimBehavior::Silent,
            ..SimConfig::default()
        });
        let metrics = Arc::new(MetricsSink::new().unwrap());
        let w = worker(SimTransport::new(server), 1.0, metrics.clone());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(w.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();
        let stats = task.await.unwrap();

        // The first session runs to its 200 ms deadline, then the loop exits.
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.timeouts, 1);
        assert!(cancelled_at.elapsed() <= Duration::from_millis(200));
        assert_eq!(metrics.outcome_count(Outcome::Timeout), 1);
    }

    /// Transport whose sends always fail.
    struct BrokenTransport;

    #[async_trait]
    impl Transport for BrokenTransport {
        fn bind(&mut self, _hw: HardwareAddr) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&mut self, _payload: &[u8], _target: SocketAddr) -> Result<(), TransportError> {
            Err(TransportError::Other("network unreachable".into()))
        }

        async fn receive(&mut self, _deadline: Instant) -> Result<Option<Bytes>, TransportError> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failures_do_not_stop_worker() {
        let metrics = Arc::new(MetricsSink::new().unwrap());
        let w = worker(BrokenTransport, 100.0, metrics.clone());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(w.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(95)).await;
        cancel.cancel();
        let stats = task.await.unwrap();

        assert_eq!(stats.attempts, 10);
        assert_eq!(stats.transport_errors, 10);
        assert_eq!(metrics.outcome_count(Outcome::TransportError), 10);
        assert_eq!(metrics.counter_value(Counter::DiscoverSent), 0);
    }

    /// Fails the first draw, then hands out predictable bytes.
    struct FailOnceRng {
        failed: bool,
        inner: rand::rngs::mock::StepRng,
    }

    impl RngCore for FailOnceRng {
        fn next_u32(&mut self) -> u32 {
            self.inner.next_u32()
        }

        fn next_u64(&mut self) -> u64 {
            self.inner.next_u64()
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            self.inner.fill_bytes(dest)
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            if !self.failed {
                self.failed = true;
                return Err(rand::Error::new("entropy pool exhausted"));
            }
            self.inner.try_fill_bytes(dest)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entropy_failure_skips_one_attempt() {
        let server = SimulatedServer::new(SimConfig::default());
        let metrics = Arc::new(MetricsSink::new().unwrap());
        let w = worker(SimTransport::new(server.clone()), 10.0, metrics.clone()).with_rng(FailOnceRng {
            failed: false,
            inner: rand::rngs::mock::StepRng::new(0x0102_0304_0506, 1),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(w.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        let stats = task.await.unwrap();

        // Token at 0 ms is spent on the failed draw, the one at 100 ms succeeds.
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.random_source_errors, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(metrics.outcome_count(Outcome::RandomSourceError), 1);
        assert_eq!(metrics.outcome_count(Outcome::Succeeded), 1);
        assert_eq!(server.discovers_seen(), 1);
    }

    #[test]
    fn test_stats_merge() {
        let mut a = WorkerStats::default();
        a.record(Outcome::Succeeded);
        a.record(Outcome::Timeout);
        let mut b = WorkerStats::default();
        b.record(Outcome::Succeeded);
        b.record(Outcome::RandomSourceError);

        a.merge(&b);
        assert_eq!(a.attempts, 4);
        assert_eq!(a.succeeded, 2);
        assert_eq!(a.timeouts, 1);
        assert_eq!(a.random_source_errors, 1);
    }
}
