//! Process-wide counters and latency histograms.
//!
//! [`MetricsSink`] owns a private Prometheus registry and is shared by every
//! worker through an `Arc`.  All recording goes through Prometheus' atomic
//! collectors, so callers never lock.  Nothing is ever reset or removed.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::Serialize;

/// Histogram buckets in milliseconds.  Dense below 100 ms where a healthy
/// server answers, then out past the default 2 s transaction deadline.
const LATENCY_BUCKETS_MS: [f64; 14] = [
    1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 1500.0, 2000.0, 3000.0, 5000.0,
];

// ---------------------------------------------------------------------------
// Metric keys
// ---------------------------------------------------------------------------

/// Monotonic packet/event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    DiscoverSent,
    RequestSent,
    ReleaseSent,
    ReleaseFailed,
}

/// Which request/response pair a latency sample measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    DiscoverOffer,
    RequestAck,
}

/// Final result of one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Timeout,
    ProtocolMismatch,
    TransportError,
    RandomSourceError,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::Succeeded,
        Outcome::Timeout,
        Outcome::ProtocolMismatch,
        Outcome::TransportError,
        Outcome::RandomSourceError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Timeout => "timeout",
            Outcome::ProtocolMismatch => "protocol_mismatch",
            Outcome::TransportError => "transport_error",
            Outcome::RandomSourceError => "random_source_error",
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsSink
// ---------------------------------------------------------------------------

pub struct MetricsSink {
    registry: Registry,
    discovers: IntCounter,
    requests: IntCounter,
    releases: IntCounter,
    release_failures: IntCounter,
    transactions: IntCounterVec,
    discover_offer_latency: Histogram,
    request_ack_latency: Histogram,
}

impl MetricsSink {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let discovers = IntCounter::new("discover_packets_sent", "Number of discover packets sent")?;
        let requests = IntCounter::new("request_packets_sent", "Number of request packets sent")?;
        let releases = IntCounter::new("release_packets_sent", "Number of release packets sent")?;
        let release_failures = IntCounter::new(
            "release_failures_total",
            "RELEASE messages that could not be sent after a successful ACK",
        )?;
        let transactions = IntCounterVec::new(
            Opts::new("transactions_total", "Completed transaction attempts by outcome"),
            &["outcome"],
        )?;
        let discover_offer_latency = Histogram::with_opts(
            HistogramOpts::new("discover_offer_latency", "DISCOVER-OFFER latency (ms).")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
        )?;
        let request_ack_latency = Histogram::with_opts(
            HistogramOpts::new("request_ack_latency", "REQUEST-ACK latency (ms).")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
        )?;

        registry.register(Box::new(discovers.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(releases.clone()))?;
        registry.register(Box::new(release_failures.clone()))?;
        registry.register(Box::new(transactions.clone()))?;
        registry.register(Box::new(discover_offer_latency.clone()))?;
        registry.register(Box::new(request_ack_latency.clone()))?;

        // Pre-create every outcome series so scrapes show explicit zeros.
        for outcome in Outcome::ALL {
            transactions.with_label_values(&[outcome.as_str()]);
        }

        Ok(Self {
            registry,
            discovers,
            requests,
            releases,
            release_failures,
            transactions,
            discover_offer_latency,
            request_ack_latency,
        })
    }

    fn counter(&self, counter: Counter) -> &IntCounter {
        match counter {
            Counter::DiscoverSent => &self.discovers,
            Counter::RequestSent => &self.requests,
            Counter::ReleaseSent => &self.releases,
            Counter::ReleaseFailed => &self.release_failures,
        }
    }

    fn histogram(&self, phase: Phase) -> &Histogram {
        match phase {
            Phase::DiscoverOffer => &self.discover_offer_latency,
            Phase::RequestAck => &self.request_ack_latency,
        }
    }

    pub fn increment_counter(&self, counter: Counter) {
        self.counter(counter).inc();
    }

    pub fn observe_latency(&self, phase: Phase, value_ms: f64) {
        self.histogram(phase).observe(value_ms);
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        self.transactions.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn counter_value(&self, counter: Counter) -> u64 {
        self.counter(counter).get()
    }

    pub fn latency_count(&self, phase: Phase) -> u64 {
        self.histogram(phase).get_sample_count()
    }

    pub fn latency_sum_ms(&self, phase: Phase) -> f64 {
        self.histogram(phase).get_sample_sum()
    }

    pub fn outcome_count(&self, outcome: Outcome) -> u64 {
        self.transactions.with_label_values(&[outcome.as_str()]).get()
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// Point-in-time copy of the headline numbers, for the run summary.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mean = |phase| {
            let count = self.latency_count(phase);
            (count > 0).then(|| self.latency_sum_ms(phase) / count as f64)
        };

        MetricsSnapshot {
            discovers_sent: self.counter_value(Counter::DiscoverSent),
            requests_sent: self.counter_value(Counter::RequestSent),
            releases_sent: self.counter_value(Counter::ReleaseSent),
            release_failures: self.counter_value(Counter::ReleaseFailed),
            succeeded: self.outcome_count(Outcome::Succeeded),
            timeouts: self.outcome_count(Outcome::Timeout),
            protocol_mismatches: self.outcome_count(Outcome::ProtocolMismatch),
            transport_errors: self.outcome_count(Outcome::TransportError),
            random_source_errors: self.outcome_count(Outcome::RandomSourceError),
            discover_offer_samples: self.latency_count(Phase::DiscoverOffer),
            discover_offer_mean_ms: mean(Phase::DiscoverOffer),
            request_ack_samples: self.latency_count(Phase::RequestAck),
            request_ack_mean_ms: mean(Phase::RequestAck),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub discovers_sent: u64,
    pub requests_sent: u64,
    pub releases_sent: u64,
    pub release_failures: u64,
    pub succeeded: u64,
    pub timeouts: u64,
    pub protocol_mismatches: u64,
    pub transport_errors: u64,
    pub random_source_errors: u64,
    pub discover_offer_samples: u64,
    pub discover_offer_mean_ms: Option<f64>,
    pub request_ack_samples: u64,
    pub request_ack_mean_ms: Option<f64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
