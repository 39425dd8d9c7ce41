//! One DISCOVER → OFFER → REQUEST → ACK → RELEASE transaction.
//!
//! A [`Session`] borrows its worker's transport for the duration of a single
//! transaction and drives it through the DORA exchange under one end-to-end
//! deadline.  The deadline starts when the DISCOVER is sent and is not reset
//! between steps.  Latency samples and packet counters are written straight
//! into the shared [`MetricsSink`]; the caller records the final outcome.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::codec::{random_xid, DhcpMessage, LeaseOffer, MessageType};
use crate::identity::HardwareAddr;
use crate::metrics::{Counter, MetricsSink, Outcome, Phase};
use crate::transport::{Transport, TransportError};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Why a transaction did not reach ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No matching reply before the deadline.
    Timeout,
    /// A reply for this transaction arrived with the wrong type, or an
    /// OFFER carried no usable lease.
    ProtocolMismatch,
    /// Send or receive failed at the socket level.
    TransportError,
}

impl FailureReason {
    pub fn outcome(self) -> Outcome {
        match self {
            FailureReason::Timeout => Outcome::Timeout,
            FailureReason::ProtocolMismatch => Outcome::ProtocolMismatch,
            FailureReason::TransportError => Outcome::TransportError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    DiscoverSent,
    OfferReceived,
    RequestSent,
    AckReceived,
    ReleaseSent,
    Failed(FailureReason),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => f.write_str("INIT"),
            SessionState::DiscoverSent => f.write_str("DISCOVER_SENT"),
            SessionState::OfferReceived => f.write_str("OFFER_RECEIVED"),
            SessionState::RequestSent => f.write_str("REQUEST_SENT"),
            SessionState::AckReceived => f.write_str("ACK_RECEIVED"),
            SessionState::ReleaseSent => f.write_str("RELEASE_SENT"),
            SessionState::Failed(reason) => write!(f, "FAILED({:?})", reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Message types in the order a successful transaction exchanges them.
const SEQUENCE: [MessageType; 5] = [
    MessageType::Discover,
    MessageType::Offer,
    MessageType::Request,
    MessageType::Ack,
    MessageType::Release,
];

/// Messages exchanged so far, in order.  Refuses anything that is not the
/// expected next step.
#[derive(Debug, Default)]
struct Conversation {
    messages: Vec<DhcpMessage>,
}

impl Conversation {
    fn push(&mut self, msg: DhcpMessage) -> Result<(), FailureReason> {
        let expected = SEQUENCE.get(self.messages.len()).copied();
        let actual = msg.message_type();
        if actual.is_none() || actual != expected {
            trace!(?expected, ?actual, "out-of-sequence message");
            return Err(FailureReason::ProtocolMismatch);
        }
        self.messages.push(msg);
        Ok(())
    }

    fn last(&self) -> Option<&DhcpMessage> {
        self.messages.last()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-run session parameters.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// End-to-end budget from DISCOVER sent to ACK received.
    pub deadline: Duration,
    /// Destination for every client message.
    pub server: SocketAddr,
    pub send_release: bool,
}

/// What happened during one transaction.
#[derive(Debug)]
pub struct SessionReport {
    pub hw: HardwareAddr,
    pub xid: u32,
    pub state: SessionState,
    pub discover_offer: Option<Duration>,
    pub request_ack: Option<Duration>,
    pub lease: Option<LeaseOffer>,
    /// Set when the RELEASE could not be sent after a successful ACK.
    pub release_error: Option<TransportError>,
    /// Set when the session failed on a socket error.
    pub transport_error: Option<TransportError>,
}

impl SessionReport {
    /// A session succeeds once the ACK is in, whether or not the RELEASE
    /// went out.
    pub fn outcome(&self) -> Outcome {
        match self.state {
            SessionState::Failed(reason) => reason.outcome(),
            _ => Outcome::Succeeded,
        }
    }
}

pub struct Session<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    metrics: &'a MetricsSink,
    params: &'a SessionParams,
    hw: HardwareAddr,
    xid: u32,
    state: SessionState,
    conversation: Conversation,
    discover_offer: Option<Duration>,
    request_ack: Option<Duration>,
    lease: Option<LeaseOffer>,
}

impl<'a, T: Transport + ?Sized> Session<'a, T> {
    /// Prepare a transaction for `hw`.  The transport must already be bound
    /// to `hw`.
    pub fn new(
        transport: &'a mut T,
        metrics: &'a MetricsSink,
        params: &'a SessionParams,
        hw: HardwareAddr,
    ) -> Self {
        Self {
            transport,
            metrics,
            params,
            hw,
            xid: random_xid(),
            state: SessionState::Init,
            conversation: Conversation::default(),
            discover_offer: None,
            request_ack: None,
            lease: None,
        }
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Run the exchange to completion or failure.
    pub async fn run(mut self) -> SessionReport {
        match self.exchange().await {
            Ok(()) => {}
            Err(Failure { reason, source }) => {
                debug!(
                    mac = %self.hw,
                    xid = self.xid,
                    at = %self.state,
                    ?reason,
                    error = ?source,
                    "transaction failed"
                );
                self.state = SessionState::Failed(reason);
                return self.into_report(None, source);
            }
        }

        let release_error = if self.params.send_release {
            self.release().await.err()
        } else {
            None
        };

        debug!(
            mac = %self.hw,
            xid = self.xid,
            state = %self.state,
            discover_offer_ms = self.discover_offer.map(|d| d.as_secs_f64() * 1000.0),
            request_ack_ms = self.request_ack.map(|d| d.as_secs_f64() * 1000.0),
            "transaction complete"
        );
        self.into_report(release_error, None)
    }

    /// DISCOVER through ACK.
    async fn exchange(&mut self) -> Result<(), Failure> {
        let deadline = Instant::now() + self.params.deadline;

        // INIT -> DISCOVER_SENT
        let discover = DhcpMessage::discover(self.hw, self.xid);
        let sent_at = Instant::now();
        self.transmit(&discover).await?;
        self.metrics.increment_counter(Counter::DiscoverSent);
        self.conversation.push(discover).map_err(Failure::from)?;
        self.state = SessionState::DiscoverSent;

        // DISCOVER_SENT -> OFFER_RECEIVED
        let offer = self.await_reply(deadline).await?;
        let elapsed = sent_at.elapsed();
        self.conversation.push(offer).map_err(Failure::from)?;
        self.record(Phase::DiscoverOffer, elapsed);
        self.discover_offer = Some(elapsed);
        self.state = SessionState::OfferReceived;

        // OFFER_RECEIVED -> REQUEST_SENT
        let offer = self.conversation.last().ok_or(FailureReason::ProtocolMismatch)?;
        self.lease = offer.lease_offer();
        let request = DhcpMessage::request_from_offer(offer).map_err(|e| {
            trace!(error = %e, "offer unusable");
            FailureReason::ProtocolMismatch
        })?;
        let sent_at = Instant::now();
        self.transmit(&request).await?;
        self.metrics.increment_counter(Counter::RequestSent);
        self.conversation.push(request).map_err(Failure::from)?;
        self.state = SessionState::RequestSent;

        // REQUEST_SENT -> ACK_RECEIVED
        let ack = self.await_reply(deadline).await?;
        let elapsed = sent_at.elapsed();
        // The RELEASE names the offered lease, whatever the ACK echoes back.
        self.conversation.push(ack).map_err(Failure::from)?;
        self.record(Phase::RequestAck, elapsed);
        self.request_ack = Some(elapsed);
        self.state = SessionState::AckReceived;

        Ok(())
    }

    /// ACK_RECEIVED -> RELEASE_SENT.  Failure leaves the state at ACK.
    async fn release(&mut self) -> Result<(), TransportError> {
        let Some(lease) = self.lease else {
            return Ok(());
        };

        let release = DhcpMessage::release(self.hw, lease.client_addr, lease.server_id, random_xid());
        match self.transport.send(&release.encode(), self.params.server).await {
            Ok(()) => {
                self.metrics.increment_counter(Counter::ReleaseSent);
                // The sequence always admits RELEASE after ACK.
                let _ = self.conversation.push(release);
                self.state = SessionState::ReleaseSent;
                Ok(())
            }
            Err(e) => {
                warn!(mac = %self.hw, client = %lease.client_addr, error = %e, "failed to send RELEASE");
                self.metrics.increment_counter(Counter::ReleaseFailed);
                Err(e)
            }
        }
    }

    async fn transmit(&mut self, msg: &DhcpMessage) -> Result<(), Failure> {
        trace!(mac = %self.hw, xid = self.xid, kind = ?msg.message_type(), "sending");
        self.transport
            .send(&msg.encode(), self.params.server)
            .await
            .map_err(Failure::transport)
    }

    /// Next reply for this transaction, of any type.  Frames that do not
    /// decode or belong to other transactions are skipped.
    async fn await_reply(&mut self, deadline: Instant) -> Result<DhcpMessage, Failure> {
        loop {
            let frame = match self.transport.receive(deadline).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(FailureReason::Timeout.into()),
                Err(e) => return Err(Failure::transport(e)),
            };

            match DhcpMessage::decode(&frame) {
                Ok(msg) if msg.is_reply_for(self.xid, self.hw) => return Ok(msg),
                Ok(msg) => trace!(xid = msg.xid, "skipping reply for another transaction"),
                Err(e) => trace!(error = %e, "skipping undecodable frame"),
            }
        }
    }

    fn record(&self, phase: Phase, elapsed: Duration) {
        self.metrics.observe_latency(phase, elapsed.as_secs_f64() * 1000.0);
    }

    fn into_report(
        self,
        release_error: Option<TransportError>,
        transport_error: Option<TransportError>,
    ) -> SessionReport {
        SessionReport {
            hw: self.hw,
            xid: self.xid,
            state: self.state,
            discover_offer: self.discover_offer,
            request_ack: self.request_ack,
            lease: self.lease,
            release_error,
            transport_error,
        }
    }
}

/// Internal failure carrying the socket error, when there is one.
struct Failure {
    reason: FailureReason,
    source: Option<TransportError>,
}

impl Failure {
    fn transport(e: TransportError) -> Self {
        Self {
            reason: FailureReason::TransportError,
            source: Some(e),
        }
    }
}

impl From<FailureReason> for Failure {
    fn from(reason: FailureReason) -> Self {
        Self { reason, source: None }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBehavior, SimConfig, SimTransport, SimulatedServer};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn params() -> SessionParams {
        SessionParams {
            deadline: Duration::from_secs(2),
            server: "255.255.255.255:67".parse().unwrap(),
            send_release: true,
        }
    }

    fn hw() -> HardwareAddr {
        HardwareAddr::new([0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0x01])
    }

    fn setup(config: SimConfig) -> (Arc<SimulatedServer>, SimTransport, MetricsSink) {
        let server = SimulatedServer::new(config);
        let mut transport = SimTransport::new(server.clone());
        transport.bind(hw()).unwrap();
        (server, transport, MetricsSink::new().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_exchange_reaches_release_sent() {
        let (server, mut transport, metrics) = setup(SimConfig {
            offer_delay: Duration::from_millis(20),
            ack_delay: Duration::from_millis(30),
            ..SimConfig::default()
        });
        let params = params();

        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::ReleaseSent);
        assert_eq!(report.outcome(), Outcome::Succeeded);
        assert!(report.discover_offer.unwrap() >= Duration::from_millis(20));
        assert!(report.request_ack.unwrap() >= Duration::from_millis(30));
        assert_eq!(
            report.lease,
            Some(LeaseOffer {
                client_addr: Ipv4Addr::new(10, 99, 0, 10),
                server_id: Ipv4Addr::new(10, 99, 0, 1),
            })
        );

        assert_eq!(metrics.counter_value(Counter::DiscoverSent), 1);
        assert_eq!(metrics.counter_value(Counter::RequestSent), 1);
        assert_eq!(metrics.counter_value(Counter::ReleaseSent), 1);
        assert_eq!(metrics.latency_count(Phase::DiscoverOffer), 1);
        assert_eq!(metrics.latency_count(Phase::RequestAck), 1);
        assert_eq!(server.releases_seen(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out_after_deadline() {
        let (server, mut transport, metrics) = setup(SimConfig {
            behavior: SimBehavior::Silent,
            ..SimConfig::default()
        });
        let params = params();

        let start = Instant::now();
        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::Failed(FailureReason::Timeout));
        assert_eq!(report.outcome(), Outcome::Timeout);
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(server.discovers_seen(), 1);
        assert_eq!(metrics.counter_value(Counter::DiscoverSent), 1);
        assert_eq!(metrics.counter_value(Counter::RequestSent), 0);
        assert_eq!(metrics.latency_count(Phase::DiscoverOffer), 0);
        assert_eq!(metrics.latency_count(Phase::RequestAck), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out_with_offer_sample_only() {
        let (_server, mut transport, metrics) = setup(SimConfig {
            behavior: SimBehavior::IgnoreRequests,
            ..SimConfig::default()
        });
        let params = params();

        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::Failed(FailureReason::Timeout));
        assert!(report.discover_offer.is_some());
        assert!(report.request_ack.is_none());
        assert_eq!(metrics.counter_value(Counter::RequestSent), 1);
        assert_eq!(metrics.latency_count(Phase::DiscoverOffer), 1);
        assert_eq!(metrics.latency_count(Phase::RequestAck), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_spans_whole_exchange() {
        // Each hop fits in 2s on its own, together they do not.
        let (_server, mut transport, metrics) = setup(SimConfig {
            offer_delay: Duration::from_millis(1500),
            ack_delay: Duration::from_millis(1000),
            ..SimConfig::default()
        });
        let params = params();

        let start = Instant::now();
        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::Failed(FailureReason::Timeout));
        assert!(start.elapsed() < Duration::from_millis(2100));
        assert_eq!(metrics.latency_count(Phase::DiscoverOffer), 1);
        assert_eq!(metrics.latency_count(Phase::RequestAck), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_reply_type_is_protocol_mismatch() {
        let (_server, mut transport, metrics) = setup(SimConfig {
            behavior: SimBehavior::AckDiscovers,
            ..SimConfig::default()
        });
        let params = params();

        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::Failed(FailureReason::ProtocolMismatch));
        assert_eq!(report.outcome(), Outcome::ProtocolMismatch);
        assert_eq!(metrics.latency_count(Phase::DiscoverOffer), 0);
        assert_eq!(metrics.counter_value(Counter::RequestSent), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_is_protocol_mismatch() {
        let (server, mut transport, metrics) = setup(SimConfig {
            behavior: SimBehavior::NakRequests,
            ..SimConfig::default()
        });
        let params = params();

        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::Failed(FailureReason::ProtocolMismatch));
        assert_eq!(metrics.latency_count(Phase::DiscoverOffer), 1);
        assert_eq!(metrics.latency_count(Phase::RequestAck), 0);
        assert_eq!(server.requests_seen(), 1);
        assert_eq!(server.releases_seen(), 0);
    }

    /// Server that ACKs a different address than it offered, and records
    /// everything the client sends.
    struct DriftingServer {
        sent: Vec<DhcpMessage>,
        inbox: Vec<bytes::Bytes>,
    }

    const OFFERED: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const ACKED: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 99);
    const SERVER_ID: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[async_trait::async_trait]
    impl Transport for DriftingServer {
        fn bind(&mut self, _hw: HardwareAddr) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&mut self, payload: &[u8], _target: SocketAddr) -> Result<(), TransportError> {
            let msg = DhcpMessage::decode(payload).map_err(|e| TransportError::Other(e.to_string()))?;
            let reply = match msg.message_type() {
                Some(MessageType::Discover) => Some(DhcpMessage::reply(&msg, MessageType::Offer, OFFERED, SERVER_ID)),
                Some(MessageType::Request) => Some(DhcpMessage::reply(&msg, MessageType::Ack, ACKED, SERVER_ID)),
                _ => None,
            };
            if let Some(reply) = reply {
                self.inbox.push(reply.encode());
            }
            self.sent.push(msg);
            Ok(())
        }

        async fn receive(&mut self, _deadline: Instant) -> Result<Option<bytes::Bytes>, TransportError> {
            Ok(self.inbox.pop())
        }
    }

    #[tokio::test]
    async fn test_release_names_the_offered_lease() {
        let mut transport = DriftingServer {
            sent: Vec::new(),
            inbox: Vec::new(),
        };
        let metrics = MetricsSink::new().unwrap();
        let params = params();

        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::ReleaseSent);
        assert_eq!(
            report.lease,
            Some(LeaseOffer {
                client_addr: OFFERED,
                server_id: SERVER_ID,
            })
        );
        let release = transport.sent.last().unwrap();
        assert_eq!(release.message_type(), Some(MessageType::Release));
        assert_eq!(release.ciaddr, OFFERED);
        assert_eq!(release.server_identifier(), Some(SERVER_ID));
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_and_garbage_frames_are_skipped() {
        let (_server, mut transport, metrics) = setup(SimConfig {
            offer_delay: Duration::from_millis(50),
            ..SimConfig::default()
        });
        let params = params();

        // Same client, stale transaction: an OFFER with a different xid.
        let stale = DhcpMessage::discover(hw(), 0);
        let stale_offer = DhcpMessage::reply(
            &stale,
            MessageType::Offer,
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(10, 0, 0, 1),
        );
        transport.inject(stale_offer.encode(), Duration::from_millis(10));

        let mut garbage = vec![0u8; 40];
        garbage[28..34].copy_from_slice(hw().as_bytes());
        transport.inject(garbage.into(), Duration::from_millis(20));

        let session = Session::new(&mut transport, &metrics, &params, hw());
        // The stale xid must differ from the live one for the test to mean anything.
        assert_ne!(session.xid(), 0);
        let report = session.run().await;

        assert_eq!(report.state, SessionState::ReleaseSent);
        assert_eq!(report.lease.unwrap().client_addr, Ipv4Addr::new(10, 99, 0, 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_failure_still_counts_as_success() {
        let (server, mut transport, metrics) = setup(SimConfig {
            fail_release_sends: true,
            ..SimConfig::default()
        });
        let params = params();

        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::AckReceived);
        assert_eq!(report.outcome(), Outcome::Succeeded);
        assert!(report.release_error.is_some());
        assert_eq!(metrics.counter_value(Counter::ReleaseFailed), 1);
        assert_eq!(metrics.counter_value(Counter::ReleaseSent), 0);
        assert_eq!(server.releases_seen(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_can_be_disabled() {
        let (server, mut transport, metrics) = setup(SimConfig::default());
        let params = SessionParams {
            send_release: false,
            ..params()
        };

        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::AckReceived);
        assert_eq!(report.outcome(), Outcome::Succeeded);
        assert_eq!(server.releases_seen(), 0);
        assert_eq!(metrics.counter_value(Counter::ReleaseSent), 0);
    }

    #[tokio::test]
    async fn test_unbound_transport_is_transport_error() {
        let server = SimulatedServer::new(SimConfig::default());
        let mut transport = SimTransport::new(server);
        let metrics = MetricsSink::new().unwrap();
        let params = params();

        let report = Session::new(&mut transport, &metrics, &params, hw()).run().await;

        assert_eq!(report.state, SessionState::Failed(FailureReason::TransportError));
        assert!(matches!(report.transport_error, Some(TransportError::Unbound)));
        assert_eq!(metrics.counter_value(Counter::DiscoverSent), 0);
    }

    #[test]
    fn test_conversation_enforces_order() {
        let mut conv = Conversation::default();
        let discover = DhcpMessage::discover(hw(), 1);
        let ack = DhcpMessage::reply(
            &discover,
            MessageType::Ack,
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 1),
        );

        assert_eq!(conv.push(ack.clone()), Err(FailureReason::ProtocolMismatch));
        assert_eq!(conv.push(discover), Ok(()));
        assert_eq!(conv.push(ack), Err(FailureReason::ProtocolMismatch));
        assert_eq!(conv.last().and_then(|m| m.message_type()), Some(MessageType::Discover));
    }
}
