//! In-process simulated DHCP server.
//!
//! [`SimTransport`] implements [`Transport`] without touching the network:
//! every message a worker sends is decoded and answered by a shared
//! [`SimulatedServer`] after a configurable delay.  Used by `--simulate` to
//! exercise the engine end to end on a machine with no DHCP server, and by
//! the test suite.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::trace;

use crate::codec::{DhcpMessage, MessageType};
use crate::identity::HardwareAddr;
use crate::transport::{Transport, TransportError, TransportFactory};

/// How the simulated server answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBehavior {
    /// OFFER every DISCOVER, ACK every REQUEST.
    Normal,
    /// Never answer.
    Silent,
    /// OFFER, then NAK the REQUEST.
    NakRequests,
    /// OFFER, then ignore the REQUEST.
    IgnoreRequests,
    /// Answer DISCOVER with an ACK.
    AckDiscovers,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub behavior: SimBehavior,
    pub server_id: Ipv4Addr,
    /// First address handed out; later leases count up from here.
    pub pool_start: Ipv4Addr,
    pub offer_delay: Duration,
    pub ack_delay: Duration,
    /// Make every RELEASE send fail with a transport error.
    pub fail_release_sends: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            behavior: SimBehavior::Normal,
            server_id: Ipv4Addr::new(10, 99, 0, 1),
            pool_start: Ipv4Addr::new(10, 99, 0, 10),
            offer_delay: Duration::from_millis(5),
            ack_delay: Duration::from_millis(5),
            fail_release_sends: false,
        }
    }
}

// ---------------------------------------------------------------------------
// SimulatedServer
// ---------------------------------------------------------------------------

/// Shared server state.  Counts what it has seen so tests can assert on the
/// traffic the engine generated.
pub struct SimulatedServer {
    config: SimConfig,
    next_host: AtomicU32,
    discovers: AtomicU64,
    requests: AtomicU64,
    releases: AtomicU64,
}

impl SimulatedServer {
    pub fn new(config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            next_host: AtomicU32::new(0),
            discovers: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        })
    }

    pub fn discovers_seen(&self) -> u64 {
        self.discovers.load(Ordering::Relaxed)
    }

    pub fn requests_seen(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn releases_seen(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    fn next_lease(&self) -> Ipv4Addr {
        let offset = self.next_host.fetch_add(1, Ordering::Relaxed);
        Ipv4Addr::from(u32::from(self.config.pool_start).wrapping_add(offset))
    }

    /// Compute the reply to `msg`, if any, and how long it takes to arrive.
    fn handle(&self, msg: &DhcpMessage) -> Option<(Duration, DhcpMessage)> {
        let cfg = &self.config;
        match msg.message_type()? {
            MessageType::Discover => {
                self.discovers.fetch_add(1, Ordering::Relaxed);
                let kind = match cfg.behavior {
                    SimBehavior::Silent => return None,
                    SimBehavior::AckDiscovers => MessageType::Ack,
                    _ => MessageType::Offer,
                };
                let reply = DhcpMessage::reply(msg, kind, self.next_lease(), cfg.server_id);
                Some((cfg.offer_delay, reply))
            }
            MessageType::Request => {
                self.requests.fetch_add(1, Ordering::Relaxed);
                let kind = match cfg.behavior {
                    SimBehavior::Silent | SimBehavior::IgnoreRequests => return None,
                    SimBehavior::NakRequests => MessageType::Nak,
                    _ => MessageType::Ack,
                };
                let addr = msg.requested_ip().unwrap_or(Ipv4Addr::UNSPECIFIED);
                let reply = DhcpMessage::reply(msg, kind, addr, cfg.server_id);
                Some((cfg.ack_delay, reply))
            }
            MessageType::Release => {
                self.releases.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// SimTransport
// ---------------------------------------------------------------------------

pub struct SimTransport {
    server: Arc<SimulatedServer>,
    bound: Option<HardwareAddr>,
    /// Pending frames ordered by arrival time.
    inbox: VecDeque<(Instant, Bytes)>,
}

impl SimTransport {
    pub fn new(server: Arc<SimulatedServer>) -> Self {
        Self {
            server,
            bound: None,
            inbox: VecDeque::new(),
        }
    }

    /// Queue an arbitrary frame to arrive `after` from now.
    pub fn inject(&mut self, frame: Bytes, after: Duration) {
        self.enqueue(Instant::now() + after, frame);
    }

    fn enqueue(&mut self, at: Instant, frame: Bytes) {
        let pos = self.inbox.partition_point(|(t, _)| *t <= at);
        self.inbox.insert(pos, (at, frame));
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn bind(&mut self, hw: HardwareAddr) -> Result<(), TransportError> {
        // Frames for the previous identity can never match again.
        self.inbox.clear();
        self.bound = Some(hw);
        Ok(())
    }

    async fn send(&mut self, payload: &[u8], _target: SocketAddr) -> Result<(), TransportError> {
        if self.bound.is_none() {
            return Err(TransportError::Unbound);
        }

        let msg = match DhcpMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => return Err(TransportError::Other(format!("simulated server rejected frame: {e}"))),
        };

        if msg.message_type() == Some(MessageType::Release) && self.server.config.fail_release_sends {
            return Err(TransportError::Other("simulated release failure".to_string()));
        }

        if let Some((delay, reply)) = self.server.handle(&msg) {
            trace!(xid = msg.xid, reply = ?reply.message_type(), "simulated reply queued");
            self.enqueue(Instant::now() + delay, reply.encode());
        }
        Ok(())
    }

    async fn receive(&mut self, deadline: Instant) -> Result<Option<Bytes>, TransportError> {
        let hw = self.bound.ok_or(TransportError::Unbound)?;

        while let Some((at, _)) = self.inbox.front() {
            if *at > deadline {
                break;
            }
            tokio::time::sleep_until(*at).await;
            if let Some((_, frame)) = self.inbox.pop_front() {
                if frame.get(28..34).is_some_and(|chaddr| chaddr == hw.as_bytes()) {
                    return Ok(Some(frame));
                }
            }
        }

        tokio::time::sleep_until(deadline).await;
        Ok(None)
    }
}

/// Hands every worker a [`SimTransport`] talking to the same server.
#[derive(Clone)]
pub struct SimTransportFactory {
    server: Arc<SimulatedServer>,
}

impl SimTransportFactory {
    pub fn new(server: Arc<SimulatedServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl TransportFactory for SimTransportFactory {
    type Transport = SimTransport;

    async fn open(&self, _worker: usize) -> Result<SimTransport, TransportError> {
        Ok(SimTransport::new(self.server.clone()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
