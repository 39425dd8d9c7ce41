//! Datagram transport used by sessions.
//!
//! A [`Transport`] is owned by exactly one worker and bound to one hardware
//! address at a time.  Replies to other workers' transactions share the
//! broadcast domain, so a bound transport only surfaces datagrams whose
//! `chaddr` matches its current identity.

use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::identity::HardwareAddr;

/// Offset of `chaddr` inside a BOOTP header.
const CHADDR_OFFSET: usize = 28;
/// Large enough for any DHCP message on a standard MTU.
const RECV_BUFFER_LEN: usize = 1500;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open socket on {addr}: {source}")]
    Open {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("send to {target} failed: {source}")]
    Send {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("transport is not bound to a hardware address")]
    Unbound,

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Broadcast-capable datagram channel keyed to one hardware identity.
#[async_trait]
pub trait Transport: Send {
    /// Associate subsequent sends and receives with `hw`.
    fn bind(&mut self, hw: HardwareAddr) -> Result<(), TransportError>;

    /// Send one datagram to `target`.
    async fn send(&mut self, payload: &[u8], target: SocketAddr) -> Result<(), TransportError>;

    /// Wait for the next datagram addressed to the bound identity.
    /// Returns `Ok(None)` once `deadline` passes.
    async fn receive(&mut self, deadline: Instant) -> Result<Option<Bytes>, TransportError>;
}

/// Opens one [`Transport`] per worker.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport + 'static;

    async fn open(&self, worker: usize) -> Result<Self::Transport, TransportError>;
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// UDP socket with `SO_BROADCAST` and `SO_REUSEADDR`, so every worker can
/// hold its own socket on the DHCP client port.
pub struct UdpTransport {
    socket: UdpSocket,
    bound: Option<HardwareAddr>,
    buf: Vec<u8>,
}

impl UdpTransport {
    /// Open a socket per `config`.  Must be called inside a Tokio runtime.
    pub fn open(config: &TransportConfig) -> Result<Self, TransportError> {
        let addr = SocketAddr::new(IpAddr::V4(config.bind_address), config.client_port);
        let open_err = |source| TransportError::Open { addr, source };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(open_err)?;
        socket.set_reuse_address(true).map_err(open_err)?;
        socket.set_broadcast(true).map_err(open_err)?;

        if let Some(iface) = &config.interface {
            bind_to_interface(&socket, iface).map_err(open_err)?;
        }

        socket.set_nonblocking(true).map_err(open_err)?;
        socket.bind(&addr.into()).map_err(open_err)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(open_err)?;
        debug!(
            local = ?socket.local_addr().ok(),
            interface = config.interface.as_deref().unwrap_or("any"),
            "opened broadcast socket"
        );

        Ok(Self {
            socket,
            bound: None,
            buf: vec![0u8; RECV_BUFFER_LEN],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_interface(socket: &Socket, iface: &str) -> io::Result<()> {
    socket.bind_device(Some(iface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_interface(_socket: &Socket, iface: &str) -> io::Result<()> {
    tracing::warn!(interface = iface, "interface pinning is only supported on Linux, ignoring");
    Ok(())
}

/// True if `frame` carries `hw` in its `chaddr` field.
fn addressed_to(frame: &[u8], hw: &HardwareAddr) -> bool {
    frame
        .get(CHADDR_OFFSET..CHADDR_OFFSET + 6)
        .is_some_and(|chaddr| chaddr == hw.as_bytes())
}

#[async_trait]
impl Transport for UdpTransport {
    fn bind(&mut self, hw: HardwareAddr) -> Result<(), TransportError> {
        self.bound = Some(hw);
        Ok(())
    }

    async fn send(&mut self, payload: &[u8], target: SocketAddr) -> Result<(), TransportError> {
        if self.bound.is_none() {
            return Err(TransportError::Unbound);
        }
        self.socket
            .send_to(payload, target)
            .await
            .map_err(|source| TransportError::Send { target, source })?;
        Ok(())
    }

    async fn receive(&mut self, deadline: Instant) -> Result<Option<Bytes>, TransportError> {
        let hw = self.bound.ok_or(TransportError::Unbound)?;

        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.recv_from(&mut self.buf)).await;
            match received {
                Err(_elapsed) => return Ok(None),
                Ok(Err(e)) => return Err(TransportError::Receive(e)),
                Ok(Ok((len, from))) => {
                    let frame = &self.buf[..len];
                    if addressed_to(frame, &hw) {
                        return Ok(Some(Bytes::copy_from_slice(frame)));
                    }
                    trace!(%from, len, "skipping datagram for another client");
                }
            }
        }
    }
}

/// Opens a [`UdpTransport`] for each worker from a shared config.
#[derive(Debug, Clone)]
pub struct UdpTransportFactory {
    config: TransportConfig,
}

impl UdpTransportFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    type Transport = UdpTransport;

    async fn open(&self, _worker: usize) -> Result<UdpTransport, TransportError> {
        UdpTransport::open(&self.config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
