//! DHCPv4 message model and wire codec (RFC 2131 / RFC 2132).
//!
//! Only the parts a DORA client needs are modelled as typed options; every
//! other option survives decoding as [`DhcpOption::Unknown`] so a reply is
//! never rejected for carrying options we do not care about.
//!
//! Wire layout:
//!
//! ```text
//! op | htype | hlen | hops | xid (4) | secs (2) | flags (2)
//! ciaddr | yiaddr | siaddr | giaddr            (4 bytes each)
//! chaddr (16) | sname (64) | file (128)
//! magic cookie 63 82 53 63 | options ... | 255
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::identity::HardwareAddr;

/// BOOTP fixed header length, up to and excluding the magic cookie.
const HEADER_LEN: usize = 236;
/// RFC 1497 vendor extensions cookie.
const MAGIC_COOKIE: u32 = 0x6382_5363;
/// Minimum BOOTP message size accepted by legacy relays.
const MIN_MESSAGE_LEN: usize = 300;
/// `flags` bit asking the server to broadcast its reply.
pub const FLAG_BROADCAST: u16 = 0x8000;

const HTYPE_ETHERNET: u8 = 1;
const HLEN_ETHERNET: u8 = 6;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAMETER_REQUEST_LIST: u8 = 55;
const OPT_CLIENT_ID: u8 = 61;
const OPT_END: u8 = 255;

/// Subnet mask, router, DNS, domain name, lease time, server identifier.
const DEFAULT_PARAMETER_REQUEST_LIST: [u8; 6] = [1, 3, 6, 15, 51, 54];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("bad magic cookie {0:#010x}")]
    BadMagicCookie(u32),

    #[error("unsupported hardware type {htype} / length {hlen}")]
    UnsupportedHardware { htype: u8, hlen: u8 },

    #[error("unknown op code {0}")]
    UnknownOpCode(u8),

    #[error("option {code} has invalid length {len}")]
    BadOption { code: u8, len: usize },

    #[error("unknown DHCP message type {0}")]
    UnknownMessageType(u8),

    #[error("offer carries no usable lease (yiaddr or server identifier missing)")]
    MissingLease,

    #[error("expected a {expected} message, got {actual:?}")]
    WrongMessageType {
        expected: MessageType,
        actual: Option<MessageType>,
    },
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    BootRequest = 1,
    BootReply = 2,
}

impl TryFrom<u8> for OpCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::BootRequest),
            2 => Ok(Self::BootReply),
            other => Err(CodecError::UnknownOpCode(other)),
        }
    }
}

/// DHCP message type (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    Unknown { code: u8, data: Vec<u8> },
}

impl DhcpOption {
    pub fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OPT_SUBNET_MASK,
            Self::RequestedIpAddress(_) => OPT_REQUESTED_IP,
            Self::LeaseTime(_) => OPT_LEASE_TIME,
            Self::MessageType(_) => OPT_MESSAGE_TYPE,
            Self::ServerIdentifier(_) => OPT_SERVER_ID,
            Self::ParameterRequestList(_) => OPT_PARAMETER_REQUEST_LIST,
            Self::ClientIdentifier(_) => OPT_CLIENT_ID,
            Self::Unknown { code, .. } => *code,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.code());
        match self {
            Self::SubnetMask(addr) | Self::RequestedIpAddress(addr) | Self::ServerIdentifier(addr) => {
                buf.put_u8(4);
                buf.put_slice(&addr.octets());
            }
            Self::LeaseTime(secs) => {
                buf.put_u8(4);
                buf.put_u32(*secs);
            }
            Self::MessageType(kind) => {
                buf.put_u8(1);
                buf.put_u8(*kind as u8);
            }
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::Unknown { data, .. } => {
                // Options longer than 255 bytes would need RFC 3396 splitting,
                // which nothing we build requires.
                let len = data.len().min(u8::MAX as usize);
                buf.put_u8(len as u8);
                buf.put_slice(&data[..len]);
            }
        }
    }

    fn decode(code: u8, data: &[u8]) -> Result<Self, CodecError> {
        let addr = || -> Result<Ipv4Addr, CodecError> {
            <[u8; 4]>::try_from(data)
                .map(Ipv4Addr::from)
                .map_err(|_| CodecError::BadOption { code, len: data.len() })
        };

        Ok(match code {
            OPT_SUBNET_MASK => Self::SubnetMask(addr()?),
            OPT_REQUESTED_IP => Self::RequestedIpAddress(addr()?),
            OPT_SERVER_ID => Self::ServerIdentifier(addr()?),
            OPT_LEASE_TIME => Self::LeaseTime(u32::from(addr()?)),
            OPT_MESSAGE_TYPE => match data {
                [kind] => Self::MessageType(MessageType::try_from(*kind)?),
                _ => return Err(CodecError::BadOption { code, len: data.len() }),
            },
            OPT_PARAMETER_REQUEST_LIST => Self::ParameterRequestList(data.to_vec()),
            OPT_CLIENT_ID => Self::ClientIdentifier(data.to_vec()),
            _ => Self::Unknown {
                code,
                data: data.to_vec(),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// LeaseOffer
// ---------------------------------------------------------------------------

/// The part of an OFFER/ACK a client needs to continue the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseOffer {
    /// Address offered to the client (`yiaddr`).
    pub client_addr: Ipv4Addr,
    /// Server identifier (option 54, or `siaddr` when the option is absent).
    pub server_id: Ipv4Addr,
}

// ---------------------------------------------------------------------------
// DhcpMessage
// ---------------------------------------------------------------------------

/// A decoded DHCPv4 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: OpCode,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: HardwareAddr,
    pub options: Vec<DhcpOption>,
}

impl DhcpMessage {
    fn client(kind: MessageType, hw: HardwareAddr, xid: u32) -> Self {
        Self {
            op: OpCode::BootRequest,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: hw,
            options: vec![
                DhcpOption::MessageType(kind),
                DhcpOption::ClientIdentifier(client_identifier(hw)),
            ],
        }
    }

    /// DISCOVER asking for a broadcast reply (RFC 2131 §4.4.1, table 5).
    pub fn discover(hw: HardwareAddr, xid: u32) -> Self {
        let mut msg = Self::client(MessageType::Discover, hw, xid);
        msg.flags = FLAG_BROADCAST;
        msg.options.push(DhcpOption::ParameterRequestList(
            DEFAULT_PARAMETER_REQUEST_LIST.to_vec(),
        ));
        msg
    }

    /// REQUEST in the SELECTING state, accepting `offer`.
    pub fn request_from_offer(offer: &DhcpMessage) -> Result<Self, CodecError> {
        let kind = offer.message_type();
        if kind != Some(MessageType::Offer) {
            return Err(CodecError::WrongMessageType {
                expected: MessageType::Offer,
                actual: kind,
            });
        }
        let lease = offer.lease_offer().ok_or(CodecError::MissingLease)?;

        let mut msg = Self::client(MessageType::Request, offer.chaddr, offer.xid);
        msg.flags = FLAG_BROADCAST;
        msg.options.extend([
            DhcpOption::RequestedIpAddress(lease.client_addr),
            DhcpOption::ServerIdentifier(lease.server_id),
            DhcpOption::ParameterRequestList(DEFAULT_PARAMETER_REQUEST_LIST.to_vec()),
        ]);
        Ok(msg)
    }

    /// RELEASE of `client_addr` back to `server_id`.
    pub fn release(hw: HardwareAddr, client_addr: Ipv4Addr, server_id: Ipv4Addr, xid: u32) -> Self {
        let mut msg = Self::client(MessageType::Release, hw, xid);
        msg.ciaddr = client_addr;
        msg.options.push(DhcpOption::ServerIdentifier(server_id));
        msg
    }

    /// Server-side reply to `request`, used by scripted test servers.
    pub fn reply(
        request: &DhcpMessage,
        kind: MessageType,
        client_addr: Ipv4Addr,
        server_id: Ipv4Addr,
    ) -> Self {
        Self {
            op: OpCode::BootReply,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: client_addr,
            siaddr: server_id,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            options: vec![
                DhcpOption::MessageType(kind),
                DhcpOption::ServerIdentifier(server_id),
                DhcpOption::LeaseTime(3600),
            ],
        }
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::MessageType(kind) => Some(*kind),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::ServerIdentifier(addr) => Some(*addr),
            _ => None,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|opt| match opt {
            DhcpOption::RequestedIpAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// True if this is a server reply belonging to transaction `xid` for
    /// client `hw`.  The message type is not checked.
    pub fn is_reply_for(&self, xid: u32, hw: HardwareAddr) -> bool {
        self.op == OpCode::BootReply && self.xid == xid && self.chaddr == hw
    }

    /// Extract the lease fields from an OFFER or ACK.
    pub fn lease_offer(&self) -> Option<LeaseOffer> {
        if self.yiaddr.is_unspecified() {
            return None;
        }
        let server_id = self
            .server_identifier()
            .or_else(|| (!self.siaddr.is_unspecified()).then_some(self.siaddr))?;

        Some(LeaseOffer {
            client_addr: self.yiaddr,
            server_id,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MIN_MESSAGE_LEN);

        buf.put_u8(self.op as u8);
        buf.put_u8(HTYPE_ETHERNET);
        buf.put_u8(HLEN_ETHERNET);
        buf.put_u8(0); // hops
        buf.put_u32(self.xid);
        buf.put_u16(self.secs);
        buf.put_u16(self.flags);
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            buf.put_slice(&addr.octets());
        }
        buf.put_slice(self.chaddr.as_bytes());
        buf.put_bytes(0, 16 - 6); // chaddr padding
        buf.put_bytes(0, 64 + 128); // sname + file

        buf.put_u32(MAGIC_COOKIE);
        for opt in &self.options {
            opt.encode(&mut buf);
        }
        buf.put_u8(OPT_END);

        if buf.len() < MIN_MESSAGE_LEN {
            let pad = MIN_MESSAGE_LEN - buf.len();
            buf.put_bytes(OPT_PAD, pad);
        }

        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        let needed = HEADER_LEN + 4;
        if data.len() < needed {
            return Err(CodecError::Truncated {
                needed,
                have: data.len(),
            });
        }

        let op = OpCode::try_from(data.get_u8())?;
        let htype = data.get_u8();
        let hlen = data.get_u8();
        if htype != HTYPE_ETHERNET || hlen != HLEN_ETHERNET {
            return Err(CodecError::UnsupportedHardware { htype, hlen });
        }
        let _hops = data.get_u8();
        let xid = data.get_u32();
        let secs = data.get_u16();
        let flags = data.get_u16();
        let ciaddr = Ipv4Addr::from(data.get_u32());
        let yiaddr = Ipv4Addr::from(data.get_u32());
        let siaddr = Ipv4Addr::from(data.get_u32());
        let giaddr = Ipv4Addr::from(data.get_u32());

        let mut chaddr = [0u8; 6];
        data.copy_to_slice(&mut chaddr);
        data.advance(16 - 6 + 64 + 128);

        let cookie = data.get_u32();
        if cookie != MAGIC_COOKIE {
            return Err(CodecError::BadMagicCookie(cookie));
        }

        let mut options = Vec::new();
        while data.has_remaining() {
            let code = data.get_u8();
            match code {
                OPT_PAD => continue,
                OPT_END => break,
                _ => {}
            }
            if !data.has_remaining() {
                return Err(CodecError::BadOption { code, len: 0 });
            }
            let len = usize::from(data.get_u8());
            if data.remaining() < len {
                return Err(CodecError::BadOption { code, len });
            }
            options.push(DhcpOption::decode(code, &data[..len])?);
            data.advance(len);
        }

        Ok(Self {
            op,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr: HardwareAddr::new(chaddr),
            options,
        })
    }
}

/// Option 61 value: hardware type followed by the address.
fn client_identifier(hw: HardwareAddr) -> Vec<u8> {
    let mut id = Vec::with_capacity(7);
    id.push(HTYPE_ETHERNET);
    id.extend_from_slice(hw.as_bytes());
    id
}

/// Fresh random transaction id.
pub fn random_xid() -> u32 {
    rand::random()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
