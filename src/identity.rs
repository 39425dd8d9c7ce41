//! Synthetic client hardware identities.
//!
//! Every transaction runs under a freshly generated 6-byte hardware address.
//! Addresses are drawn from the OS entropy source and then forced into the
//! locally-administered unicast range (`x2:`, `x6:`, `xA:`, `xE:` first
//! octets), so they can never collide with a vendor-assigned NIC address and
//! are never mistaken for a multicast group by the server.

use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Locally-administered bit of the first octet.
const LOCAL_BIT: u8 = 0x02;
/// Multicast (group) bit of the first octet.
const MULTICAST_BIT: u8 = 0x01;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The OS entropy source could not produce bytes.
#[derive(Debug, Error)]
#[error("entropy source unavailable: {0}")]
pub struct RandomSourceError(#[from] rand::Error);

/// A textual hardware address could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid hardware address: {0:?}")]
pub struct ParseHardwareAddrError(String);

// ---------------------------------------------------------------------------
// HardwareAddr
// ---------------------------------------------------------------------------

/// A 6-byte Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HardwareAddr([u8; 6]);

impl HardwareAddr {
    /// Wrap raw octets without modification.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Generate a random locally-administered unicast address.
    pub fn generate() -> Result<Self, RandomSourceError> {
        Self::generate_from(&mut OsRng)
    }

    /// Like [`generate`](Self::generate), drawing from `rng`.
    pub fn generate_from<R: RngCore + ?Sized>(rng: &mut R) -> Result<Self, RandomSourceError> {
        let mut buf = [0u8; 6];
        rng.try_fill_bytes(&mut buf)?;
        Ok(Self::from_random(buf))
    }

    /// Force raw random bytes into the local unicast range.
    fn from_random(mut buf: [u8; 6]) -> Self {
        buf[0] = (buf[0] | LOCAL_BIT) & !MULTICAST_BIT;
        Self(buf)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True if the locally-administered bit is set.
    pub fn is_local(&self) -> bool {
        self.0[0] & LOCAL_BIT != 0
    }

    /// True if the group bit is clear.
    pub fn is_unicast(&self) -> bool {
        self.0[0] & MULTICAST_BIT == 0
    }
}

impl fmt::Display for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for HardwareAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HardwareAddr({})", self)
    }
}

impl FromStr for HardwareAddr {
    type Err = ParseHardwareAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);

        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| ParseHardwareAddrError(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| ParseHardwareAddrError(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(ParseHardwareAddrError(s.to_string()));
        }

        Ok(Self(octets))
    }
}

impl TryFrom<String> for HardwareAddr {
    type Error = ParseHardwareAddrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HardwareAddr> for String {
    fn from(addr: HardwareAddr) -> Self {
        addr.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
