//! Guest hardware addresses
//!
//! Every VM gets a freshly generated address with the locally administered
//! bit set and the multicast bit cleared, so it never collides with a vendor
//! assigned address on the same bridge.
use std::{fmt, str::FromStr};

const MULTICAST_BIT: u8 = 0b0000_0001;
const LOCALLY_ADMINISTERED_BIT: u8 = 0b0000_0010;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid MAC address {0:?}")]
pub struct ParseMacError(String);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> MacAddress {
        MacAddress(octets)
    }

    /// Random unicast, locally administered address
    pub fn generate() -> MacAddress {
        let mut octets: [u8; 6] = rand::random();
        octets[0] &= !MULTICAST_BIT;
        octets[0] |= LOCALLY_ADMINISTERED_BIT;
        MacAddress(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & LOCALLY_ADMINISTERED_BIT != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & MULTICAST_BIT == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Accepts `:` or `-` separated octets in either case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseMacError(s.to_string());
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 || !part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(MacAddress(octets))
    }
}
