//! Implementation of Bluetooth's MAC address.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

/// Stores the 6 byte address used to identify Bluetooth devices. `address[0]`
/// is the most significant byte.
#[derive(Copy, Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BDAddr {
    address: [u8; 6],
}

/// An error parsing a [`BDAddr`] from a string.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ParseBDAddrError {
    #[error("Bluetooth address has to be 6 bytes long")]
    IncorrectByteCount,
    #[error("Invalid digit in address: {0}")]
    InvalidDigit(#[from] std::num::ParseIntError),
}

impl Display for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let a = &self.address;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl Debug for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

impl From<[u8; 6]> for BDAddr {
    fn from(address: [u8; 6]) -> Self {
        Self { address }
    }
}

impl TryFrom<u64> for BDAddr {
    type Error = ParseBDAddrError;

    /// Build an address from its integer form, as used by the WinRT API. The
    /// two most significant bytes must be zero.
    fn try_from(int: u64) -> Result<Self, Self::Error> {
        let bytes = int.to_be_bytes();
        if bytes[0..2] != [0, 0] {
            return Err(ParseBDAddrError::IncorrectByteCount);
        }
        let mut address = [0; 6];
        address.copy_from_slice(&bytes[2..]);
        Ok(Self { address })
    }
}

impl From<BDAddr> for u64 {
    fn from(addr: BDAddr) -> Self {
        addr.address
            .iter()
            .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte))
    }
}

impl FromStr for BDAddr {
    type Err = ParseBDAddrError;

    /// Parse a colon-separated address, e.g. `AA:BB:CC:DD:EE:FF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut address = [0; 6];
        let mut parts = 0;
        for (i, part) in s.split(':').enumerate() {
            if i >= 6 || part.len() != 2 {
                return Err(ParseBDAddrError::IncorrectByteCount);
            }
            address[i] = u8::from_str_radix(part, 16)?;
            parts = i + 1;
        }
        if parts != 6 {
            return Err(ParseBDAddrError::IncorrectByteCount);
        }
        Ok(Self { address })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let addr: BDAddr = "2a:cc:00:34:FA:00".parse().unwrap();
        assert_eq!(addr.to_string(), "2A:CC:00:34:FA:00");
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("2a:cc:00:34:FA".parse::<BDAddr>().is_err());
        assert!("2a:cc:00:34:FA:00:11".parse::<BDAddr>().is_err());
        assert!("2a:cc:00:34:FA:0q".parse::<BDAddr>().is_err());
        assert!("2acc003 4FA00".parse::<BDAddr>().is_err());
    }

    #[test]
    fn integer_round_trip() {
        let int = 252_566_450_624_623u64;
        let addr = BDAddr::try_from(int).unwrap();
        assert_eq!(u64::from(addr), int);
        assert!(BDAddr::try_from(u64::MAX).is_err());
    }
}
