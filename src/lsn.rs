//! Log sequence numbers
//!
//! An LSN is a 64-bit byte offset into the write-ahead log, written in the
//! `HI/LO` form (two upper-case hex halves). `0/0` is the invalid position a
//! node reports before it has received anything.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Position in the write-ahead log stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lsn(u64);

impl Lsn {
    /// The invalid position.
    pub const INVALID: Lsn = Lsn(0);

    /// Create from a raw byte offset.
    pub const fn new(raw: u64) -> Self {
        Lsn(raw)
    }

    /// Raw byte offset.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is a usable position (anything but `0/0`).
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Advance by `bytes`, saturating at the maximum position.
    pub fn advance(&self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_add(bytes))
    }

    /// Number of bytes `self` is behind `other` (zero if not behind).
    pub fn bytes_behind(&self, other: Lsn) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| ClusterError::Protocol(format!("invalid LSN \"{}\"", s)))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| ClusterError::Protocol(format!("invalid LSN \"{}\"", s)))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| ClusterError::Protocol(format!("invalid LSN \"{}\"", s)))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl TryFrom<String> for Lsn {
    type Error = ClusterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Lsn> for String {
    fn from(lsn: Lsn) -> Self {
        lsn.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.as_u64(), (0x16 << 32) | 0xB374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
    }

    #[test]
    fn test_ordering_crosses_segment_boundary() {
        let a: Lsn = "0/FFFFFFFF".parse().unwrap();
        let b: Lsn = "1/0".parse().unwrap();
        assert!(a < b);
        assert_eq!(a.bytes_behind(b), 1);
        assert_eq!(b.bytes_behind(a), 0);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!("".parse::<Lsn>().is_err());
        assert!("0-300".parse::<Lsn>().is_err());
        assert!("G/0".parse::<Lsn>().is_err());
        assert!(!Lsn::INVALID.is_valid());
        assert!("0/300".parse::<Lsn>().unwrap().is_valid());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let lsn: Lsn = "0/5000028".parse().unwrap();
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"0/5000028\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }
}
