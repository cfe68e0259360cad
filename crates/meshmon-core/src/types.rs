//! Core types for meshmon
//!
//! This module defines the fundamental identifiers and time types used
//! throughout the pipeline, using newtype patterns for semantic validation and
//! type safety.

use core::fmt;
use core::ops::{Add, Deref, Sub};
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::DecodeError;

// ----------------------------------------------------------------------------
// Node Number
// ----------------------------------------------------------------------------

/// Numeric identifier of a mesh node (the radio's node number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeNum(u32);

impl NodeNum {
    /// Destination used for broadcast packets
    pub const BROADCAST: Self = Self(u32::MAX);

    /// Create a node number from its raw value
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn value(&self) -> u32 {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Display id in the `!xxxxxxxx` form used by mesh clients
    pub fn display_id(&self) -> String {
        format!("!{:08x}", self.0)
    }
}

impl From<u32> for NodeNum {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl FromStr for NodeNum {
    type Err = DecodeError;

    /// Accepts `!aabbccdd`, `0xaabbccdd` or a decimal node number
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = if let Some(hex_part) = trimmed
            .strip_prefix('!')
            .or_else(|| trimmed.strip_prefix("0x"))
        {
            u32::from_str_radix(hex_part, 16)
        } else {
            trimmed.parse::<u32>()
        };

        parsed.map(Self).map_err(|_| DecodeError::MalformedPayload {
            port: "node id",
            reason: format!("'{}' is not a node id", trimmed),
        })
    }
}

// ----------------------------------------------------------------------------
// Key Fingerprint
// ----------------------------------------------------------------------------

/// SHA-256 fingerprint of a node's public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyFingerprint([u8; 32]);

impl KeyFingerprint {
    /// Create a fingerprint from 32 digest bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash raw public key bytes
    pub fn of_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for KeyFingerprint {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DecodeError::MalformedPayload {
            port: "key fingerprint",
            reason: reason.to_string(),
        };
        let bytes = hex::decode(s.trim()).map_err(|_| invalid("invalid hex"))?;
        if bytes.len() != 32 {
            return Err(invalid("fingerprint must be exactly 32 bytes"));
        }
        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&bytes);
        Ok(Self(fingerprint))
    }
}

impl Deref for KeyFingerprint {
    type Target = [u8; 32];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub const fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Timestamp from whole seconds, as carried in radio packets
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// Add seconds to this timestamp
    pub fn add_seconds(&self, seconds: u64) -> Self {
        Self(self.0.saturating_add(seconds.saturating_mul(1000)))
    }

    /// Get duration since another timestamp (zero if `other` is later)
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of timestamps for the pipeline
///
/// Everything that stamps records or compares ages asks a `TimeSource`
/// rather than the system clock, so tests can drive time explicitly.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Hop Count
// ----------------------------------------------------------------------------

/// Hops a packet travelled, derived from its hop-start and hop-limit fields
///
/// Returns `None` when the sender did not report a hop start (older
/// firmware) or the fields are inconsistent.
pub fn hops_travelled(hop_start: u32, hop_limit: u32) -> Option<u8> {
    if hop_start == 0 || hop_limit > hop_start {
        return None;
    }
    u8::try_from(hop_start - hop_limit).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_num_display_and_parse() {
        let node = NodeNum::new(0x1a2b3c4d);
        assert_eq!(node.to_string(), "!1a2b3c4d");
        assert_eq!("!1a2b3c4d".parse::<NodeNum>().unwrap(), node);
        assert_eq!("0x1a2b3c4d".parse::<NodeNum>().unwrap(), node);
        assert_eq!("439041101".parse::<NodeNum>().unwrap(), node);
        assert!("!zz".parse::<NodeNum>().is_err());
    }

    #[test]
    fn test_broadcast() {
        assert!(NodeNum::BROADCAST.is_broadcast());
        assert!(!NodeNum::new(1).is_broadcast());
    }

    #[test]
    fn test_fingerprint_roundtrip_hex() {
        let fp = KeyFingerprint::of_key(&[7u8; 32]);
        let parsed: KeyFingerprint = fp.to_string().parse().unwrap();
        assert_eq!(parsed, fp);
        assert_eq!(fp.short().len(), 8);
    }

    #[test]
    fn test_hops_travelled() {
        assert_eq!(hops_travelled(3, 1), Some(2));
        assert_eq!(hops_travelled(3, 3), Some(0));
        assert_eq!(hops_travelled(0, 0), None);
        assert_eq!(hops_travelled(2, 5), None);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_secs(10);
        assert_eq!(t.as_millis(), 10_000);
        assert_eq!(t.add_seconds(5) - t, 5_000);
        assert_eq!(t - t.add_seconds(5), 0);
    }
}
