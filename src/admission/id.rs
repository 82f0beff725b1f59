//! Request identifiers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Opaque per-arrival token.
///
/// Composed of the arrival time in unix milliseconds and 64 random bits, so
/// two arrivals in the same millisecond still get distinct ids. Used only as
/// a membership and idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    millis: u64,
    nonce: u64,
}

impl RequestId {
    /// Generate a fresh id stamped with the current time.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::from_parts(millis, rand::thread_rng().gen())
    }

    pub fn from_parts(millis: u64, nonce: u64) -> Self {
        Self { millis, nonce }
    }

    /// Arrival time in unix milliseconds.
    pub fn millis(&self) -> u64 {
        self.millis
    }

    /// Truncated form surfaced to callers in acknowledgments and used as the
    /// deferred-result key: millis in hex plus the top 24 random bits.
    pub fn short(&self) -> String {
        format!("{:x}-{:06x}", self.millis, self.nonce >> 40)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:016x}", self.millis, self.nonce)
    }
}
