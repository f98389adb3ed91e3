//! 128-bit time-ordered identifiers used for transactions and correlation
//! headers (spec §3: "128-bit time-ordered identifier (unique, monotone
//! across process)").
//!
//! Backed by UUIDv7, which is exactly a Unix-timestamp-prefixed 128-bit
//! value with random tail bits -- unique, sortable, no coordination needed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A time-ordered 128-bit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(uuid::Uuid);

impl TxId {
    /// Generate a fresh, monotone-enough identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// The raw 128-bit value.
    #[must_use]
    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotone_and_unique() {
        let a = TxId::new();
        let b = TxId::new();
        assert_ne!(a, b);
        assert!(a <= b, "uuidv7 ids should sort non-decreasing by generation order");
    }

    #[test]
    fn round_trips_through_display_and_parse() {
        let id = TxId::new();
        let parsed: TxId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
