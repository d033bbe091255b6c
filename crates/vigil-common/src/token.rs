//! Time-ordered tokens
//!
//! A `Token` is a UUID version 7. Its first 48 bits hold the big-endian Unix
//! millisecond timestamp, so comparing tokens compares their timestamps first.
//! Heartbeat markers use the deadline as the timestamp, event ids use the
//! time of the event, and the per-account rectification watermark is a token.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::{Builder, Uuid};

use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(Uuid);

impl Token {
    /// Mint a fresh token for the given millisecond.
    pub fn new(millis: i64) -> Self {
        let random: [u8; 10] = rand::random();
        Self::with_random(millis, &random)
    }

    /// Smallest token that can carry `millis`.
    pub fn low(millis: i64) -> Self {
        Self::with_random(millis, &[0x00; 10])
    }

    /// Largest token that can carry `millis`.
    pub fn high(millis: i64) -> Self {
        Self::with_random(millis, &[0xFF; 10])
    }

    fn with_random(millis: i64, random: &[u8; 10]) -> Self {
        let millis = millis.max(0) as u64;
        Token(Builder::from_unix_timestamp_millis(millis, random).into_uuid())
    }

    pub fn timestamp_millis(&self) -> i64 {
        let b = self.0.as_bytes();
        let mut ms: i64 = 0;
        for byte in &b[..6] {
            ms = (ms << 8) | i64::from(*byte);
        }
        ms
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for Token {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Token)
            .map_err(|e| ValidationError::new("token", e.to_string()))
    }
}

impl From<Uuid> for Token {
    fn from(value: Uuid) -> Self {
        Token(value)
    }
}
