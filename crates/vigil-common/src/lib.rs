//! Vigil Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Vigil components:
//! - Error kinds and error codes
//! - Time-ordered tokens
//! - The clock abstraction
//! - Input validation
//! - Common constants

pub mod clock;
pub mod error;
pub mod token;
pub mod validation;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ErrorCode, ErrorKind, ValidationError};
pub use token::Token;

/// Size of the account shard space
pub const DEFAULT_MAX_SHARDS: u32 = 512;

/// Default page size for list operations
pub const PAGINATION_DEFAULT_LIMIT: usize = 100;

/// Upper bound on a requested page size
pub const PAGINATION_MAX_LIMIT: usize = 1000;

/// Events expire after 30 days
pub const EVENT_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Last heartbeat records expire after 7 days
pub const LAST_HEARTBEAT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// How far behind account creation the first rectification watermark starts
pub const INITIAL_WATERMARK_LAG_MILLIS: i64 = 2 * 60 * 60 * 1000;

/// Resource names used in account limits
pub const LIMIT_SERVICES: &str = "services";
pub const LIMIT_CONFIGURATION_VALUES: &str = "configuration_values";

pub const DEFAULT_SERVICES_LIMIT: u64 = 1000;
pub const DEFAULT_CONFIGURATION_VALUES_LIMIT: u64 = 1000;
