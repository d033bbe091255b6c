//! Error kinds and error codes for Vigil
//!
//! This module defines:
//! - `ErrorKind`: the closed classification every crate maps its errors onto
//! - `ErrorCode`: structured code/message pairs used in API responses
//! - `ValidationError`: input validation failures

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Closed classification of failures surfaced to callers.
///
/// Each kind has exactly one `ErrorCode` and one HTTP status, see
/// [`ErrorKind::code`] and [`ErrorKind::http_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    LimitReached,
    Validation,
    /// Nothing to do. Never reaches a client.
    ShortCircuit,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub const fn code(self) -> ErrorCode<'static> {
        match self {
            ErrorKind::NotFound => OBJECT_DOES_NOT_EXIST,
            ErrorKind::AlreadyExists => SERVICE_WITH_THIS_ID_EXISTS,
            ErrorKind::LimitReached => LIMIT_REACHED,
            ErrorKind::Validation => VALIDATION_FAILED,
            ErrorKind::ShortCircuit => NOTHING_TO_DO,
            ErrorKind::Unavailable => BACKEND_UNAVAILABLE,
            ErrorKind::Internal => INTERNAL_ERROR,
        }
    }

    pub const fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::LimitReached => 403,
            ErrorKind::Validation => 400,
            ErrorKind::ShortCircuit => 204,
            ErrorKind::Unavailable => 503,
            ErrorKind::Internal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::LimitReached => "limit_reached",
            ErrorKind::Validation => "validation",
            ErrorKind::ShortCircuit => "short_circuit",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error code structure for API responses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode<'a> {
    pub code: i32,
    pub message: &'a str,
}

pub const OBJECT_DOES_NOT_EXIST: ErrorCode<'static> = ErrorCode {
    code: 40400,
    message: "object does not exist",
};

pub const SERVICE_WITH_THIS_ID_EXISTS: ErrorCode<'static> = ErrorCode {
    code: 40900,
    message: "service with this id already exists",
};

pub const LIMIT_REACHED: ErrorCode<'static> = ErrorCode {
    code: 40300,
    message: "resource limit reached",
};

pub const VALIDATION_FAILED: ErrorCode<'static> = ErrorCode {
    code: 40000,
    message: "validation failed",
};

pub const NOTHING_TO_DO: ErrorCode<'static> = ErrorCode {
    code: 20400,
    message: "nothing to do",
};

pub const BACKEND_UNAVAILABLE: ErrorCode<'static> = ErrorCode {
    code: 50300,
    message: "backend unavailable",
};

pub const INTERNAL_ERROR: ErrorCode<'static> = ErrorCode {
    code: 50000,
    message: "internal error",
};

/// A single field that failed validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid '{field}': {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ErrorKind; 7] = [
        ErrorKind::NotFound,
        ErrorKind::AlreadyExists,
        ErrorKind::LimitReached,
        ErrorKind::Validation,
        ErrorKind::ShortCircuit,
        ErrorKind::Unavailable,
        ErrorKind::Internal,
    ];

    #[test]
    fn test_codes_are_unique() {
        let mut codes: Vec<i32> = ALL.iter().map(|k| k.code().code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), ALL.len());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::AlreadyExists.http_status(), 409);
        assert_eq!(ErrorKind::LimitReached.http_status(), 403);
        assert_eq!(ErrorKind::Validation.http_status(), 400);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AlreadyExists).unwrap();
        assert_eq!(json, "\"already_exists\"");
        assert_eq!(ErrorKind::LimitReached.to_string(), "limit_reached");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("heartbeat_timeout", "must be between 3 and 120");
        assert_eq!(
            err.to_string(),
            "invalid 'heartbeat_timeout': must be between 3 and 120"
        );
    }
}
