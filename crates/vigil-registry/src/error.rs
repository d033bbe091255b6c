//! Registry errors

use vigil_common::{ErrorKind, ValidationError};
use vigil_consistency::CoordinationError;
use vigil_persistence::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("{kind} '{id}' does not exist")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("limit of {limit} {resource} reached")]
    LimitReached { resource: String, limit: u64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("nothing to do")]
    ShortCircuit,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

impl RegistryError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RegistryError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        RegistryError::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::NotFound { .. } => ErrorKind::NotFound,
            RegistryError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            RegistryError::LimitReached { .. } => ErrorKind::LimitReached,
            RegistryError::Validation(_) => ErrorKind::Validation,
            RegistryError::ShortCircuit => ErrorKind::ShortCircuit,
            RegistryError::Store(StoreError::Unavailable(_)) => ErrorKind::Unavailable,
            RegistryError::Store(_) => ErrorKind::Internal,
            RegistryError::Coordination(CoordinationError::NoNode(_))
            | RegistryError::Coordination(CoordinationError::NodeExists(_))
            | RegistryError::Coordination(CoordinationError::NotEmpty(_)) => ErrorKind::Internal,
            RegistryError::Coordination(_) => ErrorKind::Unavailable,
        }
    }

    /// Errors that mean a backend is unreachable; the sweep stops on these
    pub fn is_fatal(&self) -> bool {
        match self {
            RegistryError::Store(StoreError::Unavailable(_)) => true,
            RegistryError::Coordination(e) => e.is_fatal(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            RegistryError::not_found("service", "api").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            RegistryError::already_exists("service", "api")
                .kind()
                .http_status(),
            409
        );
        assert_eq!(
            RegistryError::Coordination(CoordinationError::LockTimeout("x".into())).kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(
            RegistryError::Store(StoreError::Internal("x".into())).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_fatal() {
        assert!(RegistryError::Store(StoreError::Unavailable("down".into())).is_fatal());
        assert!(RegistryError::Coordination(CoordinationError::SessionExpired(3)).is_fatal());
        assert!(!RegistryError::not_found("account", "a").is_fatal());
        assert!(!RegistryError::ShortCircuit.is_fatal());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            RegistryError::not_found("service", "api").to_string(),
            "service 'api' does not exist"
        );
        assert_eq!(
            RegistryError::LimitReached {
                resource: "services".into(),
                limit: 2
            }
            .to_string(),
            "limit of 2 services reached"
        );
    }
}
