//! Coordination service abstraction
//!
//! This module provides:
//! - The `Coordinator` trait: a hierarchical namespace with ephemeral and
//!   sequential nodes and one-shot existence watches
//! - An in-process ensemble (`MemoryCoordination`) handing out sessions

mod memory;

pub use memory::{MemoryCoordination, MemorySession};

use async_trait::async_trait;
use tokio::sync::oneshot;

/// Coordination errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("node '{0}' does not exist")]
    NoNode(String),

    #[error("node '{0}' already exists")]
    NodeExists(String),

    #[error("node '{0}' has children")]
    NotEmpty(String),

    #[error("session {0} expired")]
    SessionExpired(u64),

    #[error("timed out acquiring lock '{0}'")]
    LockTimeout(String),

    #[error("coordination service unavailable: {0}")]
    Unavailable(String),
}

impl CoordinationError {
    /// Errors after which the session can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinationError::SessionExpired(_) | CoordinationError::Unavailable(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    NodeDeleted(String),
    /// The ensemble went away before the node changed
    Disconnected,
}

/// One-shot notification for a watched node
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    pub(crate) fn new(rx: oneshot::Receiver<WatchEvent>) -> Self {
        Self { rx }
    }

    pub async fn fired(self) -> WatchEvent {
        self.rx.await.unwrap_or(WatchEvent::Disconnected)
    }
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    fn session_id(&self) -> u64;

    /// Create a node and return its actual path. Sequential modes append a
    /// ten digit, zero padded counter to `path`.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinationError>;

    /// Names (not paths) of the direct children of `path`
    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    async fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordinationError>;

    async fn exists(&self, path: &str) -> Result<bool, CoordinationError>;

    /// Watch `path` for deletion. Returns `None` when the node does not exist.
    async fn exists_watch(&self, path: &str) -> Result<Option<Watch>, CoordinationError>;

    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;
}

/// Create every missing persistent node along `path`
pub async fn ensure_path(
    coordinator: &dyn Coordinator,
    path: &str,
) -> Result<(), CoordinationError> {
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        match coordinator
            .create(&current, Vec::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(CoordinationError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Sort sequential child names by their numeric suffix
pub fn sort_by_sequence(children: &mut [String]) {
    children.sort_by_key(|name| sequence_of(name));
}

/// Numeric suffix of a sequential node name
pub fn sequence_of(name: &str) -> u64 {
    let digits = name
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| &name[i..])
        .unwrap_or("");
    digits.parse().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_by_sequence() {
        let mut children = vec![
            "-lock0000000010".to_string(),
            "-lock0000000002".to_string(),
            "-lock0000000009".to_string(),
        ];
        sort_by_sequence(&mut children);
        assert_eq!(
            children,
            vec!["-lock0000000002", "-lock0000000009", "-lock0000000010"]
        );
        assert_eq!(sequence_of("n_0000000042"), 42);
        assert_eq!(sequence_of("plain"), u64::MAX);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(CoordinationError::SessionExpired(1).is_fatal());
        assert!(!CoordinationError::NoNode("/x".into()).is_fatal());
    }
}
