//! Vigil Consistency - Coordination primitives
//!
//! This crate provides:
//! - The coordination service abstraction and an in-process ensemble
//! - A distributed lock (lowest live sequential node holds it)
//! - Leader election (no predecessor means leader)

pub mod coordination;
pub mod election;
pub mod lock;

// Re-export coordination types
pub use coordination::{
    CoordinationError, Coordinator, CreateMode, MemoryCoordination, MemorySession, Watch,
    WatchEvent, ensure_path,
};

// Re-export election types
pub use election::{Election, ElectionHandle, Role};

// Re-export lock types
pub use lock::{DistributedLock, LockGuard, lock_name};
