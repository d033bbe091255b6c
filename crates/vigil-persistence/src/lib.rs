//! Vigil Persistence - Column store abstraction and backends
//!
//! This crate provides:
//! - The `ColumnStore` trait every registry component is written against
//! - Guarded write batches with last-write-wins timestamps and TTL cells
//! - An in-memory backend (`MemoryColumnStore`)
//! - An embedded RocksDB backend (`RocksColumnStore`, feature `embedded`)

#[cfg(feature = "embedded")]
pub mod embedded;
pub mod memory;
pub mod model;
pub mod traits;

pub use memory::{MemoryColumnStore, StoreStats};
pub use model::{
    BatchOutcome, Cell, CellKey, ColumnRange, Guard, Mutation, MutationGroup, StoreError,
    WriteBatch, encode,
};
pub use traits::ColumnStore;

#[cfg(feature = "embedded")]
pub use embedded::RocksColumnStore;
