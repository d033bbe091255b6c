//! Column store trait
//!
//! Every backend offers ordered range scans within a row, multi-get,
//! guarded atomic batches, per-cell TTL and last-write-wins resolution on
//! write timestamps.

use async_trait::async_trait;

use crate::model::{BatchOutcome, Cell, ColumnRange, StoreError, WriteBatch};

#[async_trait]
pub trait ColumnStore: Send + Sync {
    /// Read a single live cell
    async fn get(&self, cf: &str, row: &str, column: &str) -> Result<Option<Cell>, StoreError>;

    /// Read several cells of one row; missing columns are left out
    async fn get_many(
        &self,
        cf: &str,
        row: &str,
        columns: &[String],
    ) -> Result<Vec<Cell>, StoreError>;

    /// Ordered scan of at most `limit` live cells within `range`
    async fn slice(
        &self,
        cf: &str,
        row: &str,
        range: &ColumnRange,
        limit: usize,
    ) -> Result<Vec<Cell>, StoreError>;

    /// Number of live cells in a row
    async fn count(&self, cf: &str, row: &str) -> Result<usize, StoreError>;

    /// Apply a batch atomically.
    ///
    /// All guards are evaluated against the state before the batch. A failing
    /// required group returns `StoreError::ConditionFailed` and nothing is
    /// written; failing optional groups are reported in the outcome.
    async fn apply(&self, batch: WriteBatch) -> Result<BatchOutcome, StoreError>;

    /// Health check for the storage backend
    async fn health_check(&self) -> Result<(), StoreError>;
}
