//! In-memory column store
//!
//! Rows are `BTreeMap`s so column scans come back ordered. A single mutex
//! guards the whole table, which makes every batch atomic. Expired cells are
//! hidden on read and purged by the optional cleanup task.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::interval;
use vigil_common::{Clock, SystemClock};

use crate::model::{
    BatchOutcome, Cell, CellKey, ColumnRange, Mutation, StoreError, WriteBatch, evaluate_guards,
};
use crate::traits::ColumnStore;

#[derive(Debug, Clone)]
struct StoredCell {
    value: Vec<u8>,
    write_ts: i64,
    expires_at: Option<i64>,
}

impl StoredCell {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at.is_none_or(|at| at > now_ms)
    }
}

type RowKey = (String, String);

#[derive(Default)]
struct Table {
    rows: HashMap<RowKey, BTreeMap<String, StoredCell>>,
    last_write_ts: i64,
}

impl Table {
    fn live(&self, key: &CellKey, now_ms: i64) -> Option<&StoredCell> {
        self.rows
            .get(&(key.cf.clone(), key.row.clone()))
            .and_then(|row| row.get(&key.column))
            .filter(|c| c.is_live(now_ms))
    }

    /// Monotonic microsecond timestamp for writes that carry none
    fn next_write_ts(&mut self, now_ms: i64) -> i64 {
        let ts = (now_ms * 1000).max(self.last_write_ts + 1);
        self.last_write_ts = ts;
        ts
    }

    fn apply(&mut self, mutation: Mutation, now_ms: i64) {
        match mutation {
            Mutation::Put {
                key,
                value,
                ttl,
                write_ts,
            } => {
                let ts = match write_ts {
                    Some(ts) => ts,
                    None => self.next_write_ts(now_ms),
                };
                let row = self.rows.entry((key.cf, key.row)).or_default();
                if let Some(existing) = row.get(&key.column)
                    && existing.is_live(now_ms)
                    && existing.write_ts > ts
                {
                    return;
                }
                row.insert(
                    key.column,
                    StoredCell {
                        value,
                        write_ts: ts,
                        expires_at: ttl.map(|t| now_ms + t.as_millis() as i64),
                    },
                );
            }
            Mutation::Delete { key, write_ts } => {
                let row_key = (key.cf, key.row);
                let Some(row) = self.rows.get_mut(&row_key) else {
                    return;
                };
                let remove = match (row.get(&key.column), write_ts) {
                    (Some(_), None) => true,
                    (Some(cell), Some(ts)) => cell.write_ts <= ts,
                    (None, _) => false,
                };
                if remove {
                    row.remove(&key.column);
                }
                if row.is_empty() {
                    self.rows.remove(&row_key);
                }
            }
        }
    }

    fn purge_expired(&mut self, now_ms: i64) -> u64 {
        let mut purged = 0u64;
        self.rows.retain(|_, row| {
            let before = row.len();
            row.retain(|_, cell| cell.is_live(now_ms));
            purged += (before - row.len()) as u64;
            !row.is_empty()
        });
        purged
    }
}

/// Counters describing store activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub batches_applied: u64,
    pub groups_skipped: u64,
    pub condition_failures: u64,
    pub cells_expired: u64,
}

#[derive(Default)]
struct StatsCollector {
    batches_applied: AtomicU64,
    groups_skipped: AtomicU64,
    condition_failures: AtomicU64,
    cells_expired: AtomicU64,
}

pub struct MemoryColumnStore {
    table: Arc<Mutex<Table>>,
    clock: Arc<dyn Clock>,
    stats: Arc<StatsCollector>,
    _cleanup_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MemoryColumnStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            clock,
            stats: Arc::new(StatsCollector::default()),
            _cleanup_handle: None,
        }
    }

    /// Start a background task purging expired cells
    pub fn with_cleanup(mut self, interval_ms: u64) -> Self {
        let table = self.table.clone();
        let clock = self.clock.clone();
        let stats = self.stats.clone();

        let handle = tokio::spawn(async move {
            let mut interval = interval(Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                let purged = table.lock().purge_expired(clock.now_millis());
                if purged > 0 {
                    stats.cells_expired.fetch_add(purged, Ordering::Relaxed);
                    tracing::debug!(purged, "Purged expired cells");
                }
            }
        });

        self._cleanup_handle = Some(handle);
        self
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            batches_applied: self.stats.batches_applied.load(Ordering::Relaxed),
            groups_skipped: self.stats.groups_skipped.load(Ordering::Relaxed),
            condition_failures: self.stats.condition_failures.load(Ordering::Relaxed),
            cells_expired: self.stats.cells_expired.load(Ordering::Relaxed),
        }
    }

    fn to_cell(column: &str, stored: &StoredCell) -> Cell {
        Cell {
            column: column.to_string(),
            value: stored.value.clone(),
            write_ts: stored.write_ts,
        }
    }
}

impl Default for MemoryColumnStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryColumnStore {
    fn drop(&mut self) {
        if let Some(handle) = self._cleanup_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ColumnStore for MemoryColumnStore {
    async fn get(&self, cf: &str, row: &str, column: &str) -> Result<Option<Cell>, StoreError> {
        let now = self.clock.now_millis();
        let table = self.table.lock();
        Ok(table
            .live(&CellKey::new(cf, row, column), now)
            .map(|c| Self::to_cell(column, c)))
    }

    async fn get_many(
        &self,
        cf: &str,
        row: &str,
        columns: &[String],
    ) -> Result<Vec<Cell>, StoreError> {
        let now = self.clock.now_millis();
        let table = self.table.lock();
        let Some(cells) = table.rows.get(&(cf.to_string(), row.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(columns
            .iter()
            .filter_map(|col| {
                cells
                    .get(col)
                    .filter(|c| c.is_live(now))
                    .map(|c| Self::to_cell(col, c))
            })
            .collect())
    }

    async fn slice(
        &self,
        cf: &str,
        row: &str,
        range: &ColumnRange,
        limit: usize,
    ) -> Result<Vec<Cell>, StoreError> {
        if range.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_millis();
        let table = self.table.lock();
        let Some(cells) = table.rows.get(&(cf.to_string(), row.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(cells
            .range::<String, _>((range.start.clone(), range.end.clone()))
            .filter(|(_, c)| c.is_live(now))
            .take(limit)
            .map(|(col, c)| Self::to_cell(col, c))
            .collect())
    }

    async fn count(&self, cf: &str, row: &str) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let table = self.table.lock();
        Ok(table
            .rows
            .get(&(cf.to_string(), row.to_string()))
            .map(|cells| cells.values().filter(|c| c.is_live(now)).count())
            .unwrap_or(0))
    }

    async fn apply(&self, batch: WriteBatch) -> Result<BatchOutcome, StoreError> {
        let now = self.clock.now_millis();
        let mut table = self.table.lock();

        let outcome = match evaluate_guards(&batch, |key| Ok(table.live(key, now).is_some())) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.stats.condition_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        for (idx, group) in batch.groups.into_iter().enumerate() {
            if !outcome.was_applied(idx) {
                continue;
            }
            for mutation in group.mutations {
                table.apply(mutation, now);
            }
        }

        self.stats.batches_applied.fetch_add(1, Ordering::Relaxed);
        self.stats
            .groups_skipped
            .fetch_add(outcome.skipped.len() as u64, Ordering::Relaxed);
        Ok(outcome)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MutationGroup;
    use vigil_common::ManualClock;

    fn store() -> (MemoryColumnStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (MemoryColumnStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (store, _) = store();
        store
            .apply(MutationGroup::optional().with(Mutation::put("cf", "r", "c", b"v".to_vec())).into())
            .await
            .unwrap();
        let cell = store.get("cf", "r", "c").await.unwrap().unwrap();
        assert_eq!(cell.value, b"v");

        store
            .apply(MutationGroup::optional().with(Mutation::delete("cf", "r", "c")).into())
            .await
            .unwrap();
        assert!(store.get("cf", "r", "c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slice_is_ordered_and_limited() {
        let (store, _) = store();
        let mut group = MutationGroup::optional();
        for col in ["c", "a", "d", "b"] {
            group.push(Mutation::put("cf", "r", col, Vec::new()));
        }
        store.apply(group.into()).await.unwrap();

        let cells = store
            .slice("cf", "r", &ColumnRange::inclusive("b", "d"), 2)
            .await
            .unwrap();
        let cols: Vec<_> = cells.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(cols, vec!["b", "c"]);
        assert_eq!(store.count("cf", "r").await.unwrap(), 4);

        let empty = store
            .slice("cf", "r", &ColumnRange::inclusive("z", "a"), 10)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_required_guard_aborts_batch() {
        let (store, _) = store();
        let mut batch = WriteBatch::new();
        batch.add(MutationGroup::optional().with(Mutation::put("cf", "r", "x", Vec::new())));
        batch.add(MutationGroup::required().expect_exists("cf", "r", "missing"));
        let err = store.apply(batch).await.unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { group: 1, .. }));
        assert!(store.get("cf", "r", "x").await.unwrap().is_none());
        assert_eq!(store.stats().condition_failures, 1);
    }

    #[tokio::test]
    async fn test_optional_guard_skips_group() {
        let (store, _) = store();
        let mut batch = WriteBatch::new();
        batch.add(
            MutationGroup::optional()
                .expect_exists("cf", "r", "missing")
                .with(Mutation::put("cf", "r", "skipped", Vec::new())),
        );
        batch.add(MutationGroup::optional().with(Mutation::put("cf", "r", "kept", Vec::new())));
        let outcome = store.apply(batch).await.unwrap();
        assert_eq!(outcome.skipped, vec![0]);
        assert!(store.get("cf", "r", "skipped").await.unwrap().is_none());
        assert!(store.get("cf", "r", "kept").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let (store, _) = store();
        let put = |v: &[u8], ts: i64| -> WriteBatch {
            MutationGroup::optional()
                .with(Mutation::put("meta", "acc", "wm", v.to_vec()).with_write_ts(ts))
                .into()
        };
        store.apply(put(b"new", 200)).await.unwrap();
        store.apply(put(b"old", 100)).await.unwrap();
        let cell = store.get("meta", "acc", "wm").await.unwrap().unwrap();
        assert_eq!(cell.value, b"new");
        assert_eq!(cell.write_ts, 200);

        // A delete stamped before the write leaves it alone
        store
            .apply(
                MutationGroup::optional()
                    .with(Mutation::delete("meta", "acc", "wm").with_write_ts(150))
                    .into(),
            )
            .await
            .unwrap();
        assert!(store.get("meta", "acc", "wm").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (store, clock) = store();
        store
            .apply(
                MutationGroup::optional()
                    .with(Mutation::put("ev", "r", "c", Vec::new()).with_ttl(Duration::from_secs(10)))
                    .into(),
            )
            .await
            .unwrap();
        assert!(store.get("ev", "r", "c").await.unwrap().is_some());
        clock.advance(Duration::from_secs(10));
        assert!(store.get("ev", "r", "c").await.unwrap().is_none());
        assert_eq!(store.count("ev", "r").await.unwrap(), 0);
        assert_eq!(store.table.lock().purge_expired(clock.now_millis()), 1);
    }

    #[tokio::test]
    async fn test_concurrent_guarded_deletes_apply_once() {
        let (store, _) = store();
        let store = Arc::new(store);
        store
            .apply(MutationGroup::optional().with(Mutation::put("m", "a", "t", Vec::new())).into())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let outcome = store
                    .apply(
                        MutationGroup::optional()
                            .expect_exists("m", "a", "t")
                            .with(Mutation::delete("m", "a", "t"))
                            .into(),
                    )
                    .await
                    .unwrap();
                outcome.was_applied(0)
            }));
        }
        let mut applied = 0;
        for h in handles {
            if h.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }
}
