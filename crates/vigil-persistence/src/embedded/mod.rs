//! Embedded RocksDB column store
//!
//! Single-node persistent backend. All column families share the default
//! RocksDB column family; keys are `cf \0 row \0 column` so a row scan is a
//! prefix iteration. Values carry a 16 byte header:
//! - bytes 0..8: write timestamp (microseconds, big-endian)
//! - bytes 8..16: expiry in epoch milliseconds, `i64::MAX` for none
//!
//! Batches are serialized through a commit mutex so guard evaluation and the
//! RocksDB write happen as one step. Mutations inside a batch see the ones
//! before them, matching the in-memory backend.
//!
//! Expired cells are hidden on read and removed by `purge_expired`, which the
//! optional cleanup task runs periodically.

use std::collections::HashMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{DB, Direction, IteratorMode, Options};
use tokio::time::interval;
use vigil_common::{Clock, SystemClock};

use crate::model::{
    BatchOutcome, Cell, CellKey, ColumnRange, Mutation, StoreError, WriteBatch, evaluate_guards,
};
use crate::traits::ColumnStore;

const SEPARATOR: u8 = 0;
const HEADER_LEN: usize = 16;
const NO_EXPIRY: i64 = i64::MAX;

struct Decoded {
    write_ts: i64,
    expires_at: i64,
    payload: Vec<u8>,
}

fn row_prefix(cf: &str, row: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(cf.len() + row.len() + 2);
    key.extend_from_slice(cf.as_bytes());
    key.push(SEPARATOR);
    key.extend_from_slice(row.as_bytes());
    key.push(SEPARATOR);
    key
}

fn cell_key(key: &CellKey) -> Vec<u8> {
    let mut k = row_prefix(&key.cf, &key.row);
    k.extend_from_slice(key.column.as_bytes());
    k
}

fn encode_value(write_ts: i64, expires_at: i64, payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(HEADER_LEN + payload.len());
    v.extend_from_slice(&write_ts.to_be_bytes());
    v.extend_from_slice(&expires_at.to_be_bytes());
    v.extend_from_slice(payload);
    v
}

fn decode_value(raw: &[u8]) -> Result<Decoded, StoreError> {
    if raw.len() < HEADER_LEN {
        return Err(StoreError::Internal(format!(
            "corrupt cell: {} bytes",
            raw.len()
        )));
    }
    let mut ts = [0u8; 8];
    let mut exp = [0u8; 8];
    ts.copy_from_slice(&raw[0..8]);
    exp.copy_from_slice(&raw[8..16]);
    Ok(Decoded {
        write_ts: i64::from_be_bytes(ts),
        expires_at: i64::from_be_bytes(exp),
        payload: raw[HEADER_LEN..].to_vec(),
    })
}

fn rocks_err(e: rocksdb::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

pub struct RocksColumnStore {
    db: Arc<DB>,
    clock: Arc<dyn Clock>,
    commit: Arc<Mutex<i64>>,
    _cleanup_handle: Option<tokio::task::JoinHandle<()>>,
}

/// Delete every cell whose expiry has passed. Caller holds the commit lock.
fn purge_expired_cells(db: &DB, now_ms: i64) -> Result<usize, StoreError> {
    let mut wb = rocksdb::WriteBatch::default();
    let mut purged = 0usize;
    for item in db.iterator(IteratorMode::Start) {
        let (k, v) = item.map_err(rocks_err)?;
        if decode_value(&v)?.expires_at <= now_ms {
            wb.delete(&k);
            purged += 1;
        }
    }
    if purged > 0 {
        db.write(wb).map_err(rocks_err)?;
    }
    Ok(purged)
}

impl RocksColumnStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(rocks_err)?;
        tracing::info!("Opened embedded column store");
        Ok(Self {
            db: Arc::new(db),
            clock: Arc::new(SystemClock),
            commit: Arc::new(Mutex::new(0)),
            _cleanup_handle: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start a background task purging expired cells
    pub fn with_cleanup(mut self, interval_ms: u64) -> Self {
        let db = self.db.clone();
        let clock = self.clock.clone();
        let commit = self.commit.clone();

        let handle = tokio::spawn(async move {
            let mut interval = interval(Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                let _guard = commit.lock();
                match purge_expired_cells(&db, clock.now_millis()) {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "Purged expired cells"),
                    Err(e) => tracing::warn!(error = %e, "Expired cell purge failed"),
                }
            }
        });

        self._cleanup_handle = Some(handle);
        self
    }

    /// Physically remove expired cells, returning how many were deleted
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let _guard = self.commit.lock();
        purge_expired_cells(&self.db, self.clock.now_millis())
    }

    fn read(&self, key: &CellKey, now_ms: i64) -> Result<Option<Decoded>, StoreError> {
        match self.db.get(cell_key(key)).map_err(rocks_err)? {
            Some(raw) => {
                let d = decode_value(&raw)?;
                Ok((d.expires_at > now_ms).then_some(d))
            }
            None => Ok(None),
        }
    }

    /// Write timestamp of the live cell at `raw`, seeing writes staged earlier
    /// in the same batch
    fn staged_write_ts(
        &self,
        staged: &HashMap<Vec<u8>, Option<i64>>,
        raw: &[u8],
        key: &CellKey,
        now_ms: i64,
    ) -> Result<Option<i64>, StoreError> {
        match staged.get(raw) {
            Some(ts) => Ok(*ts),
            None => Ok(self.read(key, now_ms)?.map(|d| d.write_ts)),
        }
    }

    fn scan<F>(&self, cf: &str, row: &str, range: &ColumnRange, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(String, Decoded) -> bool,
    {
        let prefix = row_prefix(cf, row);
        let mut seek = prefix.clone();
        match &range.start {
            Bound::Included(s) | Bound::Excluded(s) => seek.extend_from_slice(s.as_bytes()),
            Bound::Unbounded => {}
        }
        let now = self.clock.now_millis();
        for item in self
            .db
            .iterator(IteratorMode::From(seek.as_slice(), Direction::Forward))
        {
            let (k, v) = item.map_err(rocks_err)?;
            if !k.starts_with(&prefix) {
                break;
            }
            let column = String::from_utf8_lossy(&k[prefix.len()..]).into_owned();
            if !range.contains(&column) {
                if matches!(range.start, Bound::Excluded(ref s) if *s == column) {
                    continue;
                }
                break;
            }
            let decoded = decode_value(&v)?;
            if decoded.expires_at <= now {
                continue;
            }
            if !visit(column, decoded) {
                break;
            }
        }
        Ok(())
    }
}

impl Drop for RocksColumnStore {
    fn drop(&mut self) {
        if let Some(handle) = self._cleanup_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ColumnStore for RocksColumnStore {
    async fn get(&self, cf: &str, row: &str, column: &str) -> Result<Option<Cell>, StoreError> {
        let now = self.clock.now_millis();
        Ok(self.read(&CellKey::new(cf, row, column), now)?.map(|d| Cell {
            column: column.to_string(),
            value: d.payload,
            write_ts: d.write_ts,
        }))
    }

    async fn get_many(
        &self,
        cf: &str,
        row: &str,
        columns: &[String],
    ) -> Result<Vec<Cell>, StoreError> {
        let mut cells = Vec::with_capacity(columns.len());
        for column in columns {
            if let Some(cell) = self.get(cf, row, column).await? {
                cells.push(cell);
            }
        }
        Ok(cells)
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
        let mut cells = Vec::new();
        self.scan(cf, row, range, |column, d| {
            cells.push(Cell {
                column,
                value: d.payload,
                write_ts: d.write_ts,
            });
            cells.len() < limit
        })?;
        Ok(cells)
    }

    async fn count(&self, cf: &str, row: &str) -> Result<usize, StoreError> {
        let mut n = 0usize;
        self.scan(cf, row, &ColumnRange::all(), |_, _| {
            n += 1;
            true
        })?;
        Ok(n)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<BatchOutcome, StoreError> {
        let mut last_ts = self.commit.lock();
        let now = self.clock.now_millis();

        let outcome = evaluate_guards(&batch, |key| Ok(self.read(key, now)?.is_some()))?;

        let mut wb = rocksdb::WriteBatch::default();
        let mut staged: HashMap<Vec<u8>, Option<i64>> = HashMap::new();
        for (idx, group) in batch.groups.into_iter().enumerate() {
            if !outcome.was_applied(idx) {
                continue;
            }
            for mutation in group.mutations {
                match mutation {
                    Mutation::Put {
                        key,
                        value,
                        ttl,
                        write_ts,
                    } => {
                        let ts = write_ts.unwrap_or_else(|| {
                            *last_ts = (now * 1000).max(*last_ts + 1);
                            *last_ts
                        });
                        let raw = cell_key(&key);
                        if let Some(existing) = self.staged_write_ts(&staged, &raw, &key, now)?
                            && existing > ts
                        {
                            continue;
                        }
                        let expires_at = ttl
                            .map(|t: Duration| now + t.as_millis() as i64)
                            .unwrap_or(NO_EXPIRY);
                        wb.put(&raw, encode_value(ts, expires_at, &value));
                        staged.insert(raw, (expires_at > now).then_some(ts));
                    }
                    Mutation::Delete { key, write_ts } => {
                        let raw = cell_key(&key);
                        let remove = match (self.staged_write_ts(&staged, &raw, &key, now)?, write_ts) {
                            (Some(_), None) => true,
                            (Some(existing), Some(ts)) => existing <= ts,
                            (None, _) => false,
                        };
                        if remove {
                            wb.delete(&raw);
                            staged.insert(raw, None);
                        }
                    }
                }
            }
        }

        self.db.write(wb).map_err(rocks_err)?;
        Ok(outcome)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.db
            .property_value("rocksdb.estimate-num-keys")
            .map(|_| ())
            .map_err(rocks_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MutationGroup;
    use vigil_common::ManualClock;

    #[tokio::test]
    async fn test_roundtrip_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksColumnStore::open(dir.path()).unwrap();

        let mut group = MutationGroup::optional();
        for col in ["b", "a", "c"] {
            group.push(Mutation::put("cf", "row", col, col.as_bytes().to_vec()));
        }
        group.push(Mutation::put("cf", "row2", "a", Vec::new()));
        store.apply(group.into()).await.unwrap();

        let cells = store
            .slice("cf", "row", &ColumnRange::all().start_after("a"), 10)
            .await
            .unwrap();
        let cols: Vec<_> = cells.iter().map(|c| c.column.as_str()).collect();
        assert_eq!(cols, vec!["b", "c"]);
        assert_eq!(store.count("cf", "row").await.unwrap(), 3);
        assert_eq!(store.get("cf", "row", "c").await.unwrap().unwrap().value, b"c");
    }

    #[tokio::test]
    async fn test_guards_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksColumnStore::open(dir.path()).unwrap();
            store
                .apply(
                    MutationGroup::required()
                        .expect_absent("services", "acc", "api")
                        .with(Mutation::put("services", "acc", "api", b"{}".to_vec()))
                        .into(),
                )
                .await
                .unwrap();
            let again = store
                .apply(
                    MutationGroup::required()
                        .expect_absent("services", "acc", "api")
                        .with(Mutation::put("services", "acc", "api", b"{}".to_vec()))
                        .into(),
                )
                .await;
            assert!(matches!(again, Err(StoreError::ConditionFailed { .. })));
        }
        let store = RocksColumnStore::open(dir.path()).unwrap();
        assert!(store.get("services", "acc", "api").await.unwrap().is_some());
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_sees_its_own_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksColumnStore::open(dir.path()).unwrap();

        let group = MutationGroup::optional()
            .with(Mutation::put("cf", "row", "gone", b"v".to_vec()))
            .with(Mutation::delete("cf", "row", "gone"))
            .with(Mutation::delete("cf", "row", "back"))
            .with(Mutation::put("cf", "row", "back", b"v".to_vec()))
            .with(Mutation::put("cf", "row", "lww", b"new".to_vec()).with_write_ts(20))
            .with(Mutation::put("cf", "row", "lww", b"old".to_vec()).with_write_ts(10));
        store.apply(group.into()).await.unwrap();

        assert!(store.get("cf", "row", "gone").await.unwrap().is_none());
        assert!(store.get("cf", "row", "back").await.unwrap().is_some());
        let lww = store.get("cf", "row", "lww").await.unwrap().unwrap();
        assert_eq!(lww.value, b"new");
        assert_eq!(lww.write_ts, 20);
    }

    #[tokio::test]
    async fn test_purge_expired_removes_cells() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = RocksColumnStore::open(dir.path())
            .unwrap()
            .with_clock(clock.clone());

        let group = MutationGroup::optional()
            .with(Mutation::put("events", "acc", "e1", b"{}".to_vec()).with_ttl(Duration::from_secs(1)))
            .with(Mutation::put("events", "acc", "e2", b"{}".to_vec()).with_ttl(Duration::from_secs(60)))
            .with(Mutation::put("services", "acc", "api", b"{}".to_vec()));
        store.apply(group.into()).await.unwrap();
        assert_eq!(store.purge_expired().unwrap(), 0);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.purge_expired().unwrap(), 1);
        let raw = cell_key(&CellKey::new("events", "acc", "e1"));
        assert!(store.db.get(raw).unwrap().is_none());
        assert_eq!(store.count("events", "acc").await.unwrap(), 1);
        assert!(store.get("services", "acc", "api").await.unwrap().is_some());

        clock.advance(Duration::from_secs(60));
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.purge_expired().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_task_purges() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = RocksColumnStore::open(dir.path())
            .unwrap()
            .with_clock(clock.clone())
            .with_cleanup(10);

        store
            .apply(
                MutationGroup::optional()
                    .with(Mutation::put("cf", "row", "c", Vec::new()).with_ttl(Duration::from_secs(1)))
                    .into(),
            )
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        let raw = cell_key(&CellKey::new("cf", "row", "c"));
        let purged = tokio::time::timeout(Duration::from_secs(5), async {
            while store.db.get(&raw).unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(purged.is_ok());
    }
}
