//! Column store data model
//!
//! Records are addressed by `(column family, row, column)`. Within a row,
//! columns are kept in byte order so time-ordered token columns can be range
//! scanned. Writes are grouped into a [`WriteBatch`] of [`MutationGroup`]s,
//! each carrying its own guards.

use std::fmt::{Display, Formatter};
use std::ops::Bound;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("condition failed in group {group}: {guard}")]
    ConditionFailed { group: usize, guard: String },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Internal(String),
}

/// A live cell read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub column: String,
    pub value: Vec<u8>,
    /// Write timestamp in microseconds
    pub write_ts: i64,
}

impl Cell {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

/// Address of a single cell
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    pub cf: String,
    pub row: String,
    pub column: String,
}

impl CellKey {
    pub fn new(cf: &str, row: &str, column: &str) -> Self {
        Self {
            cf: cf.to_string(),
            row: row.to_string(),
            column: column.to_string(),
        }
    }
}

impl Display for CellKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}][{}]", self.cf, self.row, self.column)
    }
}

/// Precondition evaluated against the state before the batch is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    Exists(CellKey),
    Absent(CellKey),
}

impl Guard {
    pub fn key(&self) -> &CellKey {
        match self {
            Guard::Exists(k) | Guard::Absent(k) => k,
        }
    }

    pub fn holds(&self, present: bool) -> bool {
        match self {
            Guard::Exists(_) => present,
            Guard::Absent(_) => !present,
        }
    }
}

impl Display for Guard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Guard::Exists(k) => write!(f, "{k} exists"),
            Guard::Absent(k) => write!(f, "{k} absent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put {
        key: CellKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
        /// Explicit write timestamp in microseconds; the store assigns one when absent
        write_ts: Option<i64>,
    },
    Delete {
        key: CellKey,
        /// Only cells written at or before this timestamp are removed
        write_ts: Option<i64>,
    },
}

impl Mutation {
    pub fn put(cf: &str, row: &str, column: &str, value: Vec<u8>) -> Self {
        Mutation::Put {
            key: CellKey::new(cf, row, column),
            value,
            ttl: None,
            write_ts: None,
        }
    }

    pub fn put_json<T: Serialize>(
        cf: &str,
        row: &str,
        column: &str,
        value: &T,
    ) -> Result<Self, StoreError> {
        Ok(Self::put(cf, row, column, encode(value)?))
    }

    pub fn delete(cf: &str, row: &str, column: &str) -> Self {
        Mutation::Delete {
            key: CellKey::new(cf, row, column),
            write_ts: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        if let Mutation::Put { ttl: t, .. } = &mut self {
            *t = Some(ttl);
        }
        self
    }

    pub fn with_write_ts(mut self, ts: i64) -> Self {
        match &mut self {
            Mutation::Put { write_ts, .. } | Mutation::Delete { write_ts, .. } => {
                *write_ts = Some(ts)
            }
        }
        self
    }

    pub fn key(&self) -> &CellKey {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key, .. } => key,
        }
    }
}

/// Mutations applied together or not at all
///
/// A required group whose guards fail aborts the whole batch. An optional
/// group whose guards fail is skipped while the rest of the batch applies.
#[derive(Debug, Clone, Default)]
pub struct MutationGroup {
    pub required: bool,
    pub guards: Vec<Guard>,
    pub mutations: Vec<Mutation>,
}

impl MutationGroup {
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    pub fn optional() -> Self {
        Self::default()
    }

    pub fn expect_exists(mut self, cf: &str, row: &str, column: &str) -> Self {
        self.guards.push(Guard::Exists(CellKey::new(cf, row, column)));
        self
    }

    pub fn expect_absent(mut self, cf: &str, row: &str, column: &str) -> Self {
        self.guards.push(Guard::Absent(CellKey::new(cf, row, column)));
        self
    }

    pub fn push(&mut self, mutation: Mutation) -> &mut Self {
        self.mutations.push(mutation);
        self
    }

    pub fn with(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub groups: Vec<MutationGroup>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, group: MutationGroup) -> usize {
        self.groups.push(group);
        self.groups.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.mutations.is_empty())
    }
}

impl From<MutationGroup> for WriteBatch {
    fn from(group: MutationGroup) -> Self {
        Self {
            groups: vec![group],
        }
    }
}

/// Which groups of a batch were applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: Vec<usize>,
    pub skipped: Vec<usize>,
}

impl BatchOutcome {
    pub fn was_applied(&self, group: usize) -> bool {
        self.applied.contains(&group)
    }
}

/// Column range within a row, bounds on column names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRange {
    pub start: Bound<String>,
    pub end: Bound<String>,
}

impl ColumnRange {
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    pub fn inclusive(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Bound::Included(start.into()),
            end: Bound::Included(end.into()),
        }
    }

    pub fn prefix(prefix: &str) -> Self {
        // '\u{10FFFF}' sorts after every valid column suffix
        Self::inclusive(prefix, format!("{prefix}\u{10FFFF}"))
    }

    pub fn start_after(mut self, column: impl Into<String>) -> Self {
        self.start = Bound::Excluded(column.into());
        self
    }

    /// True when no column can fall inside the range.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(a), Bound::Included(b)) => a > b,
            (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
                a >= b
            }
            _ => false,
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => column >= s.as_str(),
            Bound::Excluded(s) => column > s.as_str(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => column <= e.as_str(),
            Bound::Excluded(e) => column < e.as_str(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }
}

/// Decide which groups of `batch` apply, given a presence probe that reads the
/// pre-batch state.
pub(crate) fn evaluate_guards<F>(batch: &WriteBatch, mut present: F) -> Result<BatchOutcome, StoreError>
where
    F: FnMut(&CellKey) -> Result<bool, StoreError>,
{
    let mut outcome = BatchOutcome::default();
    for (idx, group) in batch.groups.iter().enumerate() {
        let mut failed = None;
        for guard in &group.guards {
            if !guard.holds(present(guard.key())?) {
                failed = Some(guard);
                break;
            }
        }
        match failed {
            Some(guard) if group.required => {
                return Err(StoreError::ConditionFailed {
                    group: idx,
                    guard: guard.to_string(),
                });
            }
            Some(_) => outcome.skipped.push(idx),
            None => outcome.applied.push(idx),
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_guards() {
        let mut batch = WriteBatch::new();
        batch.add(MutationGroup::optional().expect_exists("m", "a", "gone"));
        batch.add(MutationGroup::optional().expect_absent("m", "a", "gone"));
        let outcome = evaluate_guards(&batch, |_| Ok(false)).unwrap();
        assert_eq!(outcome.applied, vec![1]);
        assert_eq!(outcome.skipped, vec![0]);

        batch.add(MutationGroup::required().expect_exists("m", "a", "gone"));
        let err = evaluate_guards(&batch, |_| Ok(false)).unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { group: 2, .. }));
    }

    #[test]
    fn test_range_emptiness() {
        assert!(!ColumnRange::inclusive("a", "a").is_empty());
        assert!(ColumnRange::inclusive("b", "a").is_empty());
        assert!(ColumnRange::inclusive("a", "a").start_after("a").is_empty());
        assert!(!ColumnRange::all().is_empty());
    }

    #[test]
    fn test_range_contains() {
        let r = ColumnRange::inclusive("b", "d").start_after("b");
        assert!(!r.contains("b"));
        assert!(r.contains("c"));
        assert!(r.contains("d"));
        assert!(!r.contains("e"));
        assert!(ColumnRange::prefix("db:").contains("db:api"));
        assert!(!ColumnRange::prefix("db:").contains("dc:api"));
    }

    #[test]
    fn test_group_builder() {
        let group = MutationGroup::required()
            .expect_absent("services", "acc", "api")
            .with(Mutation::delete("heartbeat_markers", "acc", "t1").with_write_ts(7));
        assert!(group.required);
        assert_eq!(group.guards.len(), 1);
        assert_eq!(
            group.mutations[0],
            Mutation::Delete {
                key: CellKey::new("heartbeat_markers", "acc", "t1"),
                write_ts: Some(7)
            }
        );
    }
}
