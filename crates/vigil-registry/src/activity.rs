//! Account activity index
//!
//! One row per shard, one column per account, valued with the time of the
//! account's last service mutation. Writes are stamped with that time so the
//! newest update wins regardless of arrival order. The sweep scheduler reads
//! it to find accounts worth rectifying.

use std::sync::Arc;

use vigil_persistence::{ColumnRange, ColumnStore, Mutation, MutationGroup};

use crate::error::Result;
use crate::model::schema;
use crate::rectifier::shard::compute_shard;
use crate::registry::Registry;

const ACTIVITY_SCAN_BATCH: usize = 1000;

/// An account with its last recorded activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountActivity {
    pub account_id: String,
    /// Epoch milliseconds
    pub last_update: i64,
}

pub(crate) async fn write_activity(
    store: Arc<dyn ColumnStore>,
    shard: u32,
    account_id: String,
    timestamp: i64,
) -> Result<()> {
    store
        .apply(
            MutationGroup::optional()
                .with(
                    Mutation::put_json(
                        schema::ACCOUNT_ACTIVITY,
                        &shard.to_string(),
                        &account_id,
                        &timestamp,
                    )?
                    .with_write_ts(timestamp * 1000),
                )
                .into(),
        )
        .await?;
    Ok(())
}

impl Registry {
    /// Record activity now
    pub async fn update_activity(&self, account_id: &str) -> Result<()> {
        write_activity(
            self.store.clone(),
            compute_shard(account_id, self.config.max_shards),
            account_id.to_string(),
            self.clock.now_millis(),
        )
        .await
    }

    /// Queue an activity update without waiting for it
    pub(crate) fn touch_activity(&self, account_id: &str) {
        self.background.submit(
            "account_activity",
            write_activity(
                self.store.clone(),
                compute_shard(account_id, self.config.max_shards),
                account_id.to_string(),
                self.clock.now_millis(),
            ),
        );
    }

    /// Last recorded activity, epoch milliseconds; 0 when never recorded
    pub async fn last_activity(&self, account_id: &str) -> Result<i64> {
        let shard = compute_shard(account_id, self.config.max_shards);
        match self
            .store
            .get(schema::ACCOUNT_ACTIVITY, &shard.to_string(), account_id)
            .await?
        {
            Some(cell) => Ok(cell.decode()?),
            None => Ok(0),
        }
    }

    pub async fn hard_remove_activity(&self, account_id: &str) -> Result<()> {
        let shard = compute_shard(account_id, self.config.max_shards);
        self.store
            .apply(
                MutationGroup::optional()
                    .with(Mutation::delete(
                        schema::ACCOUNT_ACTIVITY,
                        &shard.to_string(),
                        account_id,
                    ))
                    .into(),
            )
            .await?;
        Ok(())
    }

    /// Every account with recorded activity in the given shards
    pub async fn accounts_for_shards(&self, shards: &[u32]) -> Result<Vec<AccountActivity>> {
        let mut accounts = Vec::new();
        for shard in shards {
            let row = shard.to_string();
            let mut range = ColumnRange::all();
            loop {
                let cells = self
                    .store
                    .slice(schema::ACCOUNT_ACTIVITY, &row, &range, ACTIVITY_SCAN_BATCH)
                    .await?;
                let exhausted = cells.len() < ACTIVITY_SCAN_BATCH;
                for cell in &cells {
                    accounts.push(AccountActivity {
                        account_id: cell.column.clone(),
                        last_update: cell.decode()?,
                    });
                }
                match cells.last() {
                    Some(last) if !exhausted => range = ColumnRange::all().start_after(&last.column),
                    _ => break,
                }
            }
        }
        Ok(accounts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use std::time::Duration;
    use vigil_common::ManualClock;
    use vigil_consistency::MemoryCoordination;
    use vigil_persistence::MemoryColumnStore;

    fn registry(clock: Arc<ManualClock>) -> Registry {
        let store = Arc::new(MemoryColumnStore::with_clock(clock.clone()));
        let coordinator = Arc::new(MemoryCoordination::new().session());
        Registry::new(store, coordinator, RegistryConfig::default()).with_clock(clock)
    }

    #[tokio::test]
    async fn test_activity_roundtrip() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let registry = registry(clock.clone());

        assert_eq!(registry.last_activity("acc1").await.unwrap(), 0);
        registry.update_activity("acc1").await.unwrap();
        assert_eq!(
            registry.last_activity("acc1").await.unwrap(),
            1_700_000_000_000
        );

        let shard = compute_shard("acc1", 512);
        let found = registry.accounts_for_shards(&[shard]).await.unwrap();
        assert_eq!(
            found,
            vec![AccountActivity {
                account_id: "acc1".to_string(),
                last_update: 1_700_000_000_000
            }]
        );

        registry.hard_remove_activity("acc1").await.unwrap();
        assert_eq!(registry.last_activity("acc1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_older_update_does_not_win() {
        let clock = Arc::new(ManualClock::new(2_000_000));
        let registry = registry(clock.clone());
        registry.update_activity("acc1").await.unwrap();

        let shard = compute_shard("acc1", 512);
        write_activity(registry.store.clone(), shard, "acc1".to_string(), 1_000_000)
            .await
            .unwrap();
        assert_eq!(registry.last_activity("acc1").await.unwrap(), 2_000_000);

        clock.advance(Duration::from_secs(1));
        registry.touch_activity("acc1");
        registry.background.drain().await;
        assert_eq!(registry.last_activity("acc1").await.unwrap(), 2_001_000);
    }
}
