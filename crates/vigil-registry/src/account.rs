//! Account operations, per-account resource limits and usage counts
//!
//! Every account id is also a column of the single `account_index` row, which
//! is what listing and the usage totals page through.

use std::collections::BTreeMap;

use futures::StreamExt;
use futures::stream;
use vigil_common::{
    INITIAL_WATERMARK_LAG_MILLIS, LIMIT_CONFIGURATION_VALUES, LIMIT_SERVICES,
    PAGINATION_MAX_LIMIT, Token, ValidationError,
};
use vigil_persistence::{ColumnRange, Mutation, MutationGroup, StoreError};

use crate::context::AccountContext;
use crate::error::{RegistryError, Result};
use crate::model::{Account, AccountUpdate, Page, Pagination, schema};
use crate::registry::{Registry, watermark_mutation};
use crate::rectifier::shard::compute_shard;

/// Column family holding the cells counted for a limited resource
fn resource_cf(resource: &str) -> Result<&'static str> {
    match resource {
        LIMIT_SERVICES => Ok(schema::SERVICES),
        LIMIT_CONFIGURATION_VALUES => Ok(schema::CONFIGURATION_VALUES),
        other => Err(ValidationError::new("resource", format!("unknown resource '{other}'")).into()),
    }
}

/// Object counts summed over every account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub accounts: u64,
    pub services: u64,
    pub configuration_values: u64,
    /// Accounts whose counts could not be read
    pub failed: u64,
}

impl UsageTotals {
    /// Publish the totals as gauges
    pub fn record(&self) {
        metrics::gauge!("vigil_usage_accounts").set(self.accounts as f64);
        metrics::gauge!("vigil_usage_services").set(self.services as f64);
        metrics::gauge!("vigil_usage_configuration_values").set(self.configuration_values as f64);
    }
}

impl Registry {
    /// Create an account. Its watermark starts two hours in the past.
    pub async fn create_account(
        &self,
        id: &str,
        limits: Option<BTreeMap<String, u64>>,
    ) -> Result<Account> {
        if id.is_empty() || id.contains(['/', '\0']) {
            return Err(ValidationError::new("id", "account id must be a non-empty name").into());
        }
        let now = self.clock.now_millis();
        let account = Account {
            id: id.to_string(),
            created_at: now,
            limits: limits.unwrap_or_else(Account::default_limits),
            metadata: BTreeMap::new(),
        };

        let group = MutationGroup::required()
            .expect_absent(schema::ACCOUNTS, id, schema::ACCOUNT_COLUMN)
            .with(Mutation::put_json(
                schema::ACCOUNTS,
                id,
                schema::ACCOUNT_COLUMN,
                &account,
            )?)
            .with(watermark_mutation(
                id,
                Token::low(now - INITIAL_WATERMARK_LAG_MILLIS),
            )?)
            .with(Mutation::put(
                schema::ACCOUNT_INDEX,
                schema::ACCOUNT_INDEX_ROW,
                id,
                Vec::new(),
            ));

        match self.store.apply(group.into()).await {
            Ok(_) => {
                tracing::info!(account_id = id, "Account created");
                Ok(account)
            }
            Err(StoreError::ConditionFailed { .. }) => {
                Err(RegistryError::already_exists("account", id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_account(&self, id: &str) -> Result<Account> {
        match self
            .store
            .get(schema::ACCOUNTS, id, schema::ACCOUNT_COLUMN)
            .await?
        {
            Some(cell) => Ok(cell.decode()?),
            None => Err(RegistryError::not_found("account", id)),
        }
    }

    /// Apply `update` to an existing account and return the result
    pub async fn update_account(&self, id: &str, update: AccountUpdate) -> Result<Account> {
        update.validate()?;
        let mut account = self.get_account(id).await?;
        if let Some(limits) = update.limits {
            account.limits.extend(limits);
        }
        if let Some(metadata) = update.metadata {
            account.metadata = metadata;
        }

        let group = MutationGroup::required()
            .expect_exists(schema::ACCOUNTS, id, schema::ACCOUNT_COLUMN)
            .with(Mutation::put_json(
                schema::ACCOUNTS,
                id,
                schema::ACCOUNT_COLUMN,
                &account,
            )?);
        match self.store.apply(group.into()).await {
            Ok(_) => {
                tracing::info!(account_id = id, "Account updated");
                Ok(account)
            }
            Err(StoreError::ConditionFailed { .. }) => Err(RegistryError::not_found("account", id)),
            Err(e) => Err(e.into()),
        }
    }

    /// One page of account ids in ascending order
    pub async fn list_account_ids(&self, pagination: &Pagination) -> Result<Page<String>> {
        let mut range = ColumnRange::all();
        if let Some(marker) = &pagination.marker {
            range = range.start_after(marker.clone());
        }
        let cells = self
            .store
            .slice(
                schema::ACCOUNT_INDEX,
                schema::ACCOUNT_INDEX_ROW,
                &range,
                pagination.limit + 1,
            )
            .await?;
        let ids = cells.into_iter().map(|c| c.column).collect();
        Ok(Page::from_overfetch(ids, pagination, |id: &String| id.clone()))
    }

    /// Every account id in ascending order
    pub async fn all_account_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut pagination = Pagination::new(None, Some(PAGINATION_MAX_LIMIT));
        loop {
            let page = self.list_account_ids(&pagination).await?;
            ids.extend(page.values);
            match page.metadata.next_marker {
                Some(next) => pagination.marker = Some(next),
                None => return Ok(ids),
            }
        }
    }

    /// Delete the account record, its metadata and its activity entry
    pub async fn remove_account(&self, id: &str) -> Result<()> {
        let group = MutationGroup::required()
            .expect_exists(schema::ACCOUNTS, id, schema::ACCOUNT_COLUMN)
            .with(Mutation::delete(schema::ACCOUNTS, id, schema::ACCOUNT_COLUMN))
            .with(Mutation::delete(
                schema::METADATA,
                id,
                schema::LAST_RECTIFICATION_COLUMN,
            ))
            .with(Mutation::delete(
                schema::ACCOUNT_ACTIVITY,
                &compute_shard(id, self.config.max_shards).to_string(),
                id,
            ))
            .with(Mutation::delete(
                schema::ACCOUNT_INDEX,
                schema::ACCOUNT_INDEX_ROW,
                id,
            ));
        match self.store.apply(group.into()).await {
            Ok(_) => {
                tracing::info!(account_id = id, "Account removed");
                Ok(())
            }
            Err(StoreError::ConditionFailed { .. }) => Err(RegistryError::not_found("account", id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Objects of `resource` the account currently holds
    pub async fn usage_count(&self, account_id: &str, resource: &str) -> Result<u64> {
        let cf = resource_cf(resource)?;
        Ok(self.store.count(cf, account_id).await? as u64)
    }

    /// Fail with `LimitReached` when the account already holds its limit of
    /// `resource`
    pub async fn check_limit(&self, ctx: &AccountContext, resource: &str) -> Result<()> {
        let Some(limit) = ctx.account.limit(resource) else {
            return Ok(());
        };
        let used = self.usage_count(ctx.account_id(), resource).await?;
        if used >= limit {
            tracing::debug!(
                account_id = ctx.account_id(),
                resource,
                used,
                limit,
                "Account limit reached"
            );
            return Err(RegistryError::LimitReached {
                resource: resource.to_string(),
                limit,
            });
        }
        Ok(())
    }

    /// Sum service and configuration value counts over every account.
    ///
    /// An account whose counts cannot be read is logged and counted in
    /// `failed`; only listing the accounts can fail the whole run.
    pub async fn usage_totals(&self, concurrency: usize) -> Result<UsageTotals> {
        let ids = self.all_account_ids().await?;
        let counts: Vec<Result<(u64, u64)>> = stream::iter(ids.iter().cloned())
            .map(|account_id| async move {
                let (services, values) = tokio::try_join!(
                    self.usage_count(&account_id, LIMIT_SERVICES),
                    self.usage_count(&account_id, LIMIT_CONFIGURATION_VALUES),
                )
                .inspect_err(|e| {
                    tracing::warn!(account_id = %account_id, error = %e, "Failed to count account usage")
                })?;
                Ok::<_, RegistryError>((services, values))
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut totals = UsageTotals {
            accounts: ids.len() as u64,
            ..Default::default()
        };
        for count in counts {
            match count {
                Ok((services, values)) => {
                    totals.services += services;
                    totals.configuration_values += values;
                }
                Err(_) => totals.failed += 1,
            }
        }
        tracing::info!(
            accounts = totals.accounts,
            services = totals.services,
            configuration_values = totals.configuration_values,
            failed = totals.failed,
            "Usage counted"
        );
        Ok(totals)
    }
}
