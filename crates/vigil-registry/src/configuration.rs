//! Per-account configuration values
//!
//! Ids are slash separated paths. Every change appends an event so clients
//! polling the ledger see configuration updates next to service changes.

use vigil_common::validation::{
    split_namespace, validate_configuration_id, validate_configuration_value,
};
use vigil_common::{LIMIT_CONFIGURATION_VALUES, Token};
use vigil_persistence::{ColumnRange, Mutation, MutationGroup, StoreError};

use crate::context::AccountContext;
use crate::error::{RegistryError, Result};
use crate::model::{ConfigurationValue, Event, EventType, Page, Pagination, schema};
use crate::registry::Registry;
use crate::service::event_mutation;

impl Registry {
    async fn read_configuration_value(
        &self,
        ctx: &AccountContext,
        id: &str,
    ) -> Result<Option<ConfigurationValue>> {
        match self
            .store
            .get(schema::CONFIGURATION_VALUES, ctx.account_id(), id)
            .await?
        {
            Some(cell) => Ok(Some(cell.decode()?)),
            None => Ok(None),
        }
    }

    /// Create or replace a value
    pub async fn put_configuration_value(
        &self,
        ctx: &AccountContext,
        id: &str,
        value: &str,
    ) -> Result<ConfigurationValue> {
        validate_configuration_id(id)?;
        validate_configuration_value(value)?;
        let account_id = ctx.account_id();

        let old = self.read_configuration_value(ctx, id).await?;
        if old.is_none() {
            self.check_limit(ctx, LIMIT_CONFIGURATION_VALUES).await?;
        }

        let now = self.clock.now_millis();
        let updated = ConfigurationValue {
            id: id.to_string(),
            value: value.to_string(),
            last_modified: now,
        };
        let event = Event {
            id: Token::new(now),
            event_type: EventType::ConfigurationValueUpdate,
            timestamp: now,
            payload: serde_json::json!({
                "id": id,
                "old_value": old.as_ref().map(|v| v.value.as_str()),
                "new_value": value,
            }),
        };
        let group = MutationGroup::required()
            .with(Mutation::put_json(
                schema::CONFIGURATION_VALUES,
                account_id,
                id,
                &updated,
            )?)
            .with(event_mutation(account_id, &event)?);
        self.store.apply(group.into()).await?;

        self.touch_activity(account_id);
        tracing::info!(account_id, txn_id = %ctx.txn_id, id, "Configuration value updated");
        Ok(updated)
    }

    pub async fn remove_configuration_value(&self, ctx: &AccountContext, id: &str) -> Result<()> {
        let account_id = ctx.account_id();
        let old = self
            .read_configuration_value(ctx, id)
            .await?
            .ok_or_else(|| RegistryError::not_found("configuration value", id))?;

        let now = self.clock.now_millis();
        let event = Event {
            id: Token::new(now),
            event_type: EventType::ConfigurationValueRemove,
            timestamp: now,
            payload: serde_json::json!({ "id": id, "old_value": old.value }),
        };
        let group = MutationGroup::required()
            .expect_exists(schema::CONFIGURATION_VALUES, account_id, id)
            .with(Mutation::delete(schema::CONFIGURATION_VALUES, account_id, id))
            .with(event_mutation(account_id, &event)?);
        match self.store.apply(group.into()).await {
            Ok(_) => {}
            Err(StoreError::ConditionFailed { .. }) => {
                return Err(RegistryError::not_found("configuration value", id));
            }
            Err(e) => return Err(e.into()),
        }

        self.touch_activity(account_id);
        tracing::info!(account_id, txn_id = %ctx.txn_id, id, "Configuration value removed");
        Ok(())
    }

    pub async fn get_configuration_value(
        &self,
        ctx: &AccountContext,
        id: &str,
    ) -> Result<ConfigurationValue> {
        self.read_configuration_value(ctx, id)
            .await?
            .ok_or_else(|| RegistryError::not_found("configuration value", id))
    }

    pub async fn list_configuration_values(
        &self,
        ctx: &AccountContext,
        pagination: &Pagination,
    ) -> Result<Page<ConfigurationValue>> {
        let mut range = ColumnRange::all();
        if let Some(marker) = &pagination.marker {
            range = range.start_after(marker.clone());
        }
        let values = self
            .store
            .slice(
                schema::CONFIGURATION_VALUES,
                ctx.account_id(),
                &range,
                pagination.limit + 1,
            )
            .await?
            .iter()
            .map(|c| c.decode::<ConfigurationValue>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Page::from_overfetch(values, pagination, |v| v.id.clone()))
    }

    /// Values whose namespace is exactly `namespace`, ordered by id
    pub async fn configuration_values_for_namespace(
        &self,
        ctx: &AccountContext,
        namespace: &str,
    ) -> Result<Vec<ConfigurationValue>> {
        let (namespace, _) = split_namespace(&format!("{}/", namespace.trim_end_matches('/')));
        // Root-level ids may lack a leading slash, so the root scans the whole row
        let range = if namespace == "/" {
            ColumnRange::all()
        } else {
            ColumnRange::prefix(&format!("{namespace}/"))
        };
        let cells = self
            .store
            .slice(schema::CONFIGURATION_VALUES, ctx.account_id(), &range, usize::MAX)
            .await?;
        let mut values = Vec::new();
        for cell in &cells {
            if split_namespace(&cell.column).0 == namespace {
                values.push(cell.decode::<ConfigurationValue>()?);
            }
        }
        Ok(values)
    }
}
