//! Service lifecycle and the heartbeat-token protocol
//!
//! A service is backed by four records in the account's rows:
//! - the service record itself
//! - one heartbeat marker whose token is the service's deadline
//! - a pointer from the service to its current marker token
//! - the last heartbeat time, used for `last_seen`
//!
//! Registration, heartbeats, updates and removals write these with guarded
//! batches so a racing rectification either sees the old state or none of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use vigil_common::{EVENT_TTL_SECS, LAST_HEARTBEAT_TTL_SECS, LIMIT_SERVICES, Token};
use vigil_consistency::lock_name;
use vigil_persistence::{ColumnRange, ColumnStore, Mutation, MutationGroup, StoreError};

use crate::context::AccountContext;
use crate::error::{RegistryError, Result};
use crate::model::{
    Event, EventType, HeartbeatMarker, Liveness, Page, Pagination, ReadOptions, Service,
    ServiceRecord, ServiceSpec, ServiceUpdate, TagEntry, schema,
};
use crate::registry::Registry;

const CREATE_LOCK_PREFIX: &str = "ops-create-service";

pub(crate) fn event_mutation(account_id: &str, event: &Event) -> Result<Mutation> {
    Ok(Mutation::put_json(
        schema::EVENTS,
        account_id,
        &event.id.to_string(),
        event,
    )?
    .with_ttl(Duration::from_secs(EVENT_TTL_SECS)))
}

/// Every cell holding `record`, the marker excepted
pub(crate) fn service_deletions(account_id: &str, record: &ServiceRecord) -> Vec<Mutation> {
    let mut mutations = vec![
        Mutation::delete(schema::SERVICES, account_id, &record.id),
        Mutation::delete(schema::LAST_HEARTBEATS, account_id, &record.id),
        Mutation::delete(schema::SERVICE_MARKERS, account_id, &record.id),
    ];
    mutations.extend(record.tags.iter().map(|tag| {
        Mutation::delete(
            schema::SERVICE_TAGS,
            account_id,
            &schema::tag_column(tag, &record.id),
        )
    }));
    mutations
}

fn tag_puts(account_id: &str, record: &ServiceRecord) -> Result<Vec<Mutation>> {
    record
        .tags
        .iter()
        .map(|tag| {
            Ok(Mutation::put_json(
                schema::SERVICE_TAGS,
                account_id,
                &schema::tag_column(tag, &record.id),
                &TagEntry {
                    tag: tag.clone(),
                    service_id: record.id.clone(),
                },
            )?)
        })
        .collect()
}

fn marker_puts(account_id: &str, service_id: &str, token: Token) -> Result<Vec<Mutation>> {
    Ok(vec![
        Mutation::put_json(
            schema::HEARTBEAT_MARKERS,
            account_id,
            &token.to_string(),
            &HeartbeatMarker {
                service_id: service_id.to_string(),
            },
        )?,
        Mutation::put_json(schema::SERVICE_MARKERS, account_id, service_id, &token)?,
    ])
}

async fn write_last_heartbeat(
    store: Arc<dyn ColumnStore>,
    account_id: String,
    service_id: String,
    timestamp: i64,
) -> Result<()> {
    // Only refresh a service that still exists
    store
        .apply(
            MutationGroup::optional()
                .expect_exists(schema::SERVICES, &account_id, &service_id)
                .with(
                    Mutation::put_json(
                        schema::LAST_HEARTBEATS,
                        &account_id,
                        &service_id,
                        &Some(timestamp),
                    )?
                    .with_ttl(Duration::from_secs(LAST_HEARTBEAT_TTL_SECS))
                    .with_write_ts(timestamp * 1000),
                )
                .into(),
        )
        .await?;
    Ok(())
}

impl Registry {
    /// Run rectification before a read, treating "nothing to do" as success
    pub(crate) async fn rectify_inline(&self, ctx: &AccountContext) -> Result<()> {
        match self.rectify(ctx, self.config.inline_grace_millis).await {
            Ok(_) | Err(RegistryError::ShortCircuit) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn read_record(&self, ctx: &AccountContext, service_id: &str) -> Result<Option<ServiceRecord>> {
        match self
            .store
            .get(schema::SERVICES, ctx.account_id(), service_id)
            .await?
        {
            Some(cell) => Ok(Some(cell.decode()?)),
            None => Ok(None),
        }
    }

    async fn current_marker(&self, ctx: &AccountContext, service_id: &str) -> Result<Option<Token>> {
        match self
            .store
            .get(schema::SERVICE_MARKERS, ctx.account_id(), service_id)
            .await?
        {
            Some(cell) => Ok(Some(cell.decode()?)),
            None => Ok(None),
        }
    }

    async fn last_seen_for(
        &self,
        ctx: &AccountContext,
        service_ids: &[String],
    ) -> Result<HashMap<String, Option<i64>>> {
        let cells = self
            .store
            .get_many(schema::LAST_HEARTBEATS, ctx.account_id(), service_ids)
            .await?;
        cells
            .into_iter()
            .map(|cell| Ok((cell.column.clone(), cell.decode::<Option<i64>>()?)))
            .collect()
    }

    async fn join_last_seen(
        &self,
        ctx: &AccountContext,
        records: Vec<ServiceRecord>,
    ) -> Result<Vec<Service>> {
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let last_seen = self.last_seen_for(ctx, &ids).await?;
        Ok(records
            .into_iter()
            .map(|r| {
                let seen = last_seen.get(&r.id).copied().flatten();
                Service::from_record(r, seen)
            })
            .collect())
    }

    /// Register a service and return it with its first heartbeat token.
    ///
    /// Serialized per `(account, service id)` by the distributed lock; the
    /// lock is released whether or not registration succeeds.
    pub async fn create_service(
        &self,
        ctx: &AccountContext,
        spec: ServiceSpec,
    ) -> Result<(Service, Token)> {
        spec.validate()?;
        let account_id = ctx.account_id();
        let name = lock_name(CREATE_LOCK_PREFIX, account_id, &spec.id);
        let guard = self.lock.acquire(&name).await?;

        let service_id = spec.id.clone();
        let result = self.create_locked(ctx, spec).await;

        if let Err(e) = guard.release().await {
            tracing::warn!(account_id, service_id = %service_id, error = %e, "Failed to release create lock");
        }

        let (service, token) = result?;
        self.touch_activity(account_id);
        metrics::counter!("vigil_services_registered_total").increment(1);
        tracing::info!(
            account_id,
            txn_id = %ctx.txn_id,
            service_id = %service.id,
            token = %token,
            "Service registered"
        );
        Ok((service, token))
    }

    async fn create_locked(
        &self,
        ctx: &AccountContext,
        spec: ServiceSpec,
    ) -> Result<(Service, Token)> {
        let account_id = ctx.account_id();
        self.rectify_inline(ctx).await?;
        if self.read_record(ctx, &spec.id).await?.is_some() {
            return Err(RegistryError::already_exists("service", spec.id));
        }
        self.check_limit(ctx, LIMIT_SERVICES).await?;

        let record = ServiceRecord::from(spec);
        let now = self.clock.now_millis();
        let token = Token::new(now + record.timeout_millis());
        let join = Event {
            id: Token::new(now),
            event_type: EventType::ServiceJoin,
            timestamp: now,
            payload: record.snapshot(),
        };

        let mut group = MutationGroup::required()
            .expect_absent(schema::SERVICES, account_id, &record.id)
            .with(Mutation::put_json(schema::SERVICES, account_id, &record.id, &record)?)
            .with(
                Mutation::put_json(schema::LAST_HEARTBEATS, account_id, &record.id, &None::<i64>)?
                    .with_ttl(Duration::from_secs(LAST_HEARTBEAT_TTL_SECS)),
            )
            .with(event_mutation(account_id, &join)?);
        for mutation in tag_puts(account_id, &record)?
            .into_iter()
            .chain(marker_puts(account_id, &record.id, token)?)
        {
            group.push(mutation);
        }

        match self.store.apply(group.into()).await {
            Ok(_) => Ok((Service::from_record(record, None), token)),
            Err(StoreError::ConditionFailed { .. }) => {
                Err(RegistryError::already_exists("service", record.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Accept a heartbeat presenting `token` and return the next token.
    ///
    /// Fails with `NotFound` when the service or the presented marker is gone,
    /// which tells the client to stop heartbeating.
    pub async fn heartbeat(
        &self,
        ctx: &AccountContext,
        service_id: &str,
        token: Token,
    ) -> Result<Token> {
        let account_id = ctx.account_id();
        let marker_column = token.to_string();
        let (record, marker) = tokio::join!(
            self.read_record(ctx, service_id),
            self.store
                .get(schema::HEARTBEAT_MARKERS, account_id, &marker_column)
        );
        let record = record?.ok_or_else(|| RegistryError::not_found("service", service_id))?;
        let marker: HeartbeatMarker = match marker? {
            Some(cell) => cell.decode()?,
            None => return Err(RegistryError::not_found("heartbeat marker", &marker_column)),
        };
        if marker.service_id != service_id {
            return Err(RegistryError::not_found("heartbeat marker", &marker_column));
        }

        let now = self.clock.now_millis();
        let next = Token::new(now + record.timeout_millis());
        let mut group = MutationGroup::required()
            .expect_exists(schema::HEARTBEAT_MARKERS, account_id, &marker_column)
            .expect_exists(schema::SERVICES, account_id, service_id)
            .with(Mutation::delete(
                schema::HEARTBEAT_MARKERS,
                account_id,
                &marker_column,
            ));
        for mutation in marker_puts(account_id, service_id, next)? {
            group.push(mutation);
        }

        match self.store.apply(group.into()).await {
            Ok(_) => {}
            Err(StoreError::ConditionFailed { .. }) => {
                tracing::debug!(account_id, service_id, token = %token, "Heartbeat lost race");
                return Err(RegistryError::not_found("heartbeat marker", marker_column));
            }
            Err(e) => return Err(e.into()),
        }

        self.background.submit(
            "last_heartbeat",
            write_last_heartbeat(
                self.store.clone(),
                account_id.to_string(),
                service_id.to_string(),
                now,
            ),
        );
        self.touch_activity(account_id);
        metrics::counter!("vigil_heartbeats_total").increment(1);
        tracing::debug!(account_id, service_id, token = %next, "Heartbeat accepted");
        Ok(next)
    }

    pub async fn update_service(
        &self,
        ctx: &AccountContext,
        service_id: &str,
        update: ServiceUpdate,
    ) -> Result<Service> {
        update.validate()?;
        self.rectify_inline(ctx).await?;
        let account_id = ctx.account_id();
        let old = self
            .read_record(ctx, service_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("service", service_id))?;
        let mut record = old.clone();
        record.apply(update);

        let mut group = MutationGroup::required()
            .expect_exists(schema::SERVICES, account_id, service_id)
            .with(Mutation::put_json(schema::SERVICES, account_id, service_id, &record)?);
        for tag in old.tags.iter().filter(|t| !record.tags.contains(t)) {
            group.push(Mutation::delete(
                schema::SERVICE_TAGS,
                account_id,
                &schema::tag_column(tag, service_id),
            ));
        }
        for mutation in tag_puts(account_id, &record)? {
            group.push(mutation);
        }

        match self.store.apply(group.into()).await {
            Ok(_) => {}
            Err(StoreError::ConditionFailed { .. }) => {
                return Err(RegistryError::not_found("service", service_id));
            }
            Err(e) => return Err(e.into()),
        }
        self.touch_activity(account_id);
        tracing::info!(account_id, txn_id = %ctx.txn_id, service_id, "Service updated");

        let last_seen = self.last_seen_for(ctx, &[record.id.clone()]).await?;
        let seen = last_seen.get(service_id).copied().flatten();
        Ok(Service::from_record(record, seen))
    }

    /// Remove a service, recording a `service.remove` event
    pub async fn remove_service(&self, ctx: &AccountContext, service_id: &str) -> Result<()> {
        self.rectify_inline(ctx).await?;
        let account_id = ctx.account_id();
        let record = self
            .read_record(ctx, service_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("service", service_id))?;
        let marker = self.current_marker(ctx, service_id).await?;

        let now = self.clock.now_millis();
        let event = Event {
            id: Token::new(now),
            event_type: EventType::ServiceRemove,
            timestamp: now,
            payload: record.snapshot(),
        };
        let mut group = MutationGroup::required()
            .expect_exists(schema::SERVICES, account_id, service_id)
            .with(event_mutation(account_id, &event)?);
        for mutation in service_deletions(account_id, &record) {
            group.push(mutation);
        }
        if let Some(token) = marker {
            group.push(Mutation::delete(
                schema::HEARTBEAT_MARKERS,
                account_id,
                &token.to_string(),
            ));
        }

        match self.store.apply(group.into()).await {
            Ok(_) => {}
            Err(StoreError::ConditionFailed { .. }) => {
                return Err(RegistryError::not_found("service", service_id));
            }
            Err(e) => return Err(e.into()),
        }
        self.touch_activity(account_id);
        metrics::counter!("vigil_services_removed_total").increment(1);
        tracing::info!(account_id, txn_id = %ctx.txn_id, service_id, "Service removed");
        Ok(())
    }

    pub async fn get_service(
        &self,
        ctx: &AccountContext,
        service_id: &str,
        options: ReadOptions,
    ) -> Result<Service> {
        if options.rectify {
            self.rectify_inline(ctx).await?;
        }
        let record = self
            .read_record(ctx, service_id)
            .await?
            .ok_or_else(|| RegistryError::not_found("service", service_id))?;
        let mut services = self.join_last_seen(ctx, vec![record]).await?;
        services
            .pop()
            .ok_or_else(|| RegistryError::not_found("service", service_id))
    }

    /// Page through the account's services ordered by id
    pub async fn list_services(
        &self,
        ctx: &AccountContext,
        pagination: &Pagination,
        options: ReadOptions,
    ) -> Result<Page<Service>> {
        if options.rectify {
            self.rectify_inline(ctx).await?;
        }
        let mut range = ColumnRange::all();
        if let Some(marker) = &pagination.marker {
            range = range.start_after(marker.clone());
        }
        let cells = self
            .store
            .slice(schema::SERVICES, ctx.account_id(), &range, pagination.limit + 1)
            .await?;
        let records = cells
            .iter()
            .map(|c| c.decode::<ServiceRecord>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let services = self.join_last_seen(ctx, records).await?;
        Ok(Page::from_overfetch(services, pagination, |s| s.id.clone()))
    }

    /// Services carrying `tag`, ordered by id
    pub async fn services_for_tag(
        &self,
        ctx: &AccountContext,
        tag: &str,
        options: ReadOptions,
    ) -> Result<Vec<Service>> {
        if options.rectify {
            self.rectify_inline(ctx).await?;
        }
        let account_id = ctx.account_id();
        let prefix = schema::tag_prefix(tag);
        let cells = self
            .store
            .slice(
                schema::SERVICE_TAGS,
                account_id,
                &ColumnRange::prefix(&prefix),
                usize::MAX,
            )
            .await?;
        let mut ids = Vec::with_capacity(cells.len());
        for cell in &cells {
            let entry: TagEntry = cell.decode()?;
            if entry.tag == tag {
                ids.push(entry.service_id);
            }
        }
        let records = self
            .store
            .get_many(schema::SERVICES, account_id, &ids)
            .await?
            .iter()
            .map(|c| c.decode::<ServiceRecord>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut services = self.join_last_seen(ctx, records).await?;
        services.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(services)
    }

    /// Liveness of a service as of now, without side effects
    pub async fn liveness(&self, ctx: &AccountContext, service_id: &str) -> Result<Liveness> {
        let metadata = self.get_metadata(ctx).await?;
        let marker = self.current_marker(ctx, service_id).await?;
        Ok(Liveness::derive(
            marker,
            self.clock.now_millis(),
            metadata.last_rectification,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::model::ServiceSpec;
    use vigil_common::ManualClock;
    use vigil_consistency::MemoryCoordination;
    use vigil_persistence::MemoryColumnStore;

    const T0: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_delayed_last_heartbeat_does_not_move_backwards() {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(MemoryColumnStore::with_clock(clock.clone()));
        let coordinator = Arc::new(MemoryCoordination::new().session());
        let registry =
            Registry::new(store, coordinator, RegistryConfig::default()).with_clock(clock.clone());
        registry.create_account("acc1", None).await.unwrap();
        let ctx = registry.context("acc1").await.unwrap();
        registry
            .create_service(&ctx, ServiceSpec::new("api", 30))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10));
        let newer = T0 + 8_000;
        let older = T0 + 2_000;
        for timestamp in [newer, older] {
            write_last_heartbeat(
                registry.store.clone(),
                "acc1".to_string(),
                "api".to_string(),
                timestamp,
            )
            .await
            .unwrap();
        }

        let cell = registry
            .store
            .get(schema::LAST_HEARTBEATS, "acc1", "api")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cell.decode::<Option<i64>>().unwrap(), Some(newer));
        assert_eq!(cell.write_ts, newer * 1000);
    }
}
