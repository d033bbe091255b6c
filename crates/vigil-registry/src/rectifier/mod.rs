//! Rectification: turning missed heartbeats into timeout events
//!
//! Each account keeps a watermark token. Everything at or before it has been
//! rectified. A pass scans heartbeat markers between the watermark and
//! `now - grace`; every marker found belongs to a service that missed its
//! deadline. The pass then commits one batch that:
//! - records a `service.timeout` event per dead service, keyed by the marker token
//! - deletes the marker, the service and its satellite records
//! - advances the watermark to the cutoff
//!
//! Each marker's changes are guarded by the marker still existing, so
//! concurrent passes over the same range converge on one event per service.

pub mod scheduler;
pub mod settings;
pub mod shard;

use std::collections::HashMap;
use std::time::Instant;

use vigil_common::Token;
use vigil_persistence::{ColumnRange, Mutation, MutationGroup, WriteBatch};

use crate::context::AccountContext;
use crate::error::{RegistryError, Result};
use crate::model::{Event, EventType, HeartbeatMarker, ServiceRecord, schema};
use crate::registry::{Registry, watermark_mutation};
use crate::service::{event_mutation, service_deletions};

pub use scheduler::{PassReport, Rectifier};
pub use settings::{RectifierSettings, SettingsHandle};
pub use shard::{ALL_SHARDS, compute_shard, parse_shards};

/// What one rectification pass over an account did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RectifyReport {
    /// Watermark before the pass
    pub from: Token,
    /// Watermark after the pass
    pub to: Token,
    /// Services whose timeout this pass recorded, in deadline order
    pub timed_out: Vec<String>,
    /// Markers another writer removed first
    pub skipped: usize,
}

struct Overdue {
    token: Token,
    service_id: String,
}

impl Registry {
    /// Rectify the account up to `now - grace_millis`.
    ///
    /// Returns `ShortCircuit` when the watermark is already at or past the
    /// cutoff. On any other error the watermark stays put and the same range
    /// is retried by the next pass.
    pub async fn rectify(&self, ctx: &AccountContext, grace_millis: i64) -> Result<RectifyReport> {
        let started = Instant::now();
        let account_id = ctx.account_id();
        let from = self.get_metadata(ctx).await?.last_rectification;
        let cutoff = self.clock.now_millis() - grace_millis;
        if from.timestamp_millis() >= cutoff {
            return Err(RegistryError::ShortCircuit);
        }
        let to = Token::high(cutoff);

        let overdue = self.scan_overdue(account_id, from, to).await?;
        let service_ids: Vec<String> = overdue.iter().map(|m| m.service_id.clone()).collect();
        let (records, pointers) = tokio::try_join!(
            self.store.get_many(schema::SERVICES, account_id, &service_ids),
            self.store
                .get_many(schema::SERVICE_MARKERS, account_id, &service_ids),
        )?;
        let records = records
            .iter()
            .map(|c| Ok((c.column.clone(), c.decode::<ServiceRecord>()?)))
            .collect::<Result<HashMap<_, _>>>()?;
        let pointers = pointers
            .iter()
            .map(|c| Ok((c.column.clone(), c.decode::<Token>()?)))
            .collect::<Result<HashMap<_, _>>>()?;

        let mut batch = WriteBatch::new();
        let mut staged = Vec::new();
        for marker in &overdue {
            let column = marker.token.to_string();
            let mut group = MutationGroup::optional()
                .expect_exists(schema::HEARTBEAT_MARKERS, account_id, &column)
                .with(Mutation::delete(schema::HEARTBEAT_MARKERS, account_id, &column));

            // A marker the service no longer points at is a leftover; drop it alone
            let current = pointers.get(&marker.service_id) == Some(&marker.token);
            if let (true, Some(record)) = (current, records.get(&marker.service_id)) {
                let event = Event {
                    id: marker.token,
                    event_type: EventType::ServiceTimeout,
                    timestamp: marker.token.timestamp_millis(),
                    payload: record.snapshot(),
                };
                group = group.expect_exists(schema::SERVICES, account_id, &record.id);
                group.push(event_mutation(account_id, &event)?);
                for mutation in service_deletions(account_id, record) {
                    group.push(mutation);
                }
                staged.push(Some((batch.add(group), marker.service_id.clone())));
            } else {
                batch.add(group);
                staged.push(None);
            }
        }
        batch.add(MutationGroup::required().with(watermark_mutation(account_id, to)?));

        let outcome = self.store.apply(batch).await?;
        let timed_out: Vec<String> = staged
            .into_iter()
            .flatten()
            .filter(|(idx, _)| outcome.was_applied(*idx))
            .map(|(_, id)| id)
            .collect();

        metrics::histogram!("vigil_rectify_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("vigil_services_timed_out_total").increment(timed_out.len() as u64);
        if !timed_out.is_empty() {
            tracing::info!(
                account_id,
                txn_id = %ctx.txn_id,
                count = timed_out.len(),
                services = ?timed_out,
                "Services timed out"
            );
        }
        tracing::debug!(account_id, from = %from, to = %to, "Rectified");

        Ok(RectifyReport {
            from,
            to,
            timed_out,
            skipped: outcome.skipped.len(),
        })
    }

    /// Markers strictly after `from` and at or before `to`, in token order
    async fn scan_overdue(&self, account_id: &str, from: Token, to: Token) -> Result<Vec<Overdue>> {
        let page_size = self.config.rectify_batch_size.max(1);
        let end = to.to_string();
        let mut range = ColumnRange::inclusive(from.to_string(), end.clone()).start_after(from.to_string());
        let mut overdue = Vec::new();
        loop {
            let cells = self
                .store
                .slice(schema::HEARTBEAT_MARKERS, account_id, &range, page_size)
                .await?;
            for cell in &cells {
                let token: Token = cell.column.parse()?;
                let marker: HeartbeatMarker = cell.decode()?;
                overdue.push(Overdue {
                    token,
                    service_id: marker.service_id,
                });
            }
            match cells.last() {
                Some(last) if cells.len() == page_size => {
                    range = ColumnRange::inclusive(last.column.clone(), end.clone())
                        .start_after(last.column.clone());
                }
                _ => break,
            }
        }
        Ok(overdue)
    }
}
