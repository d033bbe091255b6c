//! Background sweep over the shards this process owns
//!
//! Each pass reads the activity index of the owned shards, keeps the accounts
//! active within the conviction threshold, shuffles them and rectifies them
//! with bounded concurrency. Per-account failures are logged and retried by
//! the next pass, which then starts without pausing. Fatal errors end the
//! loop so a supervisor can restart the process.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use rand::Rng;
use rand::seq::SliceRandom;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::RectifyReport;
use super::settings::{RectifierSettings, SettingsHandle};
use crate::error::{RegistryError, Result};
use crate::registry::Registry;

/// Totals of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Accounts selected for the pass
    pub accounts: usize,
    pub rectified: usize,
    /// Accounts that were already up to date
    pub idle: usize,
    pub timed_out: usize,
    pub failed: usize,
}

pub struct Rectifier {
    registry: Arc<Registry>,
    settings: SettingsHandle,
}

impl Rectifier {
    pub fn new(registry: Arc<Registry>, settings: SettingsHandle) -> Self {
        Self { registry, settings }
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Accounts in the owned shards active within the conviction threshold
    pub async fn candidates(&self, settings: &RectifierSettings) -> Result<Vec<String>> {
        let now = self.registry.now_millis();
        let threshold = i64::try_from(settings.conviction_threshold.as_millis()).unwrap_or(i64::MAX);
        let accounts = self.registry.accounts_for_shards(&settings.shards).await?;
        Ok(accounts
            .into_iter()
            .filter(|a| now.saturating_sub(a.last_update) < threshold)
            .map(|a| a.account_id)
            .collect())
    }

    async fn rectify_account(&self, account_id: &str, grace_millis: i64) -> Result<RectifyReport> {
        let ctx = self.registry.context(account_id).await?;
        self.registry.rectify(&ctx, grace_millis).await
    }

    /// Run one pass over every candidate account.
    ///
    /// Only fatal errors are returned; other per-account errors are counted
    /// in the report.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let settings = self.settings.snapshot();
        let mut accounts = self.candidates(&settings).await?;
        accounts.shuffle(&mut rand::rng());
        metrics::gauge!("vigil_rectifier_candidate_accounts").set(accounts.len() as f64);

        let grace_millis = settings.grace_millis;
        let outcomes: Vec<(String, Result<RectifyReport>)> = stream::iter(accounts)
            .map(|account_id| async move {
                let outcome = self.rectify_account(&account_id, grace_millis).await;
                (account_id, outcome)
            })
            .buffer_unordered(settings.concurrency.max(1))
            .collect()
            .await;

        let mut report = PassReport {
            accounts: outcomes.len(),
            ..Default::default()
        };
        for (account_id, outcome) in outcomes {
            match outcome {
                Ok(r) => {
                    report.rectified += 1;
                    report.timed_out += r.timed_out.len();
                }
                Err(RegistryError::ShortCircuit) => report.idle += 1,
                Err(e) if e.is_fatal() => {
                    metrics::counter!("vigil_rectify_errors_total", "kind" => "fatal").increment(1);
                    return Err(e);
                }
                Err(e) if e.is_not_found() => {
                    debug!(account_id = %account_id, error = %e, "Account vanished during sweep");
                }
                Err(e) => {
                    report.failed += 1;
                    metrics::counter!("vigil_rectify_errors_total", "kind" => e.kind().as_str())
                        .increment(1);
                    warn!(account_id = %account_id, error = %e, "Rectification failed");
                }
            }
        }
        metrics::counter!("vigil_rectifier_passes_total").increment(1);
        debug!(
            accounts = report.accounts,
            rectified = report.rectified,
            timed_out = report.timed_out,
            failed = report.failed,
            "Sweep pass complete"
        );
        Ok(report)
    }

    fn pause_after(report: &PassReport, settings: &RectifierSettings) -> Duration {
        if report.failed > 0 {
            return Duration::ZERO;
        }
        let min = u64::try_from(settings.jitter_min.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(settings.jitter_max.as_millis()).unwrap_or(u64::MAX).max(min);
        settings.sleep + Duration::from_millis(rand::rng().random_range(min..=max))
    }

    /// Sweep until shutdown or a fatal error.
    ///
    /// A pass in progress always finishes; shutdown is observed between passes.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(
            shards = self.settings.snapshot().shards.len(),
            "Rectifier started"
        );
        loop {
            let report = self.run_pass().await?;
            let pause = Self::pause_after(&report, &self.settings.snapshot());
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Rectifier stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_is_zero_after_failures() {
        let settings = RectifierSettings::new(vec![0]);
        let failed = PassReport {
            failed: 1,
            ..Default::default()
        };
        assert_eq!(Rectifier::pause_after(&failed, &settings), Duration::ZERO);
    }

    #[test]
    fn test_pause_includes_jitter() {
        let settings = RectifierSettings::new(vec![0]);
        for _ in 0..20 {
            let pause = Rectifier::pause_after(&PassReport::default(), &settings);
            assert!(pause >= Duration::from_secs(6));
            assert!(pause <= Duration::from_secs(10));
        }
    }
}
