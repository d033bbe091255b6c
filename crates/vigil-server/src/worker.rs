//! Rectifier worker
//!
//! Wires the column store, the coordination session and the registry
//! together, then sweeps the configured shards until shutdown. With election
//! enabled the worker also joins the `rectifier` election and reports its
//! role; every worker sweeps its own shards regardless of role. Usage gauges
//! are refreshed on their own interval.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vigil_consistency::{Coordinator, Election, ElectionHandle, MemoryCoordination, Role};
use vigil_persistence::{ColumnStore, MemoryColumnStore};
use vigil_registry::{Rectifier, Registry, SettingsHandle, UsageTotals};

use crate::model::config::{
    Cli, Configuration, STORAGE_MODE_EMBEDDED, STORAGE_MODE_MEMORY,
};
use crate::startup::{ShutdownSignal, watch_reload, with_deadline};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the column store selected by `storage.mode`
pub fn build_store(configuration: &Configuration) -> anyhow::Result<Arc<dyn ColumnStore>> {
    match configuration.storage_mode().as_str() {
        STORAGE_MODE_MEMORY => {
            warn!("Using the in-memory column store, state is lost on exit");
            Ok(Arc::new(
                MemoryColumnStore::new().with_cleanup(configuration.storage_cleanup_interval_ms()),
            ))
        }
        STORAGE_MODE_EMBEDDED => open_embedded(configuration),
        other => bail!("unknown storage mode '{other}'"),
    }
}

#[cfg(feature = "embedded")]
fn open_embedded(configuration: &Configuration) -> anyhow::Result<Arc<dyn ColumnStore>> {
    let data_dir = configuration.data_dir();
    let store = vigil_persistence::RocksColumnStore::open(&data_dir)
        .with_context(|| format!("failed to open column store at {data_dir}"))?
        .with_cleanup(configuration.storage_cleanup_interval_ms());
    Ok(Arc::new(store))
}

#[cfg(not(feature = "embedded"))]
fn open_embedded(_configuration: &Configuration) -> anyhow::Result<Arc<dyn ColumnStore>> {
    bail!("storage mode 'embedded' requires the `embedded` feature")
}

pub struct Worker {
    registry: Arc<Registry>,
    coordinator: Arc<dyn Coordinator>,
    settings: SettingsHandle,
    election: Option<(String, String)>,
    usage: Option<(Duration, usize)>,
}

impl Worker {
    /// Build a worker with its own coordination ensemble
    pub async fn new(configuration: &Configuration) -> anyhow::Result<Self> {
        let store = build_store(configuration)?;
        let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordination::new().session());
        Self::with_parts(configuration, store, coordinator).await
    }

    pub async fn with_parts(
        configuration: &Configuration,
        store: Arc<dyn ColumnStore>,
        coordinator: Arc<dyn Coordinator>,
    ) -> anyhow::Result<Self> {
        store
            .health_check()
            .await
            .context("column store health check failed")?;

        let registry_config = configuration.registry_config()?;
        let settings = SettingsHandle::new(configuration.rectifier_settings()?);
        info!(
            max_shards = registry_config.max_shards,
            owned_shards = settings.snapshot().shards.len(),
            "Worker configured"
        );

        let registry = Arc::new(Registry::new(store, coordinator.clone(), registry_config));
        let election = configuration
            .elect()
            .then(|| (configuration.election_name(), configuration.participant()));
        let usage = configuration
            .usage_report_interval()
            .map(|interval| (interval, configuration.usage_concurrency()));

        Ok(Self {
            registry,
            coordinator,
            settings,
            election,
            usage,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Sweep until `shutdown` fires or a fatal error ends the sweep
    pub async fn run(self, cli: Cli, shutdown: ShutdownSignal) -> anyhow::Result<()> {
        let reload = tokio::spawn(watch_reload(
            cli,
            self.settings.clone(),
            shutdown.subscribe(),
        ));

        let usage = self.usage.map(|(interval, concurrency)| {
            tokio::spawn(report_usage_periodically(
                self.registry.clone(),
                interval,
                concurrency,
                shutdown.subscribe(),
            ))
        });

        let election = match &self.election {
            Some((name, participant)) => Some(
                join_election(self.coordinator.clone(), name, participant)
                    .await
                    .context("failed to join the rectifier election")?,
            ),
            None => None,
        };

        let rectifier = Rectifier::new(self.registry.clone(), self.settings.clone());
        let result = rectifier.run(shutdown.subscribe()).await;
        if let Err(e) = &result {
            error!(error = %e, "Rectifier stopped on a fatal error");
        }
        // Stop the side tasks when the sweep ended on its own
        shutdown.shutdown();

        if let Some((handle, watcher)) = election {
            watcher.abort();
            if let Err(e) = handle.resign().await {
                warn!(error = %e, "Failed to resign from the election");
            }
        }
        let _ = reload.await;
        if let Some(usage) = usage {
            let _ = usage.await;
        }

        with_deadline(
            self.registry.background().drain(),
            DRAIN_TIMEOUT,
            "Background queue drain",
        )
        .await;
        info!(
            completed = self.registry.background().completed(),
            failed = self.registry.background().failed(),
            dropped = self.registry.background().dropped(),
            "Background queue drained"
        );

        result.map_err(Into::into)
    }
}

/// Count objects over every account and publish the usage gauges
pub async fn report_usage(registry: &Registry, concurrency: usize) -> anyhow::Result<UsageTotals> {
    let totals = registry
        .usage_totals(concurrency)
        .await
        .context("failed to count usage")?;
    totals.record();
    Ok(totals)
}

async fn report_usage_periodically(
    registry: Arc<Registry>,
    period: Duration,
    concurrency: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticks = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => return,
            _ = ticks.tick() => {
                if let Err(e) = report_usage(&registry, concurrency).await {
                    warn!(error = %e, "Usage report failed");
                }
            }
        }
    }
}

async fn join_election(
    coordinator: Arc<dyn Coordinator>,
    name: &str,
    participant: &str,
) -> anyhow::Result<(ElectionHandle, JoinHandle<()>)> {
    let handle = Election::new(coordinator, name)
        .with_participant(participant)
        .perform()
        .await?;
    info!(election = name, node = handle.node(), "Joined election");

    let mut roles = handle.subscribe();
    let election = name.to_string();
    let watcher = tokio::spawn(async move {
        loop {
            let role = *roles.borrow_and_update();
            match role {
                Role::Leader => info!(%election, "Elected leader"),
                Role::Follower => info!(%election, "Following"),
                Role::Stopped => {
                    warn!(%election, "Election proposal lost");
                    return;
                }
                Role::Candidate => {}
            }
            if roles.changed().await.is_err() {
                return;
            }
        }
    });
    Ok((handle, watcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_registry::{Liveness, ServiceSpec};

    const FAST_SWEEP: &str = r#"
rectifier:
  shards: ALL
  sleep_ms: 20
  jitter_min_ms: 0
  jitter_max_ms: 0
  grace_millis: 0
  elect: true
"#;

    #[tokio::test]
    async fn test_unknown_storage_mode() {
        let configuration = Configuration::from_yaml("storage:\n  mode: cassandra\n").unwrap();
        assert!(build_store(&configuration).is_err());
    }

    #[cfg(not(feature = "embedded"))]
    #[tokio::test]
    async fn test_embedded_requires_feature() {
        let configuration = Configuration::from_yaml("storage:\n  mode: embedded\n").unwrap();
        assert!(build_store(&configuration).is_err());
    }

    #[tokio::test]
    async fn test_report_usage_sums_accounts() {
        let configuration = Configuration::from_yaml("{}").unwrap();
        let worker = Worker::new(&configuration).await.unwrap();
        let registry = worker.registry().clone();

        for account in ["acc1", "acc2"] {
            registry.create_account(account, None).await.unwrap();
            let ctx = registry.context(account).await.unwrap();
            registry
                .create_service(&ctx, ServiceSpec::new("S", 30))
                .await
                .unwrap();
        }

        let totals = report_usage(&registry, 2).await.unwrap();
        assert_eq!(totals.accounts, 2);
        assert_eq!(totals.services, 2);
        assert_eq!(totals.configuration_values, 0);
    }

    #[tokio::test]
    async fn test_worker_times_out_silent_service() {
        let configuration = Configuration::from_yaml(FAST_SWEEP).unwrap();
        let worker = Worker::new(&configuration).await.unwrap();
        let registry = worker.registry().clone();

        registry.create_account("acc1", None).await.unwrap();
        let ctx = registry.context("acc1").await.unwrap();
        registry
            .create_service(&ctx, ServiceSpec::new("S", 3))
            .await
            .unwrap();
        registry.background().drain().await;

        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(worker.run(Cli::default(), shutdown.clone()));

        let reaped = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if registry.liveness(&ctx, "S").await.unwrap() == Liveness::Reaped {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(reaped.is_ok());

        shutdown.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
