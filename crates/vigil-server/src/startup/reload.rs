//! Live reload of the sweep settings on SIGHUP

use tokio::sync::broadcast;
use tracing::{info, warn};
use vigil_registry::SettingsHandle;

use crate::model::config::{Cli, Configuration};

/// Rebuild the configuration from its sources and swap the sweep settings.
///
/// Returns the new settings version. On error the running settings stay.
pub fn reload_settings(cli: &Cli, handle: &SettingsHandle) -> anyhow::Result<u64> {
    let configuration = Configuration::load(cli)?;
    let settings = configuration.rectifier_settings()?;
    let shards = settings.shards.len();
    let version = handle.replace(settings)?;
    info!(version, shards, "Configuration reloaded");
    Ok(version)
}

/// Reload on every SIGHUP until shutdown
#[cfg(unix)]
pub async fn watch_reload(cli: Cli, handle: SettingsHandle, mut shutdown: broadcast::Receiver<()>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                if let Err(e) = reload_settings(&cli, &handle) {
                    warn!(error = %e, "Reload rejected, keeping current settings");
                }
            }
        }
    }
}

#[cfg(not(unix))]
pub async fn watch_reload(_cli: Cli, _handle: SettingsHandle, mut shutdown: broadcast::Receiver<()>) {
    let _ = shutdown.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_registry::RectifierSettings;

    fn write_config(file: &tempfile::NamedTempFile, body: &str) {
        std::fs::write(file.path(), body).unwrap();
    }

    #[test]
    fn test_reload_replaces_settings() {
        let file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        write_config(&file, "rectifier:\n  shards: \"0-3\"\n  concurrency: 2\n");
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Cli::default()
        };

        let handle = SettingsHandle::new(RectifierSettings::new(vec![0]));
        assert_eq!(reload_settings(&cli, &handle).unwrap(), 1);
        assert_eq!(handle.snapshot().shards, vec![0, 1, 2, 3]);
        assert_eq!(handle.snapshot().concurrency, 2);

        write_config(&file, "rectifier:\n  shards: \"9-1\"\n");
        assert!(reload_settings(&cli, &handle).is_err());
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.snapshot().shards, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let cli = Cli {
            config: Some("/nonexistent/vigil.yml".into()),
            ..Cli::default()
        };
        let handle = SettingsHandle::new(RectifierSettings::new(vec![0]));
        assert!(reload_settings(&cli, &handle).is_err());
        assert_eq!(handle.version(), 0);
    }
}
