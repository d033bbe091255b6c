//! File-based logging with per-component files.
//!
//! Every event reaches the root file; components additionally get their own
//! daily-rotated file, routed by `tracing` target:
//!
//! | Log File           | Component                          | Target Prefixes            |
//! |--------------------|------------------------------------|----------------------------|
//! | vigil.log          | Root logger (all components)       | (all)                      |
//! | rectifier.log      | Rectification and the sweep        | vigil_registry::rectifier  |
//! | registry.log       | Service, event and account writes  | vigil_registry (without    |
//! |                    |                                    | vigil_registry::rectifier) |
//! | coordination.log   | Locks and leader election          | vigil_consistency          |
//! | persistence.log    | Column store                       | vigil_persistence          |
//!
//! Log files are stored in `~/vigil/logs` by default.
//! Override with the `logs.path` setting.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

struct ComponentLogDef {
    file_name: &'static str,
    targets: &'static [&'static str],
    /// More specific targets that belong to another file
    excluded: &'static [&'static str],
}

const ROOT_LOG_FILE: &str = "vigil.log";

const COMPONENT_LOGS: &[ComponentLogDef] = &[
    ComponentLogDef {
        file_name: "rectifier.log",
        targets: &["vigil_registry::rectifier", "vigil_server::worker"],
        excluded: &[],
    },
    ComponentLogDef {
        file_name: "registry.log",
        targets: &["vigil_registry"],
        excluded: &["vigil_registry::rectifier"],
    },
    ComponentLogDef {
        file_name: "coordination.log",
        targets: &["vigil_consistency"],
        excluded: &[],
    },
    ComponentLogDef {
        file_name: "persistence.log",
        targets: &["vigil_persistence"],
        excluded: &[],
    },
];

/// Log rotation policy
#[derive(Debug, Clone, Copy)]
pub enum LogRotation {
    Daily,
    Hourly,
    /// Single file
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

fn default_log_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{home}/vigil/logs"))
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Base log directory (default: `~/vigil/logs`)
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub console_level: Level,
    pub file_logging: bool,
    pub file_level: Level,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            console_output: true,
            console_level: Level::INFO,
            file_logging: false,
            file_level: Level::INFO,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    pub fn from_config(
        log_dir: Option<String>,
        console_output: bool,
        file_logging: bool,
        level: String,
    ) -> Self {
        let log_dir = log_dir.map(PathBuf::from).unwrap_or_else(default_log_dir);
        let level = level.parse().unwrap_or(Level::INFO);

        Self {
            log_dir,
            console_output,
            console_level: level,
            file_logging,
            file_level: level,
            rotation: LogRotation::Daily,
        }
    }
}

/// Target filter of a component file; the most specific target wins
fn component_filter(component: &ComponentLogDef) -> Targets {
    let mut targets = Targets::new();
    for target in component.targets {
        targets = targets.with_target(*target, LevelFilter::TRACE);
    }
    for target in component.excluded {
        targets = targets.with_target(*target, LevelFilter::OFF);
    }
    targets
}

/// Keeps the non-blocking file writers alive; dropping it flushes them.
pub struct LoggingGuard {
    _file_guards: Vec<WorkerGuard>,
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level of the console and root file
/// layers. Component files capture every level from their targets.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
    }

    let mut guards: Vec<WorkerGuard> = Vec::new();
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_output {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.console_level.to_string()));
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(filter);
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        let root_appender =
            RollingFileAppender::new(config.rotation.into(), &config.log_dir, ROOT_LOG_FILE);
        let (root_nb, root_guard) = tracing_appender::non_blocking(root_appender);
        guards.push(root_guard);

        let root_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.file_level.to_string()));
        let root_layer = fmt::layer()
            .with_writer(root_nb)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(root_filter);
        layers.push(Box::new(root_layer));

        for component in COMPONENT_LOGS {
            let appender = RollingFileAppender::new(
                config.rotation.into(),
                &config.log_dir,
                component.file_name,
            );
            let (nb, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);

            let layer = fmt::layer()
                .with_writer(nb)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_filter(component_filter(component));
            layers.push(Box::new(layer));
        }
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            component_files = COMPONENT_LOGS.len(),
            "File logging initialized"
        );
    }

    Ok(LoggingGuard {
        _file_guards: guards,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_from_config() {
        let config = LoggingConfig::from_config(
            Some("/tmp/vigil-logs".to_string()),
            false,
            true,
            "warn".to_string(),
        );
        assert_eq!(config.log_dir, PathBuf::from("/tmp/vigil-logs"));
        assert!(!config.console_output);
        assert!(config.file_logging);
        assert_eq!(config.file_level, Level::WARN);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let config = LoggingConfig::from_config(None, true, false, "loud".to_string());
        assert_eq!(config.console_level, Level::INFO);
        assert!(config.log_dir.ends_with("vigil/logs"));
    }

    #[test]
    fn test_component_files_are_distinct() {
        let mut names: Vec<_> = COMPONENT_LOGS.iter().map(|c| c.file_name).collect();
        names.push(ROOT_LOG_FILE);
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        assert!(COMPONENT_LOGS.iter().all(|c| !c.targets.is_empty()));
    }

    #[test]
    fn test_rectifier_events_stay_out_of_registry_log() {
        let file = |name: &str| {
            COMPONENT_LOGS
                .iter()
                .find(|c| c.file_name == name)
                .map(component_filter)
                .unwrap()
        };
        let registry = file("registry.log");
        let rectifier = file("rectifier.log");

        assert!(registry.would_enable("vigil_registry::service", &Level::DEBUG));
        assert!(!registry.would_enable("vigil_registry::rectifier", &Level::INFO));
        assert!(!registry.would_enable("vigil_registry::rectifier::scheduler", &Level::ERROR));
        assert!(rectifier.would_enable("vigil_registry::rectifier::scheduler", &Level::INFO));
        assert!(!rectifier.would_enable("vigil_registry::service", &Level::INFO));
    }
}
