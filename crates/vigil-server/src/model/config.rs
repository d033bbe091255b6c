//! Configuration management for the Vigil worker
//!
//! Settings are layered, later sources winning:
//! - `conf/application.yml` (or the file given with `--config`)
//! - `VIGIL_` environment variables, `__` separating nesting levels
//!   (`VIGIL_RECTIFIER__CONCURRENCY=4`)
//! - command line flags

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use vigil_registry::{RectifierSettings, RegistryConfig, parse_shards};

use crate::startup::logging::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";
pub const ENV_PREFIX: &str = "VIGIL";

pub const STORAGE_MODE_MEMORY: &str = "memory";
pub const STORAGE_MODE_EMBEDDED: &str = "embedded";

/// Command line arguments for the worker
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "vigil-server", version, about)]
pub struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Shards to sweep: ALL, a list (5,7,9), ranges (1-5,10-15) or a mix
    #[arg(short = 's', long = "shards", env = "RECTIFIER_SHARDS")]
    pub shards: Option<String>,

    /// Accounts rectified at once
    #[arg(long = "concurrency", env = "RECTIFIER_CONCURRENCY")]
    pub concurrency: Option<u32>,

    /// Data directory of the embedded store
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<String>,

    /// Take part in the rectifier leader election and announce the role
    #[arg(long = "elect")]
    pub elect: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RectifierSection {
    #[serde(default = "default_shards")]
    shards: String,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    #[serde(default = "default_conviction_threshold_secs")]
    conviction_threshold_secs: u64,
    #[serde(default = "default_sleep_ms")]
    sleep_ms: u64,
    #[serde(default = "default_jitter_min_ms")]
    jitter_min_ms: u64,
    #[serde(default = "default_jitter_max_ms")]
    jitter_max_ms: u64,
    #[serde(default = "default_grace_millis")]
    grace_millis: i64,
}

fn default_shards() -> String {
    vigil_registry::ALL_SHARDS.to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_conviction_threshold_secs() -> u64 {
    300
}

fn default_sleep_ms() -> u64 {
    5_000
}

fn default_jitter_min_ms() -> u64 {
    1_000
}

fn default_jitter_max_ms() -> u64 {
    5_000
}

fn default_grace_millis() -> i64 {
    5_000
}

impl Default for RectifierSection {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            concurrency: default_concurrency(),
            conviction_threshold_secs: default_conviction_threshold_secs(),
            sleep_ms: default_sleep_ms(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
            grace_millis: default_grace_millis(),
        }
    }
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    /// Build from every source, applying `cli` overrides last
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let (path, required) = match &cli.config {
            Some(path) => (path.to_string_lossy().into_owned(), true),
            None => (DEFAULT_CONFIG_FILE.to_string(), false),
        };
        let builder = Config::builder()
            .add_source(File::with_name(&path).required(required))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        let builder = Self::apply_overrides(builder, cli)?;
        let config = builder
            .build()
            .with_context(|| format!("failed to build configuration from {path}"))?;
        Ok(Configuration { config })
    }

    /// Build from YAML text alone
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Ok(Configuration { config })
    }

    fn apply_overrides(
        mut builder: config::ConfigBuilder<config::builder::DefaultState>,
        cli: &Cli,
    ) -> anyhow::Result<config::ConfigBuilder<config::builder::DefaultState>> {
        if let Some(v) = &cli.shards {
            builder = builder.set_override("rectifier.shards", v.as_str())?;
        }
        if let Some(v) = cli.concurrency {
            builder = builder.set_override("rectifier.concurrency", i64::from(v))?;
        }
        if let Some(v) = &cli.data_dir {
            builder = builder
                .set_override("storage.data_dir", v.as_str())?
                .set_override("storage.mode", STORAGE_MODE_EMBEDDED)?;
        }
        if cli.elect {
            builder = builder.set_override("rectifier.elect", true)?;
        }
        Ok(builder)
    }

    // ========================================================================
    // Storage
    // ========================================================================

    pub fn storage_mode(&self) -> String {
        self.config
            .get_string("storage.mode")
            .unwrap_or(STORAGE_MODE_MEMORY.to_string())
    }

    pub fn data_dir(&self) -> String {
        self.config
            .get_string("storage.data_dir")
            .unwrap_or("data/vigil".to_string())
    }

    /// Interval of the column store's expired cell purge
    pub fn storage_cleanup_interval_ms(&self) -> u64 {
        self.config
            .get_int("storage.cleanup_interval_ms")
            .map(|v| v.max(1) as u64)
            .unwrap_or(60_000)
    }

    // ========================================================================
    // Registry and rectifier
    // ========================================================================

    pub fn registry_config(&self) -> anyhow::Result<RegistryConfig> {
        match self.config.get::<RegistryConfig>("registry") {
            Ok(config) => Ok(config),
            Err(config::ConfigError::NotFound(_)) => Ok(RegistryConfig::default()),
            Err(e) => Err(e).context("invalid registry section"),
        }
    }

    pub fn rectifier_settings(&self) -> anyhow::Result<RectifierSettings> {
        let section = match self.config.get::<RectifierSection>("rectifier") {
            Ok(section) => section,
            Err(config::ConfigError::NotFound(_)) => RectifierSection::default(),
            Err(e) => return Err(e).context("invalid rectifier section"),
        };
        let max_shards = self.registry_config()?.max_shards;
        let shards = parse_shards(&section.shards, max_shards)?;
        let settings = RectifierSettings::new(shards)
            .with_concurrency(section.concurrency)
            .with_conviction_threshold(Duration::from_secs(section.conviction_threshold_secs))
            .with_sleep(
                Duration::from_millis(section.sleep_ms),
                Duration::from_millis(section.jitter_min_ms),
                Duration::from_millis(section.jitter_max_ms),
            )
            .with_grace_millis(section.grace_millis);
        settings.validate()?;
        Ok(settings)
    }

    pub fn elect(&self) -> bool {
        self.config.get_bool("rectifier.elect").unwrap_or(false)
    }

    pub fn election_name(&self) -> String {
        self.config
            .get_string("rectifier.election_name")
            .unwrap_or("rectifier".to_string())
    }

    pub fn participant(&self) -> String {
        self.config
            .get_string("rectifier.participant")
            .unwrap_or_else(|_| format!("vigil-{}", std::process::id()))
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Interval between usage gauge refreshes, `None` when disabled
    pub fn usage_report_interval(&self) -> Option<Duration> {
        let ms = self
            .config
            .get_int("usage.report_interval_ms")
            .unwrap_or(3_600_000);
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }

    /// Accounts counted at once by the usage report
    pub fn usage_concurrency(&self) -> usize {
        self.config
            .get_int("usage.concurrency")
            .map(|v| v.max(1) as usize)
            .unwrap_or(6)
    }

    /// Prometheus listener address, when the exporter is enabled
    pub fn metrics_address(&self) -> anyhow::Result<Option<SocketAddr>> {
        if !self.config.get_bool("metrics.enabled").unwrap_or(false) {
            return Ok(None);
        }
        let address = self
            .config
            .get_string("metrics.address")
            .unwrap_or("0.0.0.0:9464".to_string());
        let address: SocketAddr = address
            .parse()
            .with_context(|| format!("invalid metrics address '{address}'"))?;
        Ok(Some(address))
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("logs.path").ok(),
            self.config.get_bool("logs.console").unwrap_or(true),
            self.config.get_bool("logs.file").unwrap_or(false),
            self.config
                .get_string("logs.level")
                .unwrap_or("info".to_string()),
        )
    }
}
