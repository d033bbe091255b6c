//! Vigil Registry - service liveness and rectification
//!
//! This crate holds the registry core:
//! - Service registration, heartbeats, updates and removal (`service`)
//! - Rectification of missed heartbeats into timeout events (`rectifier`)
//! - The sharded background sweep (`rectifier::scheduler`)
//! - The event ledger (`event`) and configuration values (`configuration`)
//! - Accounts, limits, usage counts and the activity index (`account`, `activity`)
//! - A client-side heartbeat driver (`heartbeater`)

pub mod account;
pub mod activity;
pub mod background;
pub mod config;
pub mod configuration;
pub mod context;
pub mod error;
pub mod event;
pub mod heartbeater;
pub mod model;
pub mod rectifier;
pub mod registry;
pub mod service;

pub use account::UsageTotals;
pub use activity::AccountActivity;
pub use background::BackgroundQueue;
pub use config::RegistryConfig;
pub use context::AccountContext;
pub use error::{RegistryError, Result};
pub use event::EventQuery;
pub use heartbeater::{
    HeartbeatStatus, HeartbeatTarget, Heartbeater, HeartbeaterHandle, HeartbeaterManager,
    RegistryTarget, heartbeat_interval,
};
pub use model::{
    Account, AccountMetadata, AccountUpdate, ConfigurationValue, Event, EventType, Liveness, Page, PageMetadata,
    Pagination, ReadOptions, Service, ServiceSpec, ServiceUpdate,
};
pub use rectifier::{
    ALL_SHARDS, PassReport, RectifierSettings, Rectifier, RectifyReport, SettingsHandle,
    compute_shard, parse_shards,
};
pub use registry::Registry;
