//! Vigil Server - the rectifier worker process
//!
//! - `model::config`: layered configuration and command line flags
//! - `startup`: logging, shutdown signals and SIGHUP reload
//! - `metrics`: metric descriptions and the Prometheus exporter
//! - `worker`: store and coordination wiring plus the sweep loop

pub mod metrics;
pub mod model;
pub mod startup;
pub mod worker;

pub use model::{Cli, Configuration};
pub use worker::Worker;
