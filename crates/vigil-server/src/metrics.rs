// Metric descriptions and the Prometheus exporter
// Counters and histograms are recorded by the registry and consistency crates

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Describe every metric the worker emits. Call once at startup.
pub fn init_metrics() {
    // Services
    describe_counter!(
        "vigil_services_registered_total",
        "Total number of services registered"
    );
    describe_counter!(
        "vigil_services_removed_total",
        "Total number of services removed by their owners"
    );
    describe_counter!(
        "vigil_services_timed_out_total",
        "Total number of services timed out by rectification"
    );
    describe_counter!(
        "vigil_heartbeats_total",
        "Total number of accepted heartbeats"
    );

    // Rectification
    describe_histogram!(
        "vigil_rectify_duration_seconds",
        "Duration of one account rectification in seconds"
    );
    describe_counter!(
        "vigil_rectify_errors_total",
        "Total number of failed account rectifications"
    );
    describe_counter!(
        "vigil_rectifier_passes_total",
        "Total number of completed sweep passes"
    );
    describe_gauge!(
        "vigil_rectifier_candidate_accounts",
        "Accounts considered by the latest sweep pass"
    );

    // Coordination
    describe_histogram!(
        "vigil_lock_wait_seconds",
        "Time spent acquiring distributed locks in seconds"
    );
    describe_counter!(
        "vigil_lock_failures_total",
        "Total number of failed lock acquisitions"
    );
    describe_gauge!(
        "vigil_election_leader",
        "1 while this process leads its election, 0 otherwise"
    );

    // Usage
    describe_gauge!("vigil_usage_accounts", "Number of accounts");
    describe_gauge!(
        "vigil_usage_services",
        "Number of registered services over all accounts"
    );
    describe_gauge!(
        "vigil_usage_configuration_values",
        "Number of configuration values over all accounts"
    );

    // Background writes
    describe_counter!(
        "vigil_background_failures_total",
        "Total number of failed background writes"
    );
    describe_counter!(
        "vigil_background_dropped_total",
        "Total number of background writes dropped on a full queue"
    );

    tracing::info!("Metrics initialized");
}

/// Serve `/metrics` on `address`
pub fn install_exporter(address: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()?;
    tracing::info!(%address, "Prometheus exporter listening");
    Ok(())
}
