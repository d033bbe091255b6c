use std::process::ExitCode;

use clap::Parser;
use vigil_server::startup::{init_logging, wait_for_shutdown_signal};
use vigil_server::{Cli, Configuration, Worker, metrics};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let configuration = match Configuration::load(&cli) {
        Ok(configuration) => configuration,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let _logging_guard = match init_logging(&configuration.logging_config()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli, configuration).await {
        Ok(()) => {
            tracing::info!("Vigil worker stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Vigil worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, configuration: Configuration) -> anyhow::Result<()> {
    metrics::init_metrics();
    if let Some(address) = configuration.metrics_address()? {
        metrics::install_exporter(address)?;
    }

    let shutdown = wait_for_shutdown_signal();
    let worker = Worker::new(&configuration).await?;
    tracing::info!(
        storage = %configuration.storage_mode(),
        version = env!("CARGO_PKG_VERSION"),
        "Vigil worker started"
    );
    worker.run(cli, shutdown).await
}
