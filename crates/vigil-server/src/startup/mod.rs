//! Process startup: logging, shutdown signals and configuration reload

pub mod logging;
mod reload;
mod shutdown;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use reload::{reload_settings, watch_reload};
pub use shutdown::{ShutdownSignal, wait_for_shutdown_signal, with_deadline};
