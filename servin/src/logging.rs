//! Process-wide logging setup.
//!
//! Initialized exactly once at runtime construction: an `EnvFilter` driven
//! by `RUST_LOG` (default `info`) writing through a non-blocking rolling
//! file appender under `<base>/logs/`.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::errors::ServinResult;
use crate::runtime::layout::FilesystemLayout;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize tracing for this layout. Safe to call more than once; only the
/// first call installs a subscriber.
pub fn init_logging_for(layout: &FilesystemLayout) -> ServinResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let appender = tracing_appender::rolling::daily(layout.logs_dir(), "servin.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    if result.is_ok() {
        let _ = LOG_GUARD.set(guard);
    }
    Ok(())
}
