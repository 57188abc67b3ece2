//! Provide tracing, tailored to this library and its tools.
//!
//! A program using the port layer should call one of the init_* functions at
//! startup to install a tracing subscriber (i.e., something that emits events
//! to a log). The library itself only emits events.
//!
//! The rest of the crate can include `use crate::tracing::prelude::*` for
//! convenient access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and
//! `error!()` macros.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub use tracing_subscriber::filter::LevelFilter;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall
/// back to stdout.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            init_stdout();
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        init_stdout();
    }
}

/// Log to stdout, filtering according to environment variable RUST_LOG,
/// overriding the default level (ERROR) to INFO.
pub fn init_stdout() {
    tracing_subscriber::registry()
        .with(env_filter(LevelFilter::INFO))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

/// Log to stderr at `default` unless RUST_LOG says otherwise. For tools whose
/// stdout carries their actual output.
pub fn init_stderr(default: LevelFilter) {
    tracing_subscriber::registry()
        .with(env_filter(default))
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn env_filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

// Timestamps in local time, to the nearest second. Control loops log a lot;
// the default UTC timer produced long, noisy lines.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
