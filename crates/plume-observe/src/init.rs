use time::{UtcOffset, format_description::well_known::Rfc3339};
use tracing_subscriber::{
    EnvFilter, fmt, fmt::time::OffsetTime, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::{config::LoggerConfig, error::LoggerError, format::LoggerFormat};

/// Install the global `tracing` subscriber described by `cfg`.
pub fn logger_init(cfg: &LoggerConfig) -> Result<(), LoggerError> {
    if tracing::dispatcher::has_been_set() {
        return Err(LoggerError::AlreadyInitialized);
    }
    let registry = tracing_subscriber::registry().with(mk_filter(&cfg.level)?);

    match cfg.format {
        LoggerFormat::Text => registry
            .with(
                fmt::layer()
                    .with_ansi(cfg.use_color)
                    .with_target(cfg.with_targets)
                    .with_timer(mk_timer()),
            )
            .try_init()
            .map_err(init_failed),
        LoggerFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(cfg.with_targets)
                    .with_current_span(true)
                    .with_timer(mk_timer()),
            )
            .try_init()
            .map_err(init_failed),
        LoggerFormat::Journald => init_journald(registry),
    }
}

pub(crate) fn mk_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_new(level).map_err(|_| LoggerError::InvalidLogLevel(level.to_string()))
}

fn mk_timer() -> OffsetTime<Rfc3339> {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(offset, Rfc3339)
}

fn init_failed(e: impl std::fmt::Display) -> LoggerError {
    LoggerError::InitializationFailed(e.to_string())
}

#[cfg(all(target_os = "linux", feature = "journald"))]
fn init_journald<S>(subscriber: S) -> Result<(), LoggerError>
where
    S: tracing::Subscriber
        + for<'a> tracing_subscriber::registry::LookupSpan<'a>
        + Send
        + Sync
        + 'static,
{
    let journald = tracing_journald::layer().map_err(|e| init_failed(format!("journald: {e}")))?;
    subscriber.with(journald).try_init().map_err(init_failed)
}

#[cfg(not(all(target_os = "linux", feature = "journald")))]
fn init_journald<S>(_subscriber: S) -> Result<(), LoggerError> {
    Err(LoggerError::JournaldNotSupported)
}
