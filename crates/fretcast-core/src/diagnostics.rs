use std::{fs, path::Path};

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};
use uuid::Uuid;

pub const DEFAULT_LOG_FILTER: &str = "info,fretcast_core=trace";
pub const DEFAULT_TRACE_FILE_PREFIX: &str = "fretcast";

/// Keeps the non-blocking file writer alive; logs stop flushing once dropped.
pub struct TelemetryGuard {
    pub session_id: Uuid,
    pub log_file: String,
    _file_guard: WorkerGuard,
}

#[derive(Debug, Clone)]
pub struct TracingOptions<'a> {
    pub file_prefix: &'a str,
    pub default_filter: &'a str,
    pub stdout_json: bool,
    pub span_timings: bool,
}

impl Default for TracingOptions<'_> {
    fn default() -> Self {
        Self {
            file_prefix: DEFAULT_TRACE_FILE_PREFIX,
            default_filter: DEFAULT_LOG_FILTER,
            stdout_json: false,
            span_timings: true,
        }
    }
}

pub fn init_tracing(log_dir: impl AsRef<Path>) -> anyhow::Result<TelemetryGuard> {
    init_tracing_with_options(log_dir, &TracingOptions::default())
}

pub fn init_tracing_with_options(
    log_dir: impl AsRef<Path>,
    options: &TracingOptions<'_>,
) -> anyhow::Result<TelemetryGuard> {
    let log_dir = log_dir.as_ref();
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let session_id = Uuid::new_v4();
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let log_file = format!("{}-{timestamp}.log", options.file_prefix);
    let file_appender = tracing_appender::rolling::never(log_dir, &log_file);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_filter));
    let span_events = if options.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let stdout_layer = if options.stdout_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(span_events.clone())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_thread_names(true)
            .with_target(true)
            .with_span_events(span_events.clone())
            .boxed()
    };

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_span_events(span_events)
        .with_writer(file_writer);

    if let Err(error) = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
    {
        warn!(?error, "global tracing subscriber already initialized");
    } else {
        info!(%session_id, log_dir = %log_dir.display(), %log_file, "tracing initialized");
    }

    Ok(TelemetryGuard {
        session_id,
        log_file,
        _file_guard: file_guard,
    })
}
