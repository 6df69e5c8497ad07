//! Tracing subscriber initialization, keyed off the `FLY_LOG_*` env vars.
//!
//! Since stdout is the JSON-RPC transport, `flyd` never logs to it —
//! `FLY_LOG_FILE` (or stderr, if unset) is the only valid log sink.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format selected by `FLY_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

impl LogFormat {
    fn from_env() -> Self {
        match std::env::var("FLY_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Human,
        }
    }
}

/// Guard returned by [`init`]; dropping it flushes the non-blocking file
/// appender (when `FLY_LOG_FILE` is set). The caller must hold this for the
/// lifetime of the process.
pub struct LoggingGuard(Option<tracing_appender::non_blocking::WorkerGuard>);

/// Initialize the global tracing subscriber. Safe to call once at process
/// startup; a second call is a no-op (errors are swallowed) so tests that
/// spin up multiple in-process servers don't panic on re-init.
pub fn init() -> LoggingGuard {
    let level = std::env::var("FLY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let format = LogFormat::from_env();
    let ansi = std::env::var("FLY_NO_COLOR").is_err();

    let registry = tracing_subscriber::registry().with(filter);

    if let Ok(path) = std::env::var("FLY_LOG_FILE") {
        let file_path = std::path::PathBuf::from(path);
        let dir = file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "flyd.log".to_string());
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let result = match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_ansi(false).with_writer(writer))
                .try_init(),
            LogFormat::Human => registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .try_init(),
        };
        let _ = result;
        return LoggingGuard(Some(guard));
    }

    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Human => registry
            .with(fmt::layer().with_ansi(ansi).with_writer(std::io::stderr))
            .try_init(),
    };
    let _ = result;
    LoggingGuard(None)
}
