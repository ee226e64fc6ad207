/*!
 * Subscriber setup for the client and its component crates
 *
 * Events from `tether`, `tether_connect` and `tether_core_resilience` are
 * enabled at the configured level unless `RUST_LOG` says otherwise. Output
 * goes either to the console in compact form or, when a log file is
 * configured, to that file as one JSON object per line.
 *
 * Components never log on their own root: each one is handed a span from
 * [`component_span`] so every event carries the component name and target.
 */

use std::fs::File;
use std::path::Path;
use tracing::{Level, Span};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{Result, TetherError};

/// Crates whose events the default filter enables
pub const LOG_TARGETS: [&str; 3] = ["tether", "tether_connect", "tether_core_resilience"];

/// Filter directives enabling every crate in [`LOG_TARGETS`] at `level`
pub fn default_directives(level: Level) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

fn filter_for(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directives(config.effective_level()))
        .map_err(|e| TetherError::Config(format!("invalid log filter: {}", e)))
}

/// Install the global subscriber described by `config`
///
/// Fails with [`TetherError::Logging`] if the log file cannot be created or a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = filter_for(config)?;

    let (console, json_file) = match &config.file {
        Some(path) => {
            // One JSON object per event, plus one per closed span with its timings
            let layer = fmt::layer()
                .json()
                .with_writer(create_log_file(path)?)
                .with_ansi(false)
                .with_current_span(true)
                .with_span_events(FmtSpan::CLOSE)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            (None, Some(layer))
        }
        None => (Some(fmt::layer().with_target(true).compact()), None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(json_file)
        .try_init()
        .map_err(|e| TetherError::Logging(format!("subscriber already installed: {}", e)))
}

fn create_log_file(path: &Path) -> Result<File> {
    File::create(path)
        .map_err(|e| TetherError::Logging(format!("cannot create log file {}: {}", path.display(), e)))
}

/// Span a client component logs under
pub fn component_span(component: &'static str, target: &str) -> Span {
    tracing::info_span!("tether", component, target = %target)
}

#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directives(Level::DEBUG)));

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer().compact())
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_default_directives_cover_every_crate() {
        assert_eq!(
            default_directives(Level::WARN),
            "tether=WARN,tether_connect=WARN,tether_core_resilience=WARN"
        );
    }

    #[test]
    fn test_verbose_lowers_the_level() {
        let config = LoggingConfig {
            level: LogLevel::Error,
            file: None,
            verbose: true,
        };
        assert_eq!(config.effective_level(), Level::DEBUG);
        assert!(filter_for(&config).is_ok());
    }

    #[test]
    fn test_second_init_reports_error() {
        init_test_logging();

        let result = init_logging(&LoggingConfig::default());
        assert!(matches!(result, Err(TetherError::Logging(_))));
    }

    #[test]
    fn test_unwritable_log_file() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            file: Some("/nonexistent-dir/tether/client.log".into()),
            verbose: false,
        };

        let result = init_logging(&config);
        assert!(matches!(result, Err(TetherError::Logging(msg)) if msg.contains("cannot create log file")));
    }

    #[test]
    fn test_component_span_carries_fields() {
        init_test_logging();
        let span = component_span("pipeline", "svc:50051");
        assert_eq!(span.metadata().map(|meta| meta.name()), Some("tether"));
        let _entered = span.enter();
        tracing::debug!("inside component span");
    }
}
