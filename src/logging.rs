//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; the binary calls [`init`] once.
//! Experiment context (id, well, project) is attached with spans rather than by
//! swapping logger formats, see [`experiment_span`].

use tracing::Span;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{ApplicationConfig, LogFormat};
use crate::error::{SdlError, SdlResult};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `application.log_level`.
pub fn init(config: &ApplicationConfig) -> SdlResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| SdlError::Configuration(format!("invalid log level: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.log_format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(false)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    result.map_err(|e| SdlError::Configuration(format!("logger already installed: {e}")))
}

/// Span carrying experiment context for every event emitted while it is entered.
pub fn experiment_span(experiment_id: i64, well_id: &str, project: &str) -> Span {
    tracing::info_span!("experiment", experiment_id, well_id, project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_events_inherit_experiment_context() {
        let span = experiment_span(12, "B3", "16.2");
        span.in_scope(|| tracing::info!("inside"));
        assert!(logs_contain("inside"));
        assert!(logs_contain("experiment_id=12"));
    }
}
