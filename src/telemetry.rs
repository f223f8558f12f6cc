use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging for the host process.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    if config.json_logs {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .with(filter)
            .try_init()?;
    }

    tracing::debug!("Tickwork telemetry initialized");
    Ok(())
}

/// Generate an id correlating every trace and log line of one tick
pub fn generate_tick_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping a single engine tick
pub fn create_tick_span(task_id: &str, workflow_id: &str, tick_id: &str) -> tracing::Span {
    tracing::info_span!(
        "tick",
        task.id = task_id,
        workflow.id = workflow_id,
        tick.id = tick_id,
        run.id = tracing::field::Empty,
    )
}
