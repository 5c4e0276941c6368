use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;
use crate::workflows::WorkflowId;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies. JSON
/// output carries the current span so workflow ids travel with every event.
pub fn init_telemetry(observability: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&observability.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);

    if observability.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    tracing::info!(
        log_level = %observability.log_level,
        json_logs = observability.json_logs,
        "Conductor telemetry initialized"
    );
    Ok(())
}

/// Generate a correlation ID for linking the events of one workflow run
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping everything a workflow loop does
pub fn create_workflow_span(
    operation: &str,
    workflow_id: &WorkflowId,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "workflow",
        operation = operation,
        workflow.id = %workflow_id,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

pub fn shutdown_telemetry() {
    tracing::info!("Conductor telemetry shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        let first = generate_correlation_id();
        let second = generate_correlation_id();

        assert_ne!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }
}
