use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::registry::{ShutdownOutcome, WorkflowRegistry};

/// Graceful shutdown coordinator for Conductor
pub struct ShutdownCoordinator {
    registry: Arc<WorkflowRegistry>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<WorkflowRegistry>, grace: Duration) -> Self {
        Self { registry, grace }
    }

    /// Wait for Ctrl-C, then drain the registry.
    pub async fn wait_for_shutdown(self) -> Result<ShutdownOutcome> {
        info!("Shutdown coordinator ready - will shutdown gracefully on Ctrl-C");
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl-C");
        Ok(self.shutdown_all_services().await)
    }

    /// Drain the registry once `signal` resolves. Lets callers race the
    /// signal against their own work.
    pub async fn shutdown_on<F>(self, signal: F) -> ShutdownOutcome
    where
        F: Future<Output = ()>,
    {
        signal.await;
        self.shutdown_all_services().await
    }

    /// Perform graceful shutdown operations
    pub async fn shutdown_all_services(self) -> ShutdownOutcome {
        let live_workflows = self.registry.live_count().await;
        info!(
            grace_seconds = self.grace.as_secs_f64(),
            live_workflows,
            "Initiating graceful shutdown of all workflows..."
        );

        let outcome = self.registry.shutdown(self.grace).await;
        match &outcome {
            ShutdownOutcome::Clean => info!("Graceful shutdown completed successfully"),
            ShutdownOutcome::Forced { aborted } => warn!(
                aborted = aborted.len(),
                "Shutdown grace period elapsed; remaining workflows were aborted"
            ),
        }

        for stats in self.registry.stage_stats() {
            info!(
                stage = %stats.stage,
                total_executions = stats.total_executions,
                success_rate = stats.success_rate,
                total_resource_units = stats.total_resource_units,
                "Final stage statistics"
            );
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryHealth, RegistrySettings};
    use crate::stages::{Payload, ScriptedStage, StageResult, StageSet};

    #[tokio::test]
    async fn test_shutdown_on_signal_drains_registry() {
        let ok = |action: &str| StageResult::success(Payload::new()).with_next_action(action);
        let stages = StageSet::new(
            ScriptedStage::hanging(),
            ScriptedStage::always(ok("begin_implementation")),
            ScriptedStage::always(ok("tasks_exhausted")),
            ScriptedStage::always(ok("approve")),
        );
        let registry = Arc::new(WorkflowRegistry::new(stages, RegistrySettings::default()));
        registry.start("never finishes").await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let coordinator = ShutdownCoordinator::new(Arc::clone(&registry), Duration::from_secs(5));
        let drained = tokio::spawn(coordinator.shutdown_on(async {
            let _ = rx.await;
        }));

        assert_eq!(registry.health().await, RegistryHealth::Healthy);
        tx.send(()).unwrap();

        assert_eq!(drained.await.unwrap(), ShutdownOutcome::Clean);
        assert_eq!(registry.health().await, RegistryHealth::ShuttingDown);
        assert_eq!(registry.live_count().await, 0);
    }
}
