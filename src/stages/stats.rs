//! Execution statistics decorator for any [`Stage`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::workflows::WorkflowId;

use super::{Stage, StageContext, StageInput, StageKind, StageResult};

/// Last observed state of a tracked stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Idle,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
struct ExecutionStats {
    status: StageStatus,
    total_executions: u64,
    total_time: Duration,
    total_resource_units: u64,
    success_count: u64,
    error_count: u64,
}

impl Default for ExecutionStats {
    fn default() -> Self {
        Self {
            status: StageStatus::Idle,
            total_executions: 0,
            total_time: Duration::ZERO,
            total_resource_units: 0,
            success_count: 0,
            error_count: 0,
        }
    }
}

/// Serializable view of one stage's statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub stage: StageKind,
    pub status: StageStatus,
    pub total_executions: u64,
    pub total_time_ms: u64,
    pub total_resource_units: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub average_execution_ms: f64,
    pub success_rate: f64,
}

/// Shared read access to a decorator's statistics.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    stage: StageKind,
    stats: Arc<Mutex<ExecutionStats>>,
}

impl StatsHandle {
    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn snapshot(&self) -> StageStats {
        let stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let total_time_ms = stats.total_time.as_millis() as u64;
        let (average_execution_ms, success_rate) = if stats.total_executions > 0 {
            (
                stats.total_time.as_secs_f64() * 1000.0 / stats.total_executions as f64,
                stats.success_count as f64 / stats.total_executions as f64,
            )
        } else {
            (0.0, 0.0)
        };

        StageStats {
            stage: self.stage,
            status: stats.status,
            total_executions: stats.total_executions,
            total_time_ms,
            total_resource_units: stats.total_resource_units,
            success_count: stats.success_count,
            error_count: stats.error_count,
            average_execution_ms,
            success_rate,
        }
    }

    pub fn reset(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = ExecutionStats::default();
    }

    fn update(&self, apply: impl FnOnce(&mut ExecutionStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut stats);
    }
}

/// Counts an execution that never reported back, e.g. because the caller
/// dropped the future at a deadline or shutdown.
struct InFlight<'a> {
    handle: &'a StatsHandle,
    workflow_id: WorkflowId,
    started: Instant,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let elapsed = self.started.elapsed();
        self.handle.update(|stats| {
            stats.total_executions += 1;
            stats.total_time += elapsed;
            stats.error_count += 1;
            stats.status = StageStatus::Error;
        });
        warn!(
            workflow_id = %self.workflow_id,
            stage = %self.handle.stage,
            execution_ms = elapsed.as_millis() as u64,
            "Stage execution cancelled"
        );
    }
}

/// Wraps a stage and records executions, timings and resource usage.
///
/// The wrapped stage's behaviour is untouched: results and faults pass
/// through unchanged.
pub struct StatsTracking {
    inner: Arc<dyn Stage>,
    handle: StatsHandle,
}

impl StatsTracking {
    pub fn wrap(stage: StageKind, inner: Arc<dyn Stage>) -> Self {
        Self {
            inner,
            handle: StatsHandle {
                stage,
                stats: Arc::new(Mutex::new(ExecutionStats::default())),
            },
        }
    }

    pub fn handle(&self) -> StatsHandle {
        self.handle.clone()
    }
}

#[async_trait]
impl Stage for StatsTracking {
    async fn execute(
        &self,
        input: StageInput,
        context: StageContext,
    ) -> anyhow::Result<StageResult> {
        self.handle.update(|stats| stats.status = StageStatus::Processing);
        let mut in_flight = InFlight {
            handle: &self.handle,
            workflow_id: context.workflow_id,
            started: Instant::now(),
            finished: false,
        };

        let outcome = self.inner.execute(input, context.clone()).await;
        let elapsed = in_flight.started.elapsed();
        in_flight.finished = true;

        let (succeeded, units) = match &outcome {
            Ok(result) => (result.is_success(), result.resource_units()),
            Err(_) => (false, 0),
        };

        self.handle.update(|stats| {
            stats.total_executions += 1;
            stats.total_time += elapsed;
            stats.total_resource_units = stats.total_resource_units.saturating_add(units);
            if succeeded {
                stats.success_count += 1;
                stats.status = StageStatus::Completed;
            } else {
                stats.error_count += 1;
                stats.status = StageStatus::Error;
            }
        });

        match &outcome {
            Ok(result) if result.is_success() => info!(
                workflow_id = %context.workflow_id,
                stage = %self.handle.stage,
                execution_ms = elapsed.as_millis() as u64,
                resource_units = units,
                "Stage execution completed"
            ),
            Ok(result) => error!(
                workflow_id = %context.workflow_id,
                stage = %self.handle.stage,
                execution_ms = elapsed.as_millis() as u64,
                error = result.error().unwrap_or_default(),
                "Stage execution failed"
            ),
            Err(e) => error!(
                workflow_id = %context.workflow_id,
                stage = %self.handle.stage,
                error = %e,
                "Stage execution faulted"
            ),
        }

        outcome
    }
}
