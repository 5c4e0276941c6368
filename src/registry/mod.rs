//! Registry of active workflows.
//!
//! Owns the join handle, snapshot feed and response channel of every workflow
//! it started. Callers only ever see [`WorkflowSnapshot`]s; the live record
//! stays inside its orchestrator loop.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::stages::{Payload, StageSet, StageStats};
use crate::workflows::{
    FaultCode, WorkflowFault, WorkflowId, WorkflowLimits, WorkflowRecord, WorkflowRun,
    WorkflowSnapshot, WorkflowStatus,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("workflow capacity reached: {limit} workflows already active")]
    Capacity { limit: usize },

    #[error("registry is shutting down and accepts no new workflows")]
    ShuttingDown,

    #[error("workflow {id} not found")]
    NotFound { id: WorkflowId },

    #[error("workflow {id} already finished with status {status}")]
    AlreadyTerminal { id: WorkflowId, status: WorkflowStatus },

    #[error("workflow {id} is still {status}")]
    StillActive { id: WorkflowId, status: WorkflowStatus },
}

/// Result of [`WorkflowRegistry::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// Every loop settled on its own within the grace period.
    Clean,
    /// These loops were still running at the deadline and were aborted.
    Forced { aborted: Vec<WorkflowId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryHealth {
    Healthy,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_concurrent_workflows: usize,
    pub limits: WorkflowLimits,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for RegistrySettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_concurrent_workflows: config.max_concurrent_workflows,
            limits: config.workflow_limits(),
        }
    }
}

struct RegistryEntry {
    snapshots: Arc<watch::Sender<WorkflowSnapshot>>,
    responses: mpsc::UnboundedSender<Payload>,
    /// Taken by shutdown so every loop is joined exactly once.
    handle: Option<JoinHandle<WorkflowSnapshot>>,
}

impl RegistryEntry {
    fn snapshot(&self) -> WorkflowSnapshot {
        self.snapshots.borrow().clone()
    }

    fn status(&self) -> WorkflowStatus {
        self.snapshots.borrow().status
    }
}

struct RegistryState {
    accepting: bool,
    entries: HashMap<WorkflowId, RegistryEntry>,
}

impl RegistryState {
    fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| !entry.status().is_terminal())
            .count()
    }

    fn entry(&self, id: WorkflowId) -> Result<&RegistryEntry, RegistryError> {
        self.entries.get(&id).ok_or(RegistryError::NotFound { id })
    }
}

pub struct WorkflowRegistry {
    state: RwLock<RegistryState>,
    stages: Arc<StageSet>,
    settings: RegistrySettings,
    shutdown: watch::Sender<bool>,
}

impl WorkflowRegistry {
    /// Build a registry running every workflow on `stages`. Stage statistics
    /// are tracked for all of them.
    pub fn new(stages: StageSet, settings: RegistrySettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: RwLock::new(RegistryState {
                accepting: true,
                entries: HashMap::new(),
            }),
            stages: Arc::new(stages.with_stats_tracking()),
            settings,
            shutdown,
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Start a workflow for `request` and return its id without waiting for it.
    pub async fn start(&self, request: impl Into<String>) -> Result<WorkflowId, RegistryError> {
        self.spawn_workflow(request.into(), None).await
    }

    pub async fn start_for_user(
        &self,
        request: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Result<WorkflowId, RegistryError> {
        self.spawn_workflow(request.into(), Some(user_id.into()))
            .await
    }

    async fn spawn_workflow(
        &self,
        request: String,
        user_id: Option<String>,
    ) -> Result<WorkflowId, RegistryError> {
        // Capacity check and insertion share one write lock.
        let mut state = self.state.write().await;

        if !state.accepting {
            warn!("Rejected workflow start: registry is shutting down");
            return Err(RegistryError::ShuttingDown);
        }

        let limit = self.settings.max_concurrent_workflows;
        let live = state.live_count();
        if live >= limit {
            warn!(live, limit, "Rejected workflow start: capacity reached");
            return Err(RegistryError::Capacity { limit });
        }

        let record = WorkflowRecord::new(request, user_id);
        let id = record.id();
        let (snapshots, _) = watch::channel(record.snapshot());
        let snapshots = Arc::new(snapshots);
        let (responses, responses_rx) = mpsc::unbounded_channel();

        let run = WorkflowRun::new(
            record,
            Arc::clone(&self.stages),
            self.settings.limits.clone(),
            Arc::clone(&snapshots),
            self.shutdown.subscribe(),
            responses_rx,
        );
        let handle = tokio::spawn(run.run());

        state.entries.insert(
            id,
            RegistryEntry {
                snapshots,
                responses,
                handle: Some(handle),
            },
        );

        info!(workflow_id = %id, live = live + 1, limit, "Workflow scheduled");
        Ok(id)
    }

    pub async fn status(&self, id: WorkflowId) -> Result<WorkflowSnapshot, RegistryError> {
        let state = self.state.read().await;
        state.entry(id).map(RegistryEntry::snapshot)
    }

    /// Snapshots of every known workflow, oldest first.
    pub async fn list(&self) -> Vec<WorkflowSnapshot> {
        let state = self.state.read().await;
        let mut snapshots: Vec<WorkflowSnapshot> =
            state.entries.values().map(RegistryEntry::snapshot).collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    /// Progress feed for one workflow. Intermediate snapshots may be skipped;
    /// the terminal one is always the last value seen.
    pub async fn subscribe(
        &self,
        id: WorkflowId,
    ) -> Result<watch::Receiver<WorkflowSnapshot>, RegistryError> {
        let state = self.state.read().await;
        state.entry(id).map(|entry| entry.snapshots.subscribe())
    }

    /// Deliver user answers; Intake sees them on its next call.
    pub async fn respond(&self, id: WorkflowId, responses: Payload) -> Result<(), RegistryError> {
        let state = self.state.read().await;
        let entry = state.entry(id)?;

        let status = entry.status();
        if status.is_terminal() {
            return Err(RegistryError::AlreadyTerminal { id, status });
        }

        entry.responses.send(responses).map_err(|_| {
            // The loop has exited between the status read and the send.
            RegistryError::AlreadyTerminal {
                id,
                status: entry.status(),
            }
        })?;

        info!(workflow_id = %id, "User responses queued");
        Ok(())
    }

    /// Forget a terminal workflow and return its final snapshot.
    pub async fn remove(&self, id: WorkflowId) -> Result<WorkflowSnapshot, RegistryError> {
        let mut state = self.state.write().await;
        let status = state.entry(id)?.status();
        if !status.is_terminal() {
            return Err(RegistryError::StillActive { id, status });
        }

        let entry = state
            .entries
            .remove(&id)
            .ok_or(RegistryError::NotFound { id })?;
        info!(workflow_id = %id, status = %status, "Workflow removed");
        Ok(entry.snapshot())
    }

    /// Evict every terminal workflow. Returns how many were removed.
    pub async fn prune_terminal(&self) -> usize {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| !entry.status().is_terminal());
        let pruned = before - state.entries.len();
        if pruned > 0 {
            info!(pruned, remaining = state.entries.len(), "Pruned terminal workflows");
        }
        pruned
    }

    /// Workflows not yet in a terminal status.
    pub async fn live_count(&self) -> usize {
        self.state.read().await.live_count()
    }

    /// Every workflow still held, terminal ones included.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn health(&self) -> RegistryHealth {
        if self.state.read().await.accepting {
            RegistryHealth::Healthy
        } else {
            RegistryHealth::ShuttingDown
        }
    }

    pub fn stage_stats(&self) -> Vec<StageStats> {
        self.stages.stats()
    }

    /// Stop accepting work, signal every loop and wait for them until
    /// `now + grace`. Loops still running at the deadline are aborted and
    /// their snapshot settles `Failed` with `shutdown_forced`.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        let deadline = Instant::now() + grace;

        let pending = {
            let mut state = self.state.write().await;
            state.accepting = false;
            self.shutdown.send_replace(true);

            state
                .entries
                .iter_mut()
                .filter_map(|(id, entry)| {
                    entry
                        .handle
                        .take()
                        .map(|handle| (*id, handle, Arc::clone(&entry.snapshots)))
                })
                .collect::<Vec<_>>()
        };

        info!(
            workflows = pending.len(),
            grace_ms = grace.as_millis() as u64,
            "Shutting down workflow registry"
        );

        let mut aborted = Vec::new();
        for (id, mut handle, snapshots) in pending {
            // A loop still reading Pending has never been polled; its first
            // poll sees the shutdown signal and settles without awaiting.
            let never_started = snapshots.borrow().status == WorkflowStatus::Pending;
            let joined = if never_started {
                Some((&mut handle).await)
            } else if Instant::now() >= deadline && !handle.is_finished() {
                None
            } else {
                timeout_at(deadline, &mut handle).await.ok()
            };

            match joined {
                Some(Ok(snapshot)) => {
                    info!(workflow_id = %id, status = %snapshot.status, "Workflow loop joined");
                }
                Some(Err(e)) => {
                    error!(workflow_id = %id, error = %e, "Workflow loop ended abnormally");
                    let fault = WorkflowFault::new(
                        FaultCode::InternalFault,
                        format!("workflow loop ended abnormally: {e}"),
                    );
                    snapshots.send_if_modified(|snapshot| snapshot.force_settle(&fault));
                }
                None => {
                    handle.abort();
                    let _ = handle.await;
                    let fault = WorkflowFault::new(
                        FaultCode::ShutdownForced,
                        "workflow aborted when the shutdown grace period elapsed",
                    );
                    if !snapshots.send_if_modified(|snapshot| snapshot.force_settle(&fault)) {
                        let status = snapshots.borrow().status;
                        warn!(workflow_id = %id, status = %status, "Aborted workflow was not running; snapshot left as is");
                    }
                    warn!(workflow_id = %id, "Workflow loop aborted at shutdown deadline");
                    aborted.push(id);
                }
            }
        }

        if aborted.is_empty() {
            info!("Workflow registry shut down cleanly");
            ShutdownOutcome::Clean
        } else {
            warn!(aborted = aborted.len(), "Workflow registry shutdown was forced");
            ShutdownOutcome::Forced { aborted }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{ScriptedStage, StageResult};

    fn ok(action: &str) -> StageResult {
        StageResult::success(Payload::new()).with_next_action(action)
    }

    fn completing_stages() -> StageSet {
        StageSet::new(
            ScriptedStage::always(ok("proceed_to_planning")),
            ScriptedStage::always(ok("begin_implementation")),
            ScriptedStage::always(ok("tasks_exhausted")),
            ScriptedStage::always(ok("approve")),
        )
    }

    fn hanging_stages() -> StageSet {
        StageSet::new(
            ScriptedStage::hanging(),
            ScriptedStage::always(ok("begin_implementation")),
            ScriptedStage::always(ok("tasks_exhausted")),
            ScriptedStage::always(ok("approve")),
        )
    }

    fn settings(max: usize) -> RegistrySettings {
        RegistrySettings {
            max_concurrent_workflows: max,
            limits: WorkflowLimits::default(),
        }
    }

    async fn wait_terminal(registry: &WorkflowRegistry, id: WorkflowId) -> WorkflowSnapshot {
        let mut feed = registry.subscribe(id).await.unwrap();
        let snapshot = feed.wait_for(WorkflowSnapshot::is_terminal).await.unwrap();
        snapshot.clone()
    }

    async fn wait_in_stage(registry: &WorkflowRegistry, id: WorkflowId) {
        let mut feed = registry.subscribe(id).await.unwrap();
        feed.wait_for(|s| s.stage_invocations >= 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_rejects_without_creating_a_record() {
        let registry = WorkflowRegistry::new(hanging_stages(), settings(2));

        registry.start("one").await.unwrap();
        registry.start("two").await.unwrap();
        let err = registry.start("three").await.unwrap_err();

        assert_eq!(err, RegistryError::Capacity { limit: 2 });
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.live_count().await, 2);
    }

    #[tokio::test]
    async fn test_terminal_workflows_free_capacity() {
        let registry = WorkflowRegistry::new(completing_stages(), settings(1));

        let first = registry.start("one").await.unwrap();
        let done = wait_terminal(&registry, first).await;
        assert_eq!(done.status, WorkflowStatus::Completed);

        let second = registry.start("two").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let registry = WorkflowRegistry::new(completing_stages(), settings(5));
        let id = WorkflowId::new();

        assert_eq!(
            registry.status(id).await.unwrap_err(),
            RegistryError::NotFound { id }
        );
        assert!(registry.subscribe(id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_creation() {
        let registry = WorkflowRegistry::new(completing_stages(), settings(5));
        let first = registry.start("one").await.unwrap();
        let second = registry.start("two").await.unwrap();
        let third = registry.start("three").await.unwrap();

        let listed: Vec<String> = registry
            .list()
            .await
            .into_iter()
            .map(|s| s.request)
            .collect();

        assert_eq!(listed, vec!["one", "two", "three"]);
        for id in [first, second, third] {
            wait_terminal(&registry, id).await;
        }
    }

    #[tokio::test]
    async fn test_remove_only_terminal_workflows() {
        let registry = WorkflowRegistry::new(hanging_stages(), settings(5));
        let id = registry.start("stuck").await.unwrap();

        assert!(matches!(
            registry.remove(id).await,
            Err(RegistryError::StillActive { .. })
        ));
        assert_eq!(registry.prune_terminal().await, 0);

        registry.shutdown(Duration::from_secs(1)).await;

        let removed = registry.remove(id).await.unwrap();
        assert!(removed.is_terminal());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_respond_rejects_terminal_workflow() {
        let registry = WorkflowRegistry::new(completing_stages(), settings(5));
        let id = registry.start("quick").await.unwrap();
        wait_terminal(&registry, id).await;

        let err = registry.respond(id, Payload::new()).await.unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_cancels_in_flight_work() {
        let registry = WorkflowRegistry::new(hanging_stages(), settings(5));
        let id = registry.start("stuck").await.unwrap();
        wait_in_stage(&registry, id).await;

        let outcome = registry.shutdown(Duration::from_secs(5)).await;

        assert_eq!(outcome, ShutdownOutcome::Clean);
        let snapshot = registry.status(id).await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Failed);
        assert_eq!(snapshot.failure, Some(FaultCode::Cancelled));
        assert_eq!(registry.health().await, RegistryHealth::ShuttingDown);
        assert_eq!(
            registry.start("late").await.unwrap_err(),
            RegistryError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_zero_grace_forces_and_settles_loops() {
        let registry = WorkflowRegistry::new(hanging_stages(), settings(5));
        let id = registry.start("stuck").await.unwrap();
        wait_in_stage(&registry, id).await;

        // The deadline has passed before the loop could observe the signal.
        let outcome = registry.shutdown(Duration::ZERO).await;

        assert_eq!(outcome, ShutdownOutcome::Forced { aborted: vec![id] });
        let snapshot = registry.status(id).await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Failed);
        assert_eq!(snapshot.failure, Some(FaultCode::ShutdownForced));
    }

    #[tokio::test]
    async fn test_zero_grace_right_after_start_still_runs_the_lifecycle() {
        let registry = WorkflowRegistry::new(hanging_stages(), settings(5));
        let id = registry.start("never polled").await.unwrap();

        let outcome = registry.shutdown(Duration::ZERO).await;

        assert_eq!(outcome, ShutdownOutcome::Clean);
        let snapshot = registry.status(id).await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatus::Failed);
        assert_eq!(snapshot.failure, Some(FaultCode::Cancelled));
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_stage_stats_are_tracked() {
        let registry = WorkflowRegistry::new(completing_stages(), settings(5));
        let id = registry.start("count me").await.unwrap();
        wait_terminal(&registry, id).await;

        let stats = registry.stage_stats();
        assert_eq!(stats.len(), 4);
        assert!(stats.iter().all(|s| s.total_executions == 1));
    }
}
