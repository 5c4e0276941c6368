//! Stage contract consumed by the orchestrator.
//!
//! A stage is an opaque unit of work (requirements intake, planning,
//! implementation, review). It receives the originating request plus every
//! earlier stage payload and answers with exactly one [`StageResult`]. Stages
//! never touch the workflow record; the orchestrator applies their results.

pub mod demo;
pub mod result;
pub mod scripted;
pub mod stats;

pub use result::{Payload, StageResult, NEXT_ACTION_KEY};
pub use scripted::{ScriptStep, ScriptedStage};
pub use stats::{StageStats, StageStatus, StatsHandle, StatsTracking};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::workflows::WorkflowId;

/// Pipeline phases, in routing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Intake,
    Planner,
    Implementer,
    Reviewer,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Intake,
        StageKind::Planner,
        StageKind::Implementer,
        StageKind::Reviewer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Intake => "intake",
            StageKind::Planner => "planner",
            StageKind::Implementer => "implementer",
            StageKind::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a stage may read about the workflow it serves.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageInput {
    pub request: String,
    /// Last payload of every stage that has already run.
    pub payloads: BTreeMap<StageKind, Payload>,
    /// User responses delivered since the previous stage call.
    pub responses: Vec<Payload>,
}

impl StageInput {
    pub fn payload(&self, stage: StageKind) -> Option<&Payload> {
        self.payloads.get(&stage)
    }
}

/// Per-invocation metadata handed alongside the input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageContext {
    pub workflow_id: WorkflowId,
    pub stage: StageKind,
    /// Consecutive retries of this stage so far; 0 on first entry.
    pub attempt: u32,
    /// 1-based count of stage calls made by this workflow.
    pub invocation: u32,
    pub correlation_id: String,
}

/// Uniform stage contract.
///
/// Business failures are reported as `Ok(StageResult::failure(..))`. An `Err`
/// is an unexpected fault; the orchestrator records it as an internal stage
/// fault and fails the workflow.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Stage: Send + Sync {
    async fn execute(&self, input: StageInput, context: StageContext)
        -> anyhow::Result<StageResult>;
}

/// One stage implementation per [`StageKind`].
#[derive(Clone)]
pub struct StageSet {
    intake: Arc<dyn Stage>,
    planner: Arc<dyn Stage>,
    implementer: Arc<dyn Stage>,
    reviewer: Arc<dyn Stage>,
    stats: Vec<StatsHandle>,
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSet")
            .field("stats_tracking", &!self.stats.is_empty())
            .finish()
    }
}

impl StageSet {
    pub fn new(
        intake: impl Stage + 'static,
        planner: impl Stage + 'static,
        implementer: impl Stage + 'static,
        reviewer: impl Stage + 'static,
    ) -> Self {
        Self::from_arcs(
            Arc::new(intake),
            Arc::new(planner),
            Arc::new(implementer),
            Arc::new(reviewer),
        )
    }

    pub fn from_arcs(
        intake: Arc<dyn Stage>,
        planner: Arc<dyn Stage>,
        implementer: Arc<dyn Stage>,
        reviewer: Arc<dyn Stage>,
    ) -> Self {
        Self {
            intake,
            planner,
            implementer,
            reviewer,
            stats: Vec::new(),
        }
    }

    pub fn get(&self, kind: StageKind) -> Arc<dyn Stage> {
        match kind {
            StageKind::Intake => Arc::clone(&self.intake),
            StageKind::Planner => Arc::clone(&self.planner),
            StageKind::Implementer => Arc::clone(&self.implementer),
            StageKind::Reviewer => Arc::clone(&self.reviewer),
        }
    }

    /// Wrap every stage in a [`StatsTracking`] decorator.
    ///
    /// Calling this twice keeps the first set of statistics.
    pub fn with_stats_tracking(mut self) -> Self {
        if !self.stats.is_empty() {
            return self;
        }

        let mut handles = Vec::with_capacity(StageKind::ALL.len());
        for kind in StageKind::ALL {
            let tracked = StatsTracking::wrap(kind, self.get(kind));
            handles.push(tracked.handle());
            let tracked: Arc<dyn Stage> = Arc::new(tracked);
            match kind {
                StageKind::Intake => self.intake = tracked,
                StageKind::Planner => self.planner = tracked,
                StageKind::Implementer => self.implementer = tracked,
                StageKind::Reviewer => self.reviewer = tracked,
            }
        }
        self.stats = handles;
        self
    }

    /// Statistics of every tracked stage, empty when tracking is off.
    pub fn stats(&self) -> Vec<StageStats> {
        self.stats.iter().map(StatsHandle::snapshot).collect()
    }

    pub fn reset_stats(&self) {
        for handle in &self.stats {
            handle.reset();
        }
    }
}
