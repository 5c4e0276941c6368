//! Routing table: decides where a workflow goes after each stage.
//!
//! The reserved `next_action` payload key is parsed into a closed enum per
//! stage, so an action the stage does not define can never be mistaken for a
//! valid edge. Anything unparseable is a routing fault and ends the workflow.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::errors::{FaultCode, WorkflowFault};
use crate::stages::{StageKind, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeAction {
    AwaitUserResponses,
    ProceedToPlanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerAction {
    BeginImplementation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementerAction {
    /// A task was implemented; the reviewer decides what comes next.
    ContinueImplementation,
    TasksExhausted,
    /// Quality gate failed; implement the same task again.
    ReviseCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerAction {
    Approve,
    ContinueImplementation,
}

/// A recognised `next_action`, tagged by the stage that emitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Intake(IntakeAction),
    Planner(PlannerAction),
    Implementer(ImplementerAction),
    Reviewer(ReviewerAction),
}

/// Why the raw `next_action` could not be turned into a [`NextAction`].
#[derive(Debug, Clone, PartialEq)]
pub enum ActionError {
    Missing,
    Unrecognized(Value),
}

fn parse_as<T: DeserializeOwned>(raw: &Value) -> Result<T, ActionError> {
    match raw {
        Value::String(_) => serde_json::from_value(raw.clone())
            .map_err(|_| ActionError::Unrecognized(raw.clone())),
        _ => Err(ActionError::Unrecognized(raw.clone())),
    }
}

impl NextAction {
    pub fn parse(stage: StageKind, raw: Option<&Value>) -> Result<Self, ActionError> {
        let raw = raw.ok_or(ActionError::Missing)?;
        match stage {
            StageKind::Intake => parse_as(raw).map(NextAction::Intake),
            StageKind::Planner => parse_as(raw).map(NextAction::Planner),
            StageKind::Implementer => parse_as(raw).map(NextAction::Implementer),
            StageKind::Reviewer => parse_as(raw).map(NextAction::Reviewer),
        }
    }

    /// Whether this action is a retry edge that a failed result may take.
    fn is_revision(&self) -> bool {
        matches!(self, NextAction::Implementer(ImplementerAction::ReviseCode))
    }
}

/// Outcome of consulting the routing table.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Advance(StageKind),
    Retry,
    Complete,
    Fail(WorkflowFault),
}

/// Pure routing decision for `result` produced by `stage`.
pub fn route(stage: StageKind, result: &StageResult) -> Route {
    let action = match NextAction::parse(stage, result.next_action()) {
        Ok(action) => action,
        Err(ActionError::Unrecognized(raw)) => {
            return Route::Fail(WorkflowFault::new(
                FaultCode::RoutingFault,
                format!("{stage} returned unrecognized next_action {raw}"),
            ));
        }
        Err(ActionError::Missing) if result.is_success() => {
            return Route::Fail(WorkflowFault::new(
                FaultCode::RoutingFault,
                format!("{stage} returned no next_action"),
            ));
        }
        Err(ActionError::Missing) => return stage_failed(stage, result),
    };

    if !result.is_success() && !action.is_revision() {
        return stage_failed(stage, result);
    }

    match action {
        NextAction::Intake(IntakeAction::AwaitUserResponses) => Route::Retry,
        NextAction::Intake(IntakeAction::ProceedToPlanning) => Route::Advance(StageKind::Planner),
        NextAction::Planner(PlannerAction::BeginImplementation) => {
            Route::Advance(StageKind::Implementer)
        }
        NextAction::Implementer(ImplementerAction::ContinueImplementation)
        | NextAction::Implementer(ImplementerAction::TasksExhausted) => {
            Route::Advance(StageKind::Reviewer)
        }
        NextAction::Implementer(ImplementerAction::ReviseCode) => Route::Retry,
        NextAction::Reviewer(ReviewerAction::Approve) => Route::Complete,
        NextAction::Reviewer(ReviewerAction::ContinueImplementation) => {
            Route::Advance(StageKind::Implementer)
        }
    }
}

fn stage_failed(stage: StageKind, result: &StageResult) -> Route {
    Route::Fail(WorkflowFault::new(
        FaultCode::StageFailed,
        format!(
            "{stage} failed: {}",
            result.error().unwrap_or("no error reported")
        ),
    ))
}

/// Per-stage bounds on retry edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryLimits {
    pub intake: u32,
    pub implementer: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            intake: 5,
            implementer: 3,
        }
    }
}

impl RetryLimits {
    pub fn for_stage(&self, stage: StageKind) -> u32 {
        match stage {
            StageKind::Intake => self.intake,
            StageKind::Implementer => self.implementer,
            // No retry edges leave these stages.
            StageKind::Planner | StageKind::Reviewer => 0,
        }
    }
}

/// Counts consecutive retries per stage against [`RetryLimits`].
#[derive(Debug, Clone, Default)]
pub struct RetryBudget {
    limits: RetryLimits,
    used: HashMap<StageKind, u32>,
}

impl RetryBudget {
    pub fn new(limits: RetryLimits) -> Self {
        Self {
            limits,
            used: HashMap::new(),
        }
    }

    pub fn used(&self, stage: StageKind) -> u32 {
        self.used.get(&stage).copied().unwrap_or(0)
    }

    /// Spend one retry. Fails without spending once the limit is reached,
    /// so the counter never exceeds the limit.
    pub fn consume(&mut self, stage: StageKind) -> Result<u32, WorkflowFault> {
        let limit = self.limits.for_stage(stage);
        let used = self.used(stage);
        if used >= limit {
            return Err(WorkflowFault::new(
                FaultCode::RetryLimitExceeded,
                format!("{stage} exhausted its {limit} allowed retries"),
            ));
        }
        self.used.insert(stage, used + 1);
        Ok(used + 1)
    }

    /// Forget the retries of a stage the workflow has moved past.
    pub fn reset(&mut self, stage: StageKind) {
        self.used.remove(&stage);
    }
}
