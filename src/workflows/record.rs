use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::errors::{FaultCode, WorkflowError, WorkflowFault};
use crate::stages::{Payload, StageKind, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(raw).map(Self)
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::TimedOut
        )
    }

    /// Allowed lifecycle edges. Every terminal status is reached from `Running`.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::TimedOut => "timed_out",
        };
        f.pad(name)
    }
}

/// Live state of one workflow. Owned and mutated by exactly one
/// orchestrator loop; everyone else sees [`WorkflowSnapshot`]s.
#[derive(Debug, Clone)]
pub struct WorkflowRecord {
    id: WorkflowId,
    request: String,
    user_id: Option<String>,
    current_stage: Option<StageKind>,
    status: WorkflowStatus,
    stage_payloads: BTreeMap<StageKind, Payload>,
    errors: Vec<String>,
    total_resource_units: u64,
    stage_invocations: u32,
    failure: Option<FaultCode>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// Point-in-time copy of a [`WorkflowRecord`] handed to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: WorkflowId,
    pub request: String,
    pub user_id: Option<String>,
    pub status: WorkflowStatus,
    pub current_stage: Option<StageKind>,
    pub stage_payloads: BTreeMap<StageKind, Payload>,
    pub total_resource_units: u64,
    pub stage_invocations: u32,
    pub errors: Vec<String>,
    pub failure: Option<FaultCode>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Settle a snapshot whose loop is gone without having settled it.
    /// Only a `Running` snapshot can be settled; returns false otherwise.
    pub(crate) fn force_settle(&mut self, fault: &WorkflowFault) -> bool {
        if !self.status.can_transition_to(fault.code.terminal_status()) {
            return false;
        }
        self.status = fault.code.terminal_status();
        self.failure = Some(fault.code);
        self.errors.push(fault.log_entry());
        self.completed_at = Some(Utc::now());
        true
    }
}

impl WorkflowRecord {
    pub fn new(request: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            request: request.into(),
            user_id,
            current_stage: None,
            status: WorkflowStatus::Pending,
            stage_payloads: BTreeMap::new(),
            errors: Vec::new(),
            total_resource_units: 0,
            stage_invocations: 0,
            failure: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn status(&self) -> WorkflowStatus {
        self.status
    }

    pub fn current_stage(&self) -> Option<StageKind> {
        self.current_stage
    }

    pub fn stage_payloads(&self) -> &BTreeMap<StageKind, Payload> {
        &self.stage_payloads
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn total_resource_units(&self) -> u64 {
        self.total_resource_units
    }

    pub fn stage_invocations(&self) -> u32 {
        self.stage_invocations
    }

    fn transition(&mut self, next: WorkflowStatus) -> Result<(), WorkflowError> {
        if self.status.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        if !self.status.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// `Pending -> Running`.
    pub fn begin(&mut self) -> Result<(), WorkflowError> {
        self.transition(WorkflowStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn enter_stage(&mut self, stage: StageKind) {
        self.current_stage = Some(stage);
    }

    pub fn count_invocation(&mut self) -> u32 {
        self.stage_invocations += 1;
        self.stage_invocations
    }

    /// Fold a stage result into the record: payload, usage and error log.
    pub fn apply_result(&mut self, stage: StageKind, result: &StageResult) {
        self.total_resource_units = self
            .total_resource_units
            .saturating_add(result.resource_units());
        if let Some(error) = result.error() {
            self.errors.push(format!("{stage} stage failed: {error}"));
        }
        self.stage_payloads
            .insert(stage, result.payload().clone());
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn complete(&mut self) -> Result<(), WorkflowError> {
        self.transition(WorkflowStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Settle into the terminal status matching `fault` and log it.
    pub fn fail(&mut self, fault: &WorkflowFault) -> Result<(), WorkflowError> {
        self.transition(fault.code.terminal_status())?;
        self.failure = Some(fault.code);
        self.errors.push(fault.log_entry());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            id: self.id,
            request: self.request.clone(),
            user_id: self.user_id.clone(),
            status: self.status,
            current_stage: self.current_stage,
            stage_payloads: self.stage_payloads.clone(),
            total_resource_units: self.total_resource_units,
            stage_invocations: self.stage_invocations,
            errors: self.errors.clone(),
            failure: self.failure,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}
