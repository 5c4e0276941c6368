use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::record::{WorkflowId, WorkflowStatus};

/// Machine-readable reason a workflow ended badly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultCode {
    StageFailed,
    RoutingFault,
    RetryLimitExceeded,
    IterationLimitExceeded,
    InternalStageFault,
    InternalFault,
    TimedOut,
    Cancelled,
    ShutdownForced,
}

impl FaultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::StageFailed => "stage_failed",
            FaultCode::RoutingFault => "routing_fault",
            FaultCode::RetryLimitExceeded => "retry_limit_exceeded",
            FaultCode::IterationLimitExceeded => "iteration_limit_exceeded",
            FaultCode::InternalStageFault => "internal_stage_fault",
            FaultCode::InternalFault => "internal_fault",
            FaultCode::TimedOut => "timed_out",
            FaultCode::Cancelled => "cancelled",
            FaultCode::ShutdownForced => "shutdown_forced",
        }
    }

    /// Terminal status a workflow settles into for this fault.
    pub fn terminal_status(&self) -> WorkflowStatus {
        match self {
            FaultCode::TimedOut => WorkflowStatus::TimedOut,
            _ => WorkflowStatus::Failed,
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault plus the human-readable detail recorded in the error log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowFault {
    pub code: FaultCode,
    pub detail: String,
}

impl WorkflowFault {
    pub fn new(code: FaultCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// Entry appended to the record's error log.
    pub fn log_entry(&self) -> String {
        format!("{}: {}", self.code, self.detail)
    }
}

impl fmt::Display for WorkflowFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_entry())
    }
}

/// Record-level invariant violations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow {id}: status transition {from:?} -> {to:?} is not allowed")]
    InvalidTransition {
        id: WorkflowId,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("workflow {id} is already terminal ({status:?})")]
    AlreadyTerminal { id: WorkflowId, status: WorkflowStatus },
}
