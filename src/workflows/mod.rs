// Workflow engine: record lifecycle, routing table and the orchestrator loop

pub mod errors;
pub mod orchestrator;
pub mod record;
pub mod routing;

pub use errors::{FaultCode, WorkflowError, WorkflowFault};
pub use orchestrator::{WorkflowLimits, WorkflowRun};
pub use record::{WorkflowId, WorkflowRecord, WorkflowSnapshot, WorkflowStatus};
pub use routing::{route, NextAction, RetryBudget, RetryLimits, Route};
