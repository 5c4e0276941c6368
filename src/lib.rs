// Conductor Library - staged workflow orchestration
// This exposes the core components for testing and integration

pub mod config;
pub mod registry;
pub mod shutdown;
pub mod stages;
pub mod telemetry;
pub mod workflows;

// Re-export key types for easy access
pub use config::{config, init_config, ConductorConfig, ObservabilityConfig, OrchestratorConfig};
pub use registry::{
    RegistryError, RegistryHealth, RegistrySettings, ShutdownOutcome, WorkflowRegistry,
};
pub use shutdown::ShutdownCoordinator;
pub use stages::demo::{demo_stage_set, DemoOptions, MAX_DEMO_TASKS};
pub use stages::{
    Payload, ScriptStep, ScriptedStage, Stage, StageContext, StageInput, StageKind, StageResult,
    StageSet, StageStats,
};
pub use telemetry::{
    create_workflow_span, generate_correlation_id, init_telemetry, shutdown_telemetry,
};
pub use workflows::{
    FaultCode, RetryLimits, WorkflowError, WorkflowId, WorkflowLimits, WorkflowSnapshot,
    WorkflowStatus,
};
