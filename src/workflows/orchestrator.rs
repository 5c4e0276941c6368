// Orchestrator loop - drives one workflow record from Intake to a terminal status
// Single writer: the record lives inside the loop task and leaves it only as snapshots

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn, Instrument};

use super::errors::{FaultCode, WorkflowError, WorkflowFault};
use super::record::{WorkflowRecord, WorkflowSnapshot};
use super::routing::{route, RetryBudget, RetryLimits, Route};
use crate::stages::{Payload, StageContext, StageInput, StageKind, StageResult, StageSet};
use crate::telemetry::{create_workflow_span, generate_correlation_id};

/// Bounds applied to every workflow run.
#[derive(Debug, Clone)]
pub struct WorkflowLimits {
    /// Overall deadline measured from the moment the loop starts.
    pub timeout: Duration,
    pub retry: RetryLimits,
    /// Hard cap on stage calls, catching implementer/reviewer cycles.
    pub max_stage_invocations: u32,
}

impl Default for WorkflowLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            retry: RetryLimits::default(),
            max_stage_invocations: 50,
        }
    }
}

/// How a single stage call ended.
enum Invocation {
    Finished(StageResult),
    Fault(String),
    DeadlineExpired,
    ShutdownRequested,
}

/// How the loop settled.
enum Settlement {
    Completed,
    Faulted(WorkflowFault),
}

/// Resolves once shutdown has been signalled. A dropped sender means nobody
/// can ask for shutdown any more, so the future then never resolves.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// One scheduled workflow: its record, its publishing side and its inputs.
pub struct WorkflowRun {
    record: WorkflowRecord,
    stages: Arc<StageSet>,
    limits: WorkflowLimits,
    retries: RetryBudget,
    publisher: Arc<watch::Sender<WorkflowSnapshot>>,
    shutdown: watch::Receiver<bool>,
    responses: mpsc::UnboundedReceiver<Payload>,
    correlation_id: String,
}

impl WorkflowRun {
    pub fn new(
        record: WorkflowRecord,
        stages: Arc<StageSet>,
        limits: WorkflowLimits,
        publisher: Arc<watch::Sender<WorkflowSnapshot>>,
        shutdown: watch::Receiver<bool>,
        responses: mpsc::UnboundedReceiver<Payload>,
    ) -> Self {
        let retries = RetryBudget::new(limits.retry);
        Self {
            record,
            stages,
            limits,
            retries,
            publisher,
            shutdown,
            responses,
            correlation_id: generate_correlation_id(),
        }
    }

    fn publish(&self) {
        self.publisher.send_replace(self.record.snapshot());
    }

    /// Drive the workflow to a terminal status and return its final snapshot.
    pub async fn run(mut self) -> WorkflowSnapshot {
        let span = create_workflow_span(
            "run_workflow",
            &self.record.id(),
            Some(&self.correlation_id),
        );

        async move {
            let deadline = Instant::now() + self.limits.timeout;

            let settlement = match self.record.begin() {
                Ok(()) => {
                    info!(
                        workflow_id = %self.record.id(),
                        correlation_id = %self.correlation_id,
                        "Workflow started"
                    );
                    self.publish();
                    self.drive(deadline).await
                }
                Err(e) => Err(e),
            };

            self.settle(settlement);
            self.publish();
            self.record.snapshot()
        }
        .instrument(span)
        .await
    }

    fn settle(&mut self, settlement: Result<Settlement, WorkflowError>) {
        let id = self.record.id();
        let outcome = match settlement {
            Ok(Settlement::Completed) => self.record.complete(),
            Ok(Settlement::Faulted(fault)) => self.record.fail(&fault),
            Err(e) => {
                error!(workflow_id = %id, error = %e, "Workflow loop fault");
                self.record
                    .fail(&WorkflowFault::new(FaultCode::InternalFault, e.to_string()))
            }
        };

        if let Err(e) = outcome {
            // Nothing left to transition into; keep the evidence in the log.
            error!(workflow_id = %id, error = %e, "Workflow could not be settled");
            self.record.push_error(format!("internal_fault: {e}"));
        }

        let snapshot = self.record.snapshot();
        match snapshot.failure {
            None => info!(
                workflow_id = %id,
                status = %snapshot.status,
                total_resource_units = snapshot.total_resource_units,
                stage_invocations = snapshot.stage_invocations,
                "Workflow completed"
            ),
            Some(code) => warn!(
                workflow_id = %id,
                status = %snapshot.status,
                failure = %code,
                errors = ?snapshot.errors,
                "Workflow ended without completing"
            ),
        }
    }

    async fn drive(&mut self, deadline: Instant) -> Result<Settlement, WorkflowError> {
        let mut stage = StageKind::Intake;
        self.record.enter_stage(stage);
        self.publish();

        loop {
            if *self.shutdown.borrow() {
                return Ok(Settlement::Faulted(WorkflowFault::new(
                    FaultCode::Cancelled,
                    "workflow cancelled by shutdown",
                )));
            }
            if Instant::now() >= deadline {
                return Ok(Settlement::Faulted(self.deadline_fault()));
            }
            if self.record.stage_invocations() >= self.limits.max_stage_invocations {
                return Ok(Settlement::Faulted(WorkflowFault::new(
                    FaultCode::IterationLimitExceeded,
                    format!(
                        "workflow made {} stage calls without finishing",
                        self.limits.max_stage_invocations
                    ),
                )));
            }

            let invocation = self.record.count_invocation();
            self.publish();
            let input = self.build_input();
            let context = StageContext {
                workflow_id: self.record.id(),
                stage,
                attempt: self.retries.used(stage),
                invocation,
                correlation_id: self.correlation_id.clone(),
            };

            debug!(
                workflow_id = %context.workflow_id,
                stage = %stage,
                attempt = context.attempt,
                invocation,
                "Invoking stage"
            );

            let result = match self.invoke(stage, input, context, deadline).await {
                Invocation::Finished(result) => result,
                Invocation::Fault(detail) => {
                    return Ok(Settlement::Faulted(WorkflowFault::new(
                        FaultCode::InternalStageFault,
                        format!("internal stage fault in {stage}: {detail}"),
                    )));
                }
                Invocation::DeadlineExpired => {
                    return Ok(Settlement::Faulted(self.deadline_fault()));
                }
                Invocation::ShutdownRequested => {
                    return Ok(Settlement::Faulted(WorkflowFault::new(
                        FaultCode::Cancelled,
                        format!("workflow cancelled by shutdown during {stage}"),
                    )));
                }
            };

            self.record.apply_result(stage, &result);

            match route(stage, &result) {
                Route::Advance(next) => {
                    debug!(
                        workflow_id = %self.record.id(),
                        from = %stage,
                        to = %next,
                        "Advancing workflow"
                    );
                    self.retries.reset(stage);
                    stage = next;
                    self.record.enter_stage(stage);
                }
                Route::Retry => {
                    if let Err(fault) = self.retries.consume(stage) {
                        return Ok(Settlement::Faulted(fault));
                    }
                    debug!(
                        workflow_id = %self.record.id(),
                        stage = %stage,
                        retries = self.retries.used(stage),
                        "Retrying stage"
                    );
                }
                Route::Complete => return Ok(Settlement::Completed),
                Route::Fail(fault) => return Ok(Settlement::Faulted(fault)),
            }

            self.publish();
        }
    }

    fn deadline_fault(&self) -> WorkflowFault {
        WorkflowFault::new(
            FaultCode::TimedOut,
            format!(
                "workflow exceeded its {}s deadline",
                self.limits.timeout.as_secs_f64()
            ),
        )
    }

    fn build_input(&mut self) -> StageInput {
        let mut responses = Vec::new();
        while let Ok(response) = self.responses.try_recv() {
            responses.push(response);
        }

        StageInput {
            request: self.record.request().to_string(),
            payloads: self.record.stage_payloads().clone(),
            responses,
        }
    }

    /// The only suspension point of the loop. The stage runs in its own task
    /// so a panic stays contained and the call can be aborted.
    async fn invoke(
        &mut self,
        stage: StageKind,
        input: StageInput,
        context: StageContext,
        deadline: Instant,
    ) -> Invocation {
        let implementation = self.stages.get(stage);
        let mut task = StageTask(tokio::spawn(async move {
            implementation.execute(input, context).await
        }));

        tokio::select! {
            joined = &mut task.0 => match joined {
                Ok(Ok(result)) => Invocation::Finished(result),
                Ok(Err(e)) => Invocation::Fault(format!("{e:#}")),
                Err(e) if e.is_panic() => Invocation::Fault("stage panicked".to_string()),
                Err(e) => Invocation::Fault(format!("stage task ended abnormally: {e}")),
            },
            _ = sleep_until(deadline) => Invocation::DeadlineExpired,
            _ = shutdown_signalled(&mut self.shutdown) => Invocation::ShutdownRequested,
        }
    }
}

/// In-flight stage call. Aborted when dropped, which covers the deadline and
/// shutdown branches as well as the loop itself being aborted.
struct StageTask(JoinHandle<anyhow::Result<StageResult>>);

impl Drop for StageTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}
