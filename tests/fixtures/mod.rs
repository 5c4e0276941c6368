/// Shared builders for workflow integration tests
#[allow(dead_code)]
pub mod helpers {
    use conductor::{
        Payload, RegistrySettings, ScriptedStage, StageResult, StageSet, WorkflowId,
        WorkflowLimits, WorkflowRegistry, WorkflowSnapshot, WorkflowStatus,
    };
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    /// Successful result carrying only a `next_action`
    pub fn ok(action: &str) -> StageResult {
        StageResult::success(Payload::new()).with_next_action(action)
    }

    /// Stages that walk straight from Intake to an approved review
    pub fn straight_through() -> StageSet {
        StageSet::new(
            ScriptedStage::always(ok("proceed_to_planning")),
            ScriptedStage::always(ok("begin_implementation")),
            ScriptedStage::always(ok("tasks_exhausted")),
            ScriptedStage::always(ok("approve")),
        )
    }

    /// Intake never answers; only deadlines or shutdown end the workflow
    pub fn stuck_in_intake() -> StageSet {
        StageSet::new(
            ScriptedStage::hanging(),
            ScriptedStage::always(ok("begin_implementation")),
            ScriptedStage::always(ok("tasks_exhausted")),
            ScriptedStage::always(ok("approve")),
        )
    }

    pub fn settings(max_concurrent_workflows: usize) -> RegistrySettings {
        RegistrySettings {
            max_concurrent_workflows,
            limits: WorkflowLimits::default(),
        }
    }

    pub async fn wait_terminal(registry: &WorkflowRegistry, id: WorkflowId) -> WorkflowSnapshot {
        let mut feed = registry.subscribe(id).await.expect("workflow is registered");
        let snapshot = feed
            .wait_for(WorkflowSnapshot::is_terminal)
            .await
            .expect("snapshot feed stays open");
        snapshot.clone()
    }

    /// Wait until the workflow has made its first stage call
    pub async fn wait_in_flight(registry: &WorkflowRegistry, id: WorkflowId) {
        let mut feed = registry.subscribe(id).await.expect("workflow is registered");
        feed.wait_for(|s| s.stage_invocations >= 1)
            .await
            .expect("snapshot feed stays open");
    }

    /// Collect every snapshot a reader observes until the workflow is terminal
    pub fn record_history(
        mut feed: watch::Receiver<WorkflowSnapshot>,
    ) -> JoinHandle<Vec<WorkflowSnapshot>> {
        tokio::spawn(async move {
            let mut history = vec![feed.borrow_and_update().clone()];
            while !history.last().is_some_and(WorkflowSnapshot::is_terminal) {
                if feed.changed().await.is_err() {
                    break;
                }
                history.push(feed.borrow_and_update().clone());
            }
            history
        })
    }

    /// Every observed step is a legal lifecycle edge and nothing settles
    /// without having started. A reader may miss a coalesced Running.
    pub fn assert_lifecycle(history: &[WorkflowSnapshot]) {
        for pair in history.windows(2) {
            let (from, to) = (pair[0].status, pair[1].status);
            let legal = from == to
                || from.can_transition_to(to)
                || (from.can_transition_to(WorkflowStatus::Running)
                    && WorkflowStatus::Running.can_transition_to(to));
            assert!(legal, "illegal lifecycle step {from} -> {to}");
        }
        let last = history.last().expect("history is never empty");
        assert!(last.is_terminal(), "workflow ended {}", last.status);
        assert!(last.started_at.is_some(), "settled without starting");
        assert!(last.completed_at.is_some());
    }
}
