// Deterministic demo pipeline
// Stands in for model-backed stages so the engine can run end to end offline.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Payload, Stage, StageContext, StageInput, StageKind, StageResult, StageSet};

const QUALITY_THRESHOLD: f64 = 7.0;

/// Upper bound on the tasks the demo Planner will produce.
pub const MAX_DEMO_TASKS: usize = 64;

/// Knobs for the demo pipeline.
#[derive(Debug, Clone)]
pub struct DemoOptions {
    /// Clarification rounds Intake asks for before planning.
    pub clarification_rounds: u32,
    /// Tasks the Planner splits the request into, clamped to `1..=MAX_DEMO_TASKS`.
    pub tasks: usize,
    /// Revisions the Implementer needs for every task.
    pub revisions_per_task: u32,
}

impl Default for DemoOptions {
    fn default() -> Self {
        Self {
            clarification_rounds: 1,
            tasks: 3,
            revisions_per_task: 0,
        }
    }
}

pub fn demo_stage_set(options: &DemoOptions) -> StageSet {
    StageSet::new(
        DemoIntake {
            clarification_rounds: options.clarification_rounds,
        },
        DemoPlanner {
            tasks: options.tasks.clamp(1, MAX_DEMO_TASKS),
        },
        DemoImplementer {
            revisions_per_task: options.revisions_per_task,
        },
        DemoReviewer,
    )
}

fn words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn plan_task_ids(input: &StageInput) -> Vec<String> {
    input
        .payload(StageKind::Planner)
        .and_then(|plan| plan.get("implementation_plan"))
        .and_then(|plan| plan.get("tasks"))
        .and_then(Value::as_array)
        .map(|tasks| {
            tasks
                .iter()
                .filter_map(|task| task.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn completed_task_ids(input: &StageInput) -> Vec<String> {
    input
        .payload(StageKind::Implementer)
        .and_then(|payload| payload.get("completed_task_ids"))
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Asks clarifying questions for a fixed number of rounds, or until the user
/// answers, then hands a requirements summary to planning.
#[derive(Debug, Clone)]
pub struct DemoIntake {
    pub clarification_rounds: u32,
}

#[async_trait]
impl Stage for DemoIntake {
    async fn execute(
        &self,
        input: StageInput,
        context: StageContext,
    ) -> anyhow::Result<StageResult> {
        let cost = words(&input.request).saturating_mul(4);

        if input.responses.is_empty() && context.attempt < self.clarification_rounds {
            let questions = json!([
                format!("Who are the intended users of \"{}\"?", input.request),
                "Which platform should it run on?",
                "Are there performance or security constraints?",
            ]);
            let payload = into_payload(json!({
                "questions": questions,
                "round": context.attempt + 1,
                "status": "needs_more_info",
            }));

            return Ok(StageResult::success(payload)
                .with_next_action("await_user_responses")
                .with_resource_units(cost));
        }

        let mut answers = Payload::new();
        for response in &input.responses {
            answers.extend(response.clone());
        }

        let assumptions: Vec<&str> = if answers.is_empty() {
            vec!["defaults accepted for unanswered questions"]
        } else {
            Vec::new()
        };

        let payload = into_payload(json!({
            "requirements_summary": {
                "request": input.request,
                "answers": answers,
                "assumptions": assumptions,
            },
            "status": "requirements_complete",
        }));

        Ok(StageResult::success(payload)
            .with_next_action("proceed_to_planning")
            .with_resource_units(cost))
    }
}

/// Splits the request into a fixed number of pending tasks.
#[derive(Debug, Clone)]
pub struct DemoPlanner {
    pub tasks: usize,
}

#[async_trait]
impl Stage for DemoPlanner {
    async fn execute(
        &self,
        input: StageInput,
        _context: StageContext,
    ) -> anyhow::Result<StageResult> {
        if input.payload(StageKind::Intake).is_none() {
            return Ok(StageResult::failure("no requirements available for planning"));
        }

        let templates = [
            "Set up project structure",
            "Implement core logic",
            "Add error handling and validation",
            "Write tests",
            "Write documentation",
        ];
        let tasks: Vec<Value> = (0..self.tasks)
            .map(|index| {
                let title = templates[index % templates.len()];
                json!({
                    "id": format!("task-{}", index + 1),
                    "title": format!("{title} for {}", input.request),
                    "status": "pending",
                })
            })
            .collect();

        let payload = into_payload(json!({
            "implementation_plan": {
                "project_overview": { "request": input.request },
                "tasks": tasks,
            },
        }));

        Ok(StageResult::success(payload)
            .with_next_action("begin_implementation")
            .with_resource_units(
                words(&input.request)
                    .saturating_mul(8)
                    .saturating_add((self.tasks as u64).saturating_mul(16)),
            ))
    }
}

/// Implements one pending task per call, failing the quality gate a
/// configured number of times per task before passing it.
#[derive(Debug, Clone)]
pub struct DemoImplementer {
    pub revisions_per_task: u32,
}

#[async_trait]
impl Stage for DemoImplementer {
    async fn execute(
        &self,
        input: StageInput,
        context: StageContext,
    ) -> anyhow::Result<StageResult> {
        let mut completed = completed_task_ids(&input);
        let pending = plan_task_ids(&input)
            .into_iter()
            .find(|id| !completed.contains(id));

        let Some(task_id) = pending else {
            let payload = into_payload(json!({ "completed_task_ids": completed }));
            return Ok(StageResult::success(payload).with_next_action("tasks_exhausted"));
        };

        if context.attempt < self.revisions_per_task {
            let score = QUALITY_THRESHOLD - 1.5;
            let payload = into_payload(json!({
                "completed_task_ids": completed,
                "task_id": task_id,
                "quality_score": score,
                "revision_required": true,
            }));

            return Ok(StageResult::failure(format!(
                "code quality below threshold ({score} < {QUALITY_THRESHOLD})"
            ))
            .with_payload(payload)
            .with_next_action("revise_code")
            .with_resource_units(64));
        }

        completed.push(task_id.clone());
        let payload = into_payload(json!({
            "completed_task_ids": completed,
            "task_id": task_id,
            "files": [{ "path": format!("src/{}.rs", task_id.replace('-', "_")) }],
            "quality_score": QUALITY_THRESHOLD + 1.0,
        }));

        Ok(StageResult::success(payload)
            .with_next_action("continue_implementation")
            .with_resource_units(128))
    }
}

/// Approves once every planned task is implemented.
#[derive(Debug, Clone, Default)]
pub struct DemoReviewer;

#[async_trait]
impl Stage for DemoReviewer {
    async fn execute(
        &self,
        input: StageInput,
        _context: StageContext,
    ) -> anyhow::Result<StageResult> {
        let planned = plan_task_ids(&input);
        let completed = completed_task_ids(&input);
        let remaining = planned
            .iter()
            .filter(|id| !completed.contains(id))
            .count();

        if !planned.is_empty() && remaining == 0 {
            let payload = into_payload(json!({
                "review_status": "approved",
                "completed_tasks": completed.len(),
            }));
            return Ok(StageResult::success(payload)
                .with_next_action("approve")
                .with_resource_units(16));
        }

        let payload = into_payload(json!({
            "review_status": "continue_implementation",
            "remaining_tasks": remaining,
        }));
        Ok(StageResult::success(payload)
            .with_next_action("continue_implementation")
            .with_resource_units(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::WorkflowId;

    fn context(stage: StageKind, attempt: u32) -> StageContext {
        StageContext {
            workflow_id: WorkflowId::new(),
            stage,
            attempt,
            invocation: 1,
            correlation_id: "demo".to_string(),
        }
    }

    #[tokio::test]
    async fn test_intake_asks_then_proceeds() {
        let intake = DemoIntake {
            clarification_rounds: 1,
        };
        let input = StageInput {
            request: "build a calculator".to_string(),
            ..Default::default()
        };

        let first = intake
            .execute(input.clone(), context(StageKind::Intake, 0))
            .await
            .unwrap();
        assert_eq!(first.next_action(), Some(&json!("await_user_responses")));

        let second = intake
            .execute(input, context(StageKind::Intake, 1))
            .await
            .unwrap();
        assert_eq!(second.next_action(), Some(&json!("proceed_to_planning")));
    }

    #[tokio::test]
    async fn test_intake_proceeds_once_user_answers() {
        let intake = DemoIntake {
            clarification_rounds: 5,
        };
        let mut answer = Payload::new();
        answer.insert("platform".to_string(), json!("cli"));
        let input = StageInput {
            request: "build a calculator".to_string(),
            responses: vec![answer],
            ..Default::default()
        };

        let result = intake
            .execute(input, context(StageKind::Intake, 0))
            .await
            .unwrap();
        assert_eq!(result.next_action(), Some(&json!("proceed_to_planning")));
        assert_eq!(
            result.payload()["requirements_summary"]["answers"]["platform"],
            json!("cli")
        );
    }

    #[tokio::test]
    async fn test_oversized_task_count_is_clamped() {
        let stages = demo_stage_set(&DemoOptions {
            tasks: usize::MAX,
            ..DemoOptions::default()
        });
        let mut input = StageInput {
            request: "build a calculator".to_string(),
            ..Default::default()
        };
        input.payloads.insert(StageKind::Intake, Payload::new());

        let plan = stages
            .get(StageKind::Planner)
            .execute(input, context(StageKind::Planner, 0))
            .await
            .unwrap();

        let tasks = plan.payload()["implementation_plan"]["tasks"]
            .as_array()
            .unwrap()
            .len();
        assert_eq!(tasks, MAX_DEMO_TASKS);
        assert_eq!(plan.resource_units(), 3 * 8 + MAX_DEMO_TASKS as u64 * 16);
    }

    #[tokio::test]
    async fn test_implementer_revises_then_completes_task() {
        let planner = DemoPlanner { tasks: 1 };
        let implementer = DemoImplementer {
            revisions_per_task: 1,
        };

        let mut input = StageInput {
            request: "build a calculator".to_string(),
            ..Default::default()
        };
        input.payloads.insert(StageKind::Intake, Payload::new());
        let plan = planner
            .execute(input.clone(), context(StageKind::Planner, 0))
            .await
            .unwrap();
        input.payloads.insert(StageKind::Planner, plan.into_payload());

        let revision = implementer
            .execute(input.clone(), context(StageKind::Implementer, 0))
            .await
            .unwrap();
        assert!(!revision.is_success());
        assert_eq!(revision.next_action(), Some(&json!("revise_code")));

        let done = implementer
            .execute(input.clone(), context(StageKind::Implementer, 1))
            .await
            .unwrap();
        assert!(done.is_success());
        assert_eq!(done.payload()["completed_task_ids"], json!(["task-1"]));

        input
            .payloads
            .insert(StageKind::Implementer, done.into_payload());
        let review = DemoReviewer
            .execute(input, context(StageKind::Reviewer, 0))
            .await
            .unwrap();
        assert_eq!(review.next_action(), Some(&json!("approve")));
    }
}
