//! Replayable stage driven by a fixed script of outcomes.
//!
//! Used by tests and by embedders who want to exercise routing without a
//! model backend. Each call consumes the next step; once the script runs out
//! the final step repeats.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{Stage, StageContext, StageInput, StageResult};

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Return(StageResult),
    /// Return an `Err`, simulating an unexpected fault inside the stage.
    Fault(String),
    Panic(String),
    /// Never resolve; only deadlines or shutdown end the call.
    Hang,
}

#[derive(Debug, Default)]
struct ScriptState {
    cursor: usize,
    calls: Vec<(StageInput, StageContext)>,
}

#[derive(Debug, Clone)]
pub struct ScriptedStage {
    steps: Arc<Vec<ScriptStep>>,
    delay: Option<Duration>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedStage {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Arc::new(steps),
            delay: None,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Script made only of returned results.
    pub fn returning(results: Vec<StageResult>) -> Self {
        Self::new(results.into_iter().map(ScriptStep::Return).collect())
    }

    /// Stage that answers every call with the same result.
    pub fn always(result: StageResult) -> Self {
        Self::returning(vec![result])
    }

    pub fn hanging() -> Self {
        Self::new(vec![ScriptStep::Hang])
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Inputs and contexts seen so far, in call order.
    pub fn calls(&self) -> Vec<(StageInput, StageContext)> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self, input: StageInput, context: StageContext) -> ScriptStep {
        let mut state = self.lock();
        state.calls.push((input, context));

        let index = state.cursor.min(self.steps.len().saturating_sub(1));
        state.cursor += 1;

        self.steps
            .get(index)
            .cloned()
            .unwrap_or_else(|| ScriptStep::Fault("scripted stage has no steps".to_string()))
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    async fn execute(
        &self,
        input: StageInput,
        context: StageContext,
    ) -> anyhow::Result<StageResult> {
        let step = self.next_step(input, context);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match step {
            ScriptStep::Return(result) => Ok(result),
            ScriptStep::Fault(message) => Err(anyhow!(message)),
            ScriptStep::Panic(message) => panic!("{message}"),
            ScriptStep::Hang => std::future::pending().await,
        }
    }
}
