use serde::Serialize;
use serde_json::{Map, Value};

/// Stage-specific data carried by a [`StageResult`].
pub type Payload = Map<String, Value>;

/// Reserved payload key the routing table reads to pick the next stage.
pub const NEXT_ACTION_KEY: &str = "next_action";

/// Immutable outcome of one stage invocation.
///
/// Fields are private so the pairing of `success` and `error` cannot be
/// broken: a successful result never carries an error and a failed result
/// always does.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    success: bool,
    payload: Payload,
    error: Option<String>,
    resource_units: u64,
}

impl StageResult {
    pub fn success(payload: Payload) -> Self {
        Self {
            success: true,
            payload,
            error: None,
            resource_units: 0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        let error = if error.trim().is_empty() {
            "stage reported failure without a message".to_string()
        } else {
            error
        };

        Self {
            success: false,
            payload: Payload::new(),
            error: Some(error),
            resource_units: 0,
        }
    }

    /// Replace the payload, keeping the success/error pairing intact.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_resource_units(mut self, units: u64) -> Self {
        self.resource_units = units;
        self
    }

    /// Set the reserved `next_action` routing key.
    pub fn with_next_action(mut self, action: &str) -> Self {
        self.payload
            .insert(NEXT_ACTION_KEY.to_string(), Value::String(action.to_string()));
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn resource_units(&self) -> u64 {
        self.resource_units
    }

    /// Raw routing key as written by the stage, if any.
    pub fn next_action(&self) -> Option<&Value> {
        self.payload.get(NEXT_ACTION_KEY)
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_never_carries_error() {
        let result = StageResult::success(Payload::new()).with_resource_units(42);

        assert!(result.is_success());
        assert_eq!(result.error(), None);
        assert_eq!(result.resource_units(), 42);
    }

    #[test]
    fn test_failure_always_carries_error() {
        let result = StageResult::failure("");

        assert!(!result.is_success());
        assert_eq!(
            result.error(),
            Some("stage reported failure without a message")
        );
    }

    #[test]
    fn test_failure_keeps_attached_payload() {
        let mut payload = Payload::new();
        payload.insert("quality_score".to_string(), json!(4.5));

        let result = StageResult::failure("quality below threshold")
            .with_payload(payload)
            .with_next_action("revise_code");

        assert!(!result.is_success());
        assert_eq!(result.payload()["quality_score"], json!(4.5));
        assert_eq!(result.next_action(), Some(&json!("revise_code")));
    }
}
