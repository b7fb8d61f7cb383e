/// Lifecycle audit events
/// One JSON record per lifecycle transition, emitted on the `cloudenv::audit`
/// log target so operators can route it separately from diagnostics.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const AUDIT_TARGET: &str = "cloudenv::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Create,
    Halt,
    Resume,
    Destroy,
    Exec,
    Reconcile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Degraded,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub timestamp: DateTime<Utc>,
    pub action: LifecycleAction,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_pid: Option<u32>,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LifecycleEvent {
    pub fn new(action: LifecycleAction, environment: &str, outcome: Outcome) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            environment: environment.to_string(),
            host_pid: None,
            outcome,
            detail: None,
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.host_pid = pid;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"action":"{:?}","environment":"{}","serialization_error":"{}"}}"#,
                self.action, self.environment, e
            )
        })
    }

    /// Emit on the audit target; failures go out at `warn` level.
    pub fn emit(&self) {
        match self.outcome {
            Outcome::Failure => log::warn!(target: AUDIT_TARGET, "{}", self.to_json()),
            _ => log::info!(target: AUDIT_TARGET, "{}", self.to_json()),
        }
    }
}

/// Build and emit an event in one call.
pub fn record(
    action: LifecycleAction,
    environment: &str,
    host_pid: Option<u32>,
    outcome: Outcome,
    detail: Option<String>,
) {
    let mut event = LifecycleEvent::new(action, environment, outcome).with_pid(host_pid);
    event.detail = detail;
    event.emit();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = LifecycleEvent::new(LifecycleAction::Create, "alpha", Outcome::Success)
            .with_pid(Some(4242))
            .with_detail("cgroup cloudenv_alpha");
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["action"], "create");
        assert_eq!(value["environment"], "alpha");
        assert_eq!(value["host_pid"], 4242);
        assert_eq!(value["outcome"], "success");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let json = LifecycleEvent::new(LifecycleAction::Destroy, "beta", Outcome::Degraded).to_json();
        assert!(!json.contains("host_pid"));
        assert!(!json.contains("detail"));
    }
}
