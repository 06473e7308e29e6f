//! Cluster API style conditions
//!
//! The condition record shared by `ScvmmMachine` status and the Cluster API
//! `Cluster` status. Mutation helpers live in the controller; this module
//! only defines the wire shape and the condition type names.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Summary condition, derived from the others on every patch
pub const READY_CONDITION: &str = "Ready";

/// The VM has been created on the SCVMM side
pub const VM_CREATED_CONDITION: &str = "VmCreated";

/// The VM has been started and reports the running state
pub const VM_RUNNING_CONDITION: &str = "VmRunning";

/// Set on a Cluster once its first control plane node is up
pub const CONTROL_PLANE_INITIALIZED_CONDITION: &str = "ControlPlaneInitialized";

/// Condition truth value
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Severity of a false condition
///
/// Ordered by merge priority: an `Error` condition wins over a `Warning`,
/// which wins over an `Info`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "PascalCase")]
pub enum ConditionSeverity {
    Info,
    Warning,
    Error,
}

/// A single named condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. "VmCreated")
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown
    pub status: ConditionStatus,

    /// Only set when status is False
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// CamelCase machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Whether the condition of the given type exists and is True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some_and(Condition::is_true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_serializes_capi_shape() {
        let condition = Condition {
            type_: VM_CREATED_CONDITION.to_string(),
            status: ConditionStatus::False,
            severity: Some(ConditionSeverity::Info),
            last_transition_time: None,
            reason: Some("VmCreating".to_string()),
            message: None,
        };
        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "VmCreated");
        assert_eq!(json["status"], "False");
        assert_eq!(json["severity"], "Info");
        assert_eq!(json["reason"], "VmCreating");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_severity_ordering_matches_merge_priority() {
        assert!(ConditionSeverity::Error > ConditionSeverity::Warning);
        assert!(ConditionSeverity::Warning > ConditionSeverity::Info);
    }

    #[test]
    fn test_is_condition_true() {
        let conditions = vec![Condition {
            type_: CONTROL_PLANE_INITIALIZED_CONDITION.to_string(),
            status: ConditionStatus::True,
            severity: None,
            last_transition_time: None,
            reason: None,
            message: None,
        }];
        assert!(is_condition_true(&conditions, CONTROL_PLANE_INITIALIZED_CONDITION));
        assert!(!is_condition_true(&conditions, READY_CONDITION));
    }
}
