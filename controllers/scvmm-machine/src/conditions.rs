//! Condition projector
//!
//! Mutates the condition list of an `ScvmmMachine` status and derives the
//! `Ready` summary from `VmCreated` and `VmRunning`. The summary is recomputed
//! on every patch, so it never drifts from the conditions it summarises.

use chrono::Utc;
use crds::{Condition, ConditionSeverity, ConditionStatus, READY_CONDITION};

pub const WAITING_FOR_CLUSTER_INFRASTRUCTURE: &str = "WaitingForClusterInfrastructure";
pub const WAITING_FOR_CONTROLPLANE_AVAILABLE: &str = "WaitingForControlplaneAvailable";
pub const WAITING_FOR_BOOTSTRAP_DATA: &str = "WaitingForBootstrapData";
pub const WAITING_FOR_OWNER: &str = "WaitingForOwner";
pub const CLUSTER_NOT_AVAILABLE: &str = "ClusterNotAvailable";
pub const MISSING_CLUSTER: &str = "MissingCluster";
pub const VM_CREATING: &str = "VmCreating";
pub const VM_UPDATING: &str = "VmUpdating";
pub const VM_STARTING: &str = "VmStarting";
pub const VM_DELETING: &str = "VmDeleting";
pub const VM_FAILED: &str = "VmFailed";

/// Insert or replace a condition, keeping the transition time unless the status flips
fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn mark_true(conditions: &mut Vec<Condition>, type_: &str) {
    set(
        conditions,
        Condition {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            severity: None,
            last_transition_time: Some(Utc::now()),
            reason: None,
            message: None,
        },
    );
}

pub fn mark_false(
    conditions: &mut Vec<Condition>,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: &str,
) {
    set(
        conditions,
        Condition {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            severity: Some(severity),
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: (!message.is_empty()).then(|| message.to_string()),
        },
    );
}

/// Recompute `Ready` from the listed conditions
///
/// True only when every listed condition is present and true. Otherwise the
/// false condition with the highest severity wins, ties going to the one
/// listed first; with no false condition the summary is Unknown. With
/// `step_counter` the message reads "X of N completed".
pub fn set_summary(conditions: &mut Vec<Condition>, types: &[&str], step_counter: bool) {
    let in_scope: Vec<Option<Condition>> = types
        .iter()
        .map(|t| conditions.iter().find(|c| c.type_ == *t).cloned())
        .collect();

    if in_scope.iter().all(Option::is_none) {
        conditions.retain(|c| c.type_ != READY_CONDITION);
        return;
    }

    let completed = in_scope.iter().flatten().filter(|c| c.is_true()).count();
    let counter = format!("{} of {} completed", completed, types.len());

    if completed == types.len() {
        mark_true(conditions, READY_CONDITION);
        return;
    }

    let mut worst: Option<&Condition> = None;
    for condition in in_scope.iter().flatten() {
        if condition.status != ConditionStatus::False {
            continue;
        }
        let severity = condition.severity.unwrap_or(ConditionSeverity::Info);
        if worst.is_none_or(|w| severity > w.severity.unwrap_or(ConditionSeverity::Info)) {
            worst = Some(condition);
        }
    }

    let summary = match worst {
        Some(condition) => Condition {
            type_: READY_CONDITION.to_string(),
            status: ConditionStatus::False,
            severity: condition.severity,
            last_transition_time: Some(Utc::now()),
            reason: condition.reason.clone(),
            message: if step_counter {
                Some(counter)
            } else {
                condition.message.clone()
            },
        },
        None => {
            let pending = in_scope
                .iter()
                .flatten()
                .find(|c| c.status == ConditionStatus::Unknown);
            Condition {
                type_: READY_CONDITION.to_string(),
                status: ConditionStatus::Unknown,
                severity: None,
                last_transition_time: Some(Utc::now()),
                reason: pending.and_then(|c| c.reason.clone()),
                message: step_counter.then_some(counter),
            }
        }
    };
    set(conditions, summary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{find_condition, VM_CREATED_CONDITION, VM_RUNNING_CONDITION};

    const MACHINE_CONDITIONS: [&str; 2] = [VM_CREATED_CONDITION, VM_RUNNING_CONDITION];

    fn ready(conditions: &[Condition]) -> &Condition {
        find_condition(conditions, READY_CONDITION).expect("Ready condition missing")
    }

    #[test]
    fn test_all_true_makes_ready_true() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, VM_CREATED_CONDITION);
        mark_true(&mut conditions, VM_RUNNING_CONDITION);
        set_summary(&mut conditions, &MACHINE_CONDITIONS, true);

        let ready = ready(&conditions);
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, None);
        assert_eq!(ready.message, None);
    }

    #[test]
    fn test_highest_severity_false_condition_wins() {
        let mut conditions = Vec::new();
        mark_false(&mut conditions, VM_CREATED_CONDITION, VM_CREATING, ConditionSeverity::Info, "");
        mark_false(&mut conditions, VM_RUNNING_CONDITION, VM_FAILED, ConditionSeverity::Error, "boom");
        set_summary(&mut conditions, &MACHINE_CONDITIONS, false);

        let ready = ready(&conditions);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason.as_deref(), Some(VM_FAILED));
        assert_eq!(ready.severity, Some(ConditionSeverity::Error));
        assert_eq!(ready.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_equal_severity_goes_to_first_listed() {
        let mut conditions = Vec::new();
        mark_false(&mut conditions, VM_RUNNING_CONDITION, VM_STARTING, ConditionSeverity::Info, "");
        mark_false(&mut conditions, VM_CREATED_CONDITION, VM_CREATING, ConditionSeverity::Info, "");
        set_summary(&mut conditions, &MACHINE_CONDITIONS, true);

        let ready = ready(&conditions);
        assert_eq!(ready.reason.as_deref(), Some(VM_CREATING));
        assert_eq!(ready.message.as_deref(), Some("0 of 2 completed"));
    }

    #[test]
    fn test_step_counter_counts_true_conditions() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, VM_CREATED_CONDITION);
        mark_false(&mut conditions, VM_RUNNING_CONDITION, VM_STARTING, ConditionSeverity::Info, "");
        set_summary(&mut conditions, &MACHINE_CONDITIONS, true);

        assert_eq!(ready(&conditions).message.as_deref(), Some("1 of 2 completed"));
    }

    #[test]
    fn test_missing_condition_keeps_summary_unknown() {
        let mut conditions = Vec::new();
        mark_true(&mut conditions, VM_CREATED_CONDITION);
        set_summary(&mut conditions, &MACHINE_CONDITIONS, true);

        let ready = ready(&conditions);
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.message.as_deref(), Some("1 of 2 completed"));
    }

    #[test]
    fn test_no_conditions_means_no_summary() {
        let mut conditions = Vec::new();
        set_summary(&mut conditions, &MACHINE_CONDITIONS, true);
        assert!(conditions.is_empty());
    }

    #[test]
    fn test_transition_time_only_moves_on_status_change() {
        let mut conditions = Vec::new();
        mark_false(&mut conditions, VM_CREATED_CONDITION, VM_CREATING, ConditionSeverity::Info, "");
        let first = conditions[0].last_transition_time;

        mark_false(&mut conditions, VM_CREATED_CONDITION, VM_FAILED, ConditionSeverity::Error, "x");
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].reason.as_deref(), Some(VM_FAILED));

        std::thread::sleep(std::time::Duration::from_millis(5));
        mark_true(&mut conditions, VM_CREATED_CONDITION);
        assert!(conditions[0].last_transition_time > first);
        assert_eq!(conditions[0].severity, None);
    }
}
