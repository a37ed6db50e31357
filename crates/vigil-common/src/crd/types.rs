//! Supporting types shared by vigil CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status values
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Map a boolean outcome onto a condition status
    pub fn from_bool(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "ClusterAgentReconcile", "OverrideConflict")
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition stamped with the current time
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::at(type_, status, reason, message, Utc::now())
    }

    /// Create a new condition stamped with an explicit time
    pub fn at(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: time,
        }
    }
}

/// Insert or replace a condition by type.
///
/// The existing `lastTransitionTime` is kept unless the status flips, so
/// re-asserting an unchanged condition leaves the status block byte-identical.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            let transition = if existing.status == new.status {
                existing.last_transition_time
            } else {
                new.last_transition_time
            };
            *existing = Condition {
                last_transition_time: transition,
                ..new
            };
        }
        None => conditions.push(new),
    }
}

/// Remove a condition by type, returning whether one was present
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) -> bool {
    let before = conditions.len();
    conditions.retain(|c| c.type_ != type_);
    conditions.len() != before
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn condition_status_display() {
        assert_eq!(ConditionStatus::True.to_string(), "True");
        assert_eq!(ConditionStatus::from_bool(false), ConditionStatus::False);
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
    }

    /// Story: Re-asserting a condition does not churn its transition time
    #[test]
    fn story_unchanged_condition_keeps_transition_time() {
        let t0 = Utc::now() - Duration::minutes(5);
        let mut conditions = vec![Condition::at("Ready", ConditionStatus::True, "Up", "ok", t0)];

        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::True, "Up", "still ok"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].message, "still ok");

        set_condition(
            &mut conditions,
            Condition::new("Ready", ConditionStatus::False, "Down", "broken"),
        );
        assert_ne!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].status, ConditionStatus::False);
    }

    #[test]
    fn remove_and_find_conditions() {
        let mut conditions = vec![
            Condition::new("A", ConditionStatus::True, "r", "m"),
            Condition::new("B", ConditionStatus::False, "r", "m"),
        ];
        assert!(find_condition(&conditions, "B").is_some());
        assert!(remove_condition(&mut conditions, "B"));
        assert!(!remove_condition(&mut conditions, "B"));
        assert!(find_condition(&conditions, "B").is_none());
    }

    #[test]
    fn condition_serializes_kubernetes_field_names() {
        let c = Condition::new("Ready", ConditionStatus::True, "Up", "ok");
        let json = serde_json::to_value(&c).expect("serialize");
        assert!(json.get("type").is_some());
        assert!(json.get("lastTransitionTime").is_some());
    }
}
