//! Condition plumbing shared by both engines.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
        last_transition_time: Time(Utc::now()),
    }
}

pub fn find<'a>(conditions: Option<&'a [Condition]>, type_: &str) -> Option<&'a Condition> {
    conditions?.iter().find(|condition| condition.type_ == type_)
}

pub fn is_true(conditions: Option<&[Condition]>, type_: &str) -> bool {
    find(conditions, type_).is_some_and(|condition| condition.status == CONDITION_TRUE)
}

/// Upserts `condition`, keeping the previous `lastTransitionTime` when the
/// status did not actually flip.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|existing| existing.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synchronized(status: &str, reason: &str) -> Condition {
        new_condition("Synchronized", status, reason, "", Some(1))
    }

    #[test]
    fn set_replaces_in_place() {
        let mut conditions = vec![synchronized(CONDITION_FALSE, "FailedToConvertLegacyToModern")];
        set(&mut conditions, synchronized(CONDITION_TRUE, "ResourceSynchronized"));

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].reason, "ResourceSynchronized");
        assert!(is_true(Some(&conditions), "Synchronized"));
    }

    #[test]
    fn transition_time_survives_same_status_updates() {
        let first = synchronized(CONDITION_TRUE, "ResourceSynchronized");
        let stamp = first.last_transition_time.clone();
        let mut conditions = vec![first];

        set(&mut conditions, synchronized(CONDITION_TRUE, "ResourceSynchronized"));
        assert_eq!(conditions[0].last_transition_time, stamp);

        set(&mut conditions, synchronized(CONDITION_FALSE, "FailedToConvertLegacyToModern"));
        assert_eq!(conditions[0].status, CONDITION_FALSE);
    }

    #[test]
    fn find_is_type_scoped() {
        let conditions = vec![
            synchronized(CONDITION_TRUE, "ResourceSynchronized"),
            new_condition("Paused", CONDITION_FALSE, "NotPaused", "", None),
        ];
        assert!(find(Some(&conditions), "Paused").is_some());
        assert!(find(Some(&conditions), "Ready").is_none());
        assert!(!is_true(Some(&conditions), "Paused"));
    }
}
