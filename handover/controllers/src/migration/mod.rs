//! The migration engine: the authority hand-off state machine.
//!
//! Keyed like the sync engine on the legacy resource. Each reconcile
//! observes both mirrors, asks [`plan`] for the next step, and executes
//! exactly one transition. Pausing is requested through an annotation but
//! acknowledged through a condition, and nothing watches that translation, so
//! steps that write the annotation requeue with a short, fixed delay instead
//! of waiting for an event.

use std::{fmt::Debug, time::Duration};

use handover_api::{conditions, has_paused_annotation, PAUSED_ANNOTATION, PAUSED_CONDITION};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use kube::{
    api::{Patch, PatchParams},
    core::DynamicObject,
    Api,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

pub mod machine;
pub mod machine_set;

mod plan;

pub(crate) use plan::{next_step, MigrationObservation, MigrationStep, PauseObservation};

/// Requeue after writing a paused annotation: the condition flip it causes
/// arrives through no watch.
pub(crate) const PAUSE_REQUEUE: Duration = Duration::from_secs(5);
/// Requeue while waiting on a pause or unpause acknowledgement.
pub(crate) const WAIT_REQUEUE: Duration = Duration::from_secs(10);

/// Adds or removes the paused annotation with a merge patch.
pub(crate) async fn set_pause_annotation<K>(
    api: &Api<K>,
    name: &str,
    paused: bool,
) -> Result<(), kube::Error>
where
    K: Clone + DeserializeOwned + Debug,
{
    let value = if paused { json!("") } else { Value::Null };
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({
            "metadata": { "annotations": { PAUSED_ANNOTATION: value } }
        })),
    )
    .await?;
    Ok(())
}

pub(crate) fn observe_pause(
    meta: &ObjectMeta,
    conditions: Option<&[Condition]>,
) -> PauseObservation {
    PauseObservation {
        annotated: has_paused_annotation(meta),
        paused: conditions::is_true(conditions, PAUSED_CONDITION),
    }
}

/// Pause observation for a dynamically-typed infrastructure object.
pub(crate) fn observe_dynamic_pause(object: &DynamicObject) -> PauseObservation {
    let paused = object
        .data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(Value::as_str) == Some(PAUSED_CONDITION)
                    && condition.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false);

    PauseObservation {
        annotated: has_paused_annotation(&object.metadata),
        paused,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_pause_observation_reads_annotation_and_condition() {
        let mut object = DynamicObject {
            types: None,
            metadata: ObjectMeta::default(),
            data: json!({
                "status": {
                    "conditions": [
                        {"type": "Ready", "status": "True"},
                        {"type": "Paused", "status": "True"}
                    ]
                }
            }),
        };
        let observation = observe_dynamic_pause(&object);
        assert!(observation.paused);
        assert!(!observation.annotated);

        object
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(PAUSED_ANNOTATION.to_string(), String::new());
        object.data = json!({});
        let observation = observe_dynamic_pause(&object);
        assert!(observation.annotated);
        assert!(!observation.paused);
    }
}
