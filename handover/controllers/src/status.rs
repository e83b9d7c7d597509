//! Status writers.
//!
//! The two engines write overlapping subsets of the legacy status under
//! distinct field owners, via server-side apply with forced ownership:
//! `<controller>-SynchronizedCondition` for the sync engine's fields,
//! `<controller>-AuthoritativeAPI` for the migration engine's. Legacy status
//! writes embed the observed `resourceVersion` as a precondition so a stale
//! engine loses the race instead of overwriting.
//!
//! Condition-bearing payloads are built against the currently stored
//! conditions, so `lastTransitionTime` survives rewrites that do not flip
//! the condition's status.

use std::fmt::Debug;

use handover_api::{
    conditions::{self, CONDITION_FALSE, CONDITION_TRUE, CONDITION_UNKNOWN},
    reasons, MachineAuthority, SYNCHRONIZED_CONDITION,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{
    api::{Patch, PatchParams},
    Api, Resource,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

pub fn synchronized_condition_owner(controller: &str) -> String {
    format!("{controller}-SynchronizedCondition")
}

pub fn authoritative_api_owner(controller: &str) -> String {
    format!("{controller}-AuthoritativeAPI")
}

/// Server-side-applies a partial status under `field_owner`, claiming only
/// the supplied fields. `resource_version`, when given, makes the write fail
/// on conflict instead of clobbering a newer object.
pub async fn apply_status<K>(
    api: &Api<K>,
    name: &str,
    resource_version: Option<&str>,
    field_owner: &str,
    status: Value,
) -> Result<(), kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let mut metadata = json!({ "name": name });
    if let Some(resource_version) = resource_version {
        metadata["resourceVersion"] = resource_version.into();
    }
    let patch = json!({
        "apiVersion": K::api_version(&()),
        "kind": K::kind(&()),
        "metadata": metadata,
        "status": status,
    });

    api.patch_status(
        name,
        &PatchParams::apply(field_owner).force(),
        &Patch::Apply(&patch),
    )
    .await?;
    Ok(())
}

/// Status payload for a successful sync: provenance plus `Synchronized=True`.
pub fn synchronized_status(
    source: MachineAuthority,
    source_generation: i64,
    observed_generation: Option<i64>,
    existing: Option<&[Condition]>,
) -> Value {
    json!({
        "synchronizedAPI": source,
        "synchronizedGeneration": source_generation,
        "conditions": upsert_condition(existing, conditions::new_condition(
            SYNCHRONIZED_CONDITION,
            CONDITION_TRUE,
            reasons::RESOURCE_SYNCHRONIZED,
            "",
            observed_generation,
        )),
    })
}

/// Status payload recording a sync failure. Provenance fields are left
/// untouched; only the condition is claimed.
pub fn sync_failed_status(
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
    existing: Option<&[Condition]>,
) -> Value {
    json!({
        "conditions": upsert_condition(existing, conditions::new_condition(
            SYNCHRONIZED_CONDITION,
            CONDITION_FALSE,
            reason,
            message,
            observed_generation,
        )),
    })
}

/// Status payload for the migration engine's one-shot bootstrap and the
/// `Migrating` acknowledgement.
pub fn authority_status(authority: MachineAuthority) -> Value {
    json!({ "authoritativeAPI": authority })
}

/// Status payload for migration commit and rollback: flips authority, zeroes
/// the synchronized generation (forcing a resync from the new authority) and
/// downgrades `Synchronized` to `Unknown`.
pub fn authority_changed_status(
    authority: MachineAuthority,
    observed_generation: Option<i64>,
    existing: Option<&[Condition]>,
) -> Value {
    json!({
        "authoritativeAPI": authority,
        "synchronizedGeneration": 0,
        "conditions": upsert_condition(existing, conditions::new_condition(
            SYNCHRONIZED_CONDITION,
            CONDITION_UNKNOWN,
            reasons::AUTHORITATIVE_API_CHANGED,
            "",
            observed_generation,
        )),
    })
}

/// Rebuilds the claimed condition against its stored counterpart:
/// [`conditions::set`] keeps the previous `lastTransitionTime` when the
/// status did not flip.
fn upsert_condition(existing: Option<&[Condition]>, fresh: Condition) -> Vec<Condition> {
    let mut merged: Vec<Condition> = conditions::find(existing, &fresh.type_)
        .cloned()
        .into_iter()
        .collect();
    conditions::set(&mut merged, fresh);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_owners_follow_the_naming_contract() {
        assert_eq!(
            synchronized_condition_owner("machine-sync-controller"),
            "machine-sync-controller-SynchronizedCondition"
        );
        assert_eq!(
            authoritative_api_owner("machineset-migration-controller"),
            "machineset-migration-controller-AuthoritativeAPI"
        );
    }

    #[test]
    fn synchronized_status_claims_provenance_and_condition() {
        let status = synchronized_status(MachineAuthority::Legacy, 7, Some(7), None);
        assert_eq!(status["synchronizedAPI"], "Legacy");
        assert_eq!(status["synchronizedGeneration"], 7);
        assert_eq!(status["conditions"][0]["type"], "Synchronized");
        assert_eq!(status["conditions"][0]["status"], "True");
        assert_eq!(status["conditions"][0]["reason"], "ResourceSynchronized");
    }

    #[test]
    fn failure_status_does_not_claim_provenance() {
        let status = sync_failed_status("FailedToConvertLegacyToModern", "boom", Some(2), None);
        assert!(status.get("synchronizedAPI").is_none());
        assert!(status.get("synchronizedGeneration").is_none());
        assert_eq!(status["conditions"][0]["status"], "False");
    }

    #[test]
    fn rewrites_keep_the_transition_time_until_the_status_flips() {
        use k8s_openapi::chrono::{Duration, Utc};
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

        let mut earlier = conditions::new_condition(
            SYNCHRONIZED_CONDITION,
            CONDITION_FALSE,
            "FailedToConvertLegacyToModern",
            "boom",
            Some(2),
        );
        earlier.last_transition_time = Time(Utc::now() - Duration::seconds(3600));
        let stamp = serde_json::to_value(&earlier.last_transition_time).unwrap();

        let repeated = sync_failed_status(
            "FailedToConvertLegacyToModern",
            "boom again",
            Some(3),
            Some(std::slice::from_ref(&earlier)),
        );
        assert_eq!(repeated["conditions"][0]["lastTransitionTime"], stamp);
        assert_eq!(repeated["conditions"][0]["message"], "boom again");

        let flipped = synchronized_status(
            MachineAuthority::Legacy,
            3,
            Some(3),
            Some(std::slice::from_ref(&earlier)),
        );
        assert_ne!(flipped["conditions"][0]["lastTransitionTime"], stamp);
    }

    #[test]
    fn authority_change_resets_generation_and_condition() {
        let status = authority_changed_status(MachineAuthority::Modern, None, None);
        assert_eq!(status["authoritativeAPI"], "Modern");
        assert_eq!(status["synchronizedGeneration"], 0);
        assert_eq!(status["conditions"][0]["status"], "Unknown");
        assert_eq!(status["conditions"][0]["reason"], "AuthoritativeAPIChanged");
    }
}
