//! Pair lifecycle: finalizers and the ordered-deletion protocol.
//!
//! Both mirrors carry the sync finalizer while the pair is live. Deletion of
//! either mirror propagates to the other, and finalizers come off in a fixed
//! order (modern actuator's, modern sync, legacy sync) so that neither mirror
//! can outlive its peer's cleanup.

use std::fmt::Debug;

use handover_api::SYNC_FINALIZER;
use kube::{
    api::{Patch, PatchParams},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::direction::SyncDirection;

/// What the deletion protocol wants done for the current observation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeletionAction {
    /// No deletion in progress; continue with the normal sync.
    Proceed,
    /// Propagate the mirror's deletion to the legacy resource.
    DeleteLegacy,
    /// Legacy is deleting and nothing modern remains: release it.
    RemoveLegacySyncFinalizer,
    /// Legacy is deleting while modern still stands. Delete modern and strip
    /// both the modern actuator's finalizer (it is paused and will not do so
    /// itself) and the sync finalizer.
    DeleteModernAndStripFinalizers,
    /// Modern already has a deletion timestamp but its finalizers hold it;
    /// strip them for the same reason as above.
    StripModernFinalizers,
    /// Modern is authoritative and alive while legacy is deleting: release
    /// both sync finalizers and let the legacy deletion complete.
    RemoveBothSyncFinalizers,
    /// Modern is deleting and legacy is already gone: release modern.
    RemoveModernSyncFinalizer,
    /// Modern is authoritative and deleting; its actuator still holds its
    /// finalizer, so graceful teardown is in progress. Do not interfere.
    WaitForModernActuator,
    /// Actuator teardown finished; release modern, then legacy.
    RemoveModernThenLegacySyncFinalizers,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MirrorObservation {
    pub deleting: bool,
    pub has_actuator_finalizer: bool,
}

/// The deletion table, as a pure function of the observation.
///
/// `pair_established` distinguishes "modern was deleted out from under us"
/// from "modern has not been materialised yet": only a pair that has synced
/// at least once propagates an absent modern mirror as a deletion.
pub fn plan_deletion(
    direction: SyncDirection,
    legacy: Option<MirrorObservation>,
    modern: Option<MirrorObservation>,
    pair_established: bool,
) -> DeletionAction {
    match direction {
        SyncDirection::Frozen | SyncDirection::Idle => DeletionAction::Proceed,

        SyncDirection::LegacyToModern => {
            let Some(legacy) = legacy else {
                return DeletionAction::Proceed;
            };
            match (legacy.deleting, modern) {
                (false, Some(modern)) if modern.deleting => DeletionAction::DeleteLegacy,
                (false, None) if pair_established => DeletionAction::DeleteLegacy,
                (false, _) => DeletionAction::Proceed,
                (true, None) => DeletionAction::RemoveLegacySyncFinalizer,
                (true, Some(modern)) if !modern.deleting => {
                    DeletionAction::DeleteModernAndStripFinalizers
                }
                (true, Some(_)) => DeletionAction::StripModernFinalizers,
            }
        }

        SyncDirection::ModernToLegacy => {
            let Some(modern) = modern else {
                return DeletionAction::Proceed;
            };
            match (modern.deleting, legacy) {
                (false, Some(legacy)) if legacy.deleting => {
                    DeletionAction::RemoveBothSyncFinalizers
                }
                (false, _) => DeletionAction::Proceed,
                (true, None) => DeletionAction::RemoveModernSyncFinalizer,
                (true, Some(legacy)) if !legacy.deleting => DeletionAction::DeleteLegacy,
                (true, Some(_)) if modern.has_actuator_finalizer => {
                    DeletionAction::WaitForModernActuator
                }
                (true, Some(_)) => DeletionAction::RemoveModernThenLegacySyncFinalizers,
            }
        }
    }
}

pub(crate) fn observe<K: Resource>(resource: &K, actuator_finalizer: &str) -> MirrorObservation {
    MirrorObservation {
        deleting: resource.meta().deletion_timestamp.is_some(),
        has_actuator_finalizer: resource
            .finalizers()
            .iter()
            .any(|finalizer| finalizer == actuator_finalizer),
    }
}

/// Adds the sync finalizer if absent. Returns whether a write happened.
pub(crate) async fn ensure_sync_finalizer<K>(api: &Api<K>, resource: &K) -> Result<bool, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    if resource.finalizers().iter().any(|f| f == SYNC_FINALIZER) {
        return Ok(false);
    }
    let mut finalizers = resource.finalizers().to_vec();
    finalizers.push(SYNC_FINALIZER.to_string());
    patch_finalizers(api, &resource.name_any(), finalizers).await?;
    Ok(true)
}

/// Removes the named finalizers, if present. Returns whether a write
/// happened.
pub(crate) async fn remove_finalizers<K>(
    api: &Api<K>,
    resource: &K,
    to_remove: &[&str],
) -> Result<bool, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let current = resource.finalizers();
    let remaining: Vec<String> = current
        .iter()
        .filter(|finalizer| !to_remove.contains(&finalizer.as_str()))
        .cloned()
        .collect();
    if remaining.len() == current.len() {
        return Ok(false);
    }
    patch_finalizers(api, &resource.name_any(), remaining).await?;
    Ok(true)
}

async fn patch_finalizers<K>(
    api: &Api<K>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<(), kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::DeletionAction::*;
    use super::*;
    use crate::direction::SyncDirection::*;

    fn alive() -> Option<MirrorObservation> {
        Some(MirrorObservation {
            deleting: false,
            has_actuator_finalizer: true,
        })
    }

    fn deleting(has_actuator_finalizer: bool) -> Option<MirrorObservation> {
        Some(MirrorObservation {
            deleting: true,
            has_actuator_finalizer,
        })
    }

    #[rstest]
    // Forward direction: legacy is the source of truth.
    #[case(LegacyToModern, alive(), alive(), true, Proceed)]
    #[case(LegacyToModern, alive(), deleting(true), true, DeleteLegacy)]
    #[case(LegacyToModern, alive(), None, true, DeleteLegacy)]
    #[case(LegacyToModern, alive(), None, false, Proceed)]
    #[case(LegacyToModern, deleting(false), None, true, RemoveLegacySyncFinalizer)]
    #[case(LegacyToModern, deleting(false), alive(), true, DeleteModernAndStripFinalizers)]
    #[case(LegacyToModern, deleting(false), deleting(true), true, StripModernFinalizers)]
    // Reverse direction: modern is the source of truth.
    #[case(ModernToLegacy, alive(), alive(), true, Proceed)]
    #[case(ModernToLegacy, deleting(false), alive(), true, RemoveBothSyncFinalizers)]
    #[case(ModernToLegacy, None, deleting(false), true, RemoveModernSyncFinalizer)]
    #[case(ModernToLegacy, alive(), deleting(true), true, DeleteLegacy)]
    #[case(ModernToLegacy, deleting(false), deleting(true), true, WaitForModernActuator)]
    #[case(
        ModernToLegacy,
        deleting(false),
        deleting(false),
        true,
        RemoveModernThenLegacySyncFinalizers
    )]
    // Sync never tears down while frozen or uninitialised.
    #[case(Frozen, deleting(false), deleting(false), true, Proceed)]
    #[case(Idle, deleting(false), None, true, Proceed)]
    fn deletion_table(
        #[case] direction: SyncDirection,
        #[case] legacy: Option<MirrorObservation>,
        #[case] modern: Option<MirrorObservation>,
        #[case] pair_established: bool,
        #[case] expected: DeletionAction,
    ) {
        assert_eq!(plan_deletion(direction, legacy, modern, pair_established), expected);
    }

    #[test]
    fn graceful_modern_teardown_waits_for_the_actuator() {
        // The asymmetry of the protocol: an authoritative modern actuator
        // runs its own teardown, a paused one cannot.
        let waiting = plan_deletion(ModernToLegacy, deleting(false), deleting(true), true);
        assert_eq!(waiting, WaitForModernActuator);

        let released = plan_deletion(ModernToLegacy, deleting(false), deleting(false), true);
        assert_eq!(released, RemoveModernThenLegacySyncFinalizers);

        let paused_side = plan_deletion(LegacyToModern, deleting(false), alive(), true);
        assert_eq!(paused_side, DeleteModernAndStripFinalizers);
    }
}
