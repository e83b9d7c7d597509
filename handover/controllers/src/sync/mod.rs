//! The sync engine: bidirectional mirroring of machines and machine-sets.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc, time::Duration};

use handover_api::{modern::ModernCluster, PAUSED_ANNOTATION};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, OwnerReference};
use kube::{
    api::DeleteParams,
    runtime::{
        controller::Action,
        events::{Event, EventType},
    },
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::{
    error::{ControllerError, Result},
    status, Context,
};

pub mod lifecycle;
pub mod machine;
pub mod machine_set;

/// Requeue used while a propagated deletion settles.
pub(crate) const DELETION_REQUEUE: Duration = Duration::from_secs(5);

/// Fetches the per-cluster object all modern mirrors hang off.
pub(crate) async fn fetch_cluster(ctx: &Context) -> Result<ModernCluster, ControllerError> {
    let api: Api<ModernCluster> = Api::namespaced(ctx.client.clone(), &ctx.modern_namespace);
    api.get_opt(&ctx.cluster_name)
        .await?
        .ok_or_else(|| {
            ControllerError::InfraResources(format!(
                "cluster object {} not found in {}",
                ctx.cluster_name, ctx.modern_namespace,
            ))
        })
}

/// The sole owner reference a modern mirror is allowed to carry.
pub(crate) fn cluster_owner_ref(cluster: &ModernCluster) -> OwnerReference {
    OwnerReference {
        api_version: ModernCluster::api_version(&()).into_owned(),
        kind: ModernCluster::kind(&()).into_owned(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Copies the identity fields that must survive a rebuild of the target
/// object from its source mirror.
pub(crate) fn merge_identity(desired: &mut ObjectMeta, existing: &ObjectMeta) {
    desired.uid = existing.uid.clone();
    desired.resource_version = existing.resource_version.clone();
    desired.creation_timestamp = existing.creation_timestamp.clone();
    desired.managed_fields = existing.managed_fields.clone();
    desired.generation = existing.generation;
    desired.finalizers = existing.finalizers.clone();
}

/// The curated object-meta subset the write protocol diffs: labels and
/// annotations only.
pub(crate) fn meta_subset_changed(existing: &ObjectMeta, desired: &ObjectMeta) -> bool {
    existing.labels != desired.labels || existing.annotations != desired.annotations
}

pub(crate) fn insert_paused_annotation(meta: &mut ObjectMeta) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(PAUSED_ANNOTATION.to_string(), String::new());
}

/// Issues a delete, treating an already-absent object as success.
pub(crate) async fn delete_ignoring_absent<K>(api: &Api<K>, name: &str) -> Result<(), kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(error) => Err(error),
    }
}

/// Records a sync failure on the `Synchronized` condition and folds any
/// secondary write failure into the returned error, so the original cause is
/// never masked. The caller propagates the result for a queue retry.
pub(crate) async fn fail_sync<K>(
    api: &Api<K>,
    name: &str,
    resource_version: Option<&str>,
    controller: &str,
    reason: &str,
    primary: ControllerError,
    observed_generation: Option<i64>,
    existing_conditions: Option<&[Condition]>,
) -> ControllerError
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let write = status::apply_status(
        api,
        name,
        resource_version,
        &status::synchronized_condition_owner(controller),
        status::sync_failed_status(
            reason,
            primary.to_string(),
            observed_generation,
            existing_conditions,
        ),
    )
    .await;
    primary.aggregate(write)
}

/// Same, for failures that cannot resolve without user action: the condition
/// is recorded and the reconcile ends without a retry.
pub(crate) async fn fail_terminally<K>(
    api: &Api<K>,
    name: &str,
    resource_version: Option<&str>,
    controller: &str,
    reason: &str,
    primary: ControllerError,
    observed_generation: Option<i64>,
    existing_conditions: Option<&[Condition]>,
) -> Result<Action>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let write = status::apply_status(
        api,
        name,
        resource_version,
        &status::synchronized_condition_owner(controller),
        status::sync_failed_status(
            reason,
            primary.to_string(),
            observed_generation,
            existing_conditions,
        ),
    )
    .await;
    if let Err(error) = write {
        warn!(%error, "failed to record terminal sync failure");
    }
    warn!(resource = name, %primary, "sync cannot resolve without user action; not retrying");
    Ok(Action::await_change())
}

/// Surfaces conversion warnings as events on the legacy mirror. Best-effort:
/// an unpublishable event is logged, never fatal.
pub(crate) async fn emit_warnings<K>(ctx: &Arc<Context>, legacy: &K, warnings: &[String])
where
    K: Resource<DynamicType = ()>,
{
    for warning in warnings {
        let event = Event {
            type_: EventType::Warning,
            reason: "ConversionWarning".into(),
            note: Some(warning.clone()),
            action: "Syncing".into(),
            secondary: None,
        };
        if let Err(error) = ctx
            .recorder()
            .publish(&event, &legacy.object_ref(&()))
            .await
        {
            warn!(%error, "failed to publish conversion warning");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_merge_preserves_the_target_lifecycle_fields() {
        let existing = ObjectMeta {
            uid: Some("u-1".into()),
            resource_version: Some("42".into()),
            generation: Some(7),
            finalizers: Some(vec!["handover.machine.dev/sync".into()]),
            labels: Some([("stale".to_string(), "yes".to_string())].into()),
            ..Default::default()
        };
        let mut desired = ObjectMeta {
            labels: Some([("fresh".to_string(), "yes".to_string())].into()),
            ..Default::default()
        };

        merge_identity(&mut desired, &existing);
        assert_eq!(desired.uid.as_deref(), Some("u-1"));
        assert_eq!(desired.resource_version.as_deref(), Some("42"));
        assert_eq!(desired.generation, Some(7));
        assert_eq!(desired.finalizers.as_ref().unwrap().len(), 1);
        // Identity only: the desired labels win.
        assert!(desired.labels.unwrap().contains_key("fresh"));
    }

    #[test]
    fn meta_diff_is_limited_to_labels_and_annotations() {
        let mut a = ObjectMeta {
            labels: Some([("k".to_string(), "v".to_string())].into()),
            ..Default::default()
        };
        let mut b = a.clone();
        b.resource_version = Some("99".into());
        b.generation = Some(3);
        assert!(!meta_subset_changed(&a, &b));

        a.annotations = Some([("note".to_string(), "x".to_string())].into());
        assert!(meta_subset_changed(&a, &b));
    }
}
