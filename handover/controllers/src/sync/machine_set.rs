//! Bidirectional mirroring of machine-sets and their infrastructure
//! templates.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use handover_api::{
    conditions,
    legacy::LegacyMachineSet,
    modern::ModernMachineSet,
    reasons, MachineAuthority, MODERN_MACHINE_SET_FINALIZER, SYNCHRONIZED_CONDITION,
    SYNC_FINALIZER,
};
use kube::{
    api::PostParams,
    core::DynamicObject,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Api, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    direction::{sync_direction, SyncDirection},
    error::{ControllerError, Result},
    status,
    sync::{
        self,
        lifecycle::{self, DeletionAction},
    },
    Context,
};

pub(crate) const CONTROLLER: &str = "machineset-sync-controller";

/// Runs the machine-set sync controller until shutdown.
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) {
    let legacy_api: Api<LegacyMachineSet> =
        Api::namespaced(ctx.client.clone(), &ctx.legacy_namespace);
    let modern_api: Api<ModernMachineSet> =
        Api::namespaced(ctx.client.clone(), &ctx.modern_namespace);
    let template_resource = ctx.converter.template_resource();
    let template_api: Api<DynamicObject> = Api::namespaced_with(
        ctx.client.clone(),
        &ctx.modern_namespace,
        &template_resource,
    );
    let legacy_namespace = ctx.legacy_namespace.clone();
    let template_mapper_namespace = ctx.legacy_namespace.clone();

    info!("starting machine-set sync controller");
    Controller::new(legacy_api, watcher::Config::default())
        .watches(
            modern_api,
            watcher::Config::default(),
            move |modern: ModernMachineSet| {
                Some(
                    ObjectRef::<LegacyMachineSet>::new(&modern.name_any())
                        .within(&legacy_namespace),
                )
            },
        )
        .watches_with(
            template_api,
            template_resource,
            watcher::Config::default(),
            move |template: DynamicObject| {
                template.metadata.name.map(|name| {
                    ObjectRef::<LegacyMachineSet>::new(&name).within(&template_mapper_namespace)
                })
            },
        )
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((object, _)) => debug!(%object, "reconciled"),
                Err(error) => warn!(%error, "machine-set sync reconcile failed"),
            }
            futures::future::ready(())
        })
        .await;
    debug!("machine-set sync controller finished");
}

fn error_policy(
    legacy: Arc<LegacyMachineSet>,
    error: &ControllerError,
    _ctx: Arc<Context>,
) -> Action {
    error!(machine_set = %legacy.name_any(), %error, "machine-set sync failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile(legacy: Arc<LegacyMachineSet>, ctx: Arc<Context>) -> Result<Action> {
    let name = legacy.name_any();
    let legacy_api: Api<LegacyMachineSet> =
        Api::namespaced(ctx.client.clone(), &ctx.legacy_namespace);
    let modern_api: Api<ModernMachineSet> =
        Api::namespaced(ctx.client.clone(), &ctx.modern_namespace);

    let modern = modern_api.get_opt(&name).await?;

    let observed = legacy.status.as_ref().and_then(|status| status.authoritative_api);
    let direction = sync_direction(observed, modern.is_some())?;
    if matches!(direction, SyncDirection::Frozen | SyncDirection::Idle) {
        return Ok(Action::await_change());
    }

    let pair_established = legacy
        .status
        .as_ref()
        .and_then(|status| status.synchronized_api)
        .is_some();
    let plan = lifecycle::plan_deletion(
        direction,
        Some(lifecycle::observe(legacy.as_ref(), MODERN_MACHINE_SET_FINALIZER)),
        modern
            .as_ref()
            .map(|modern| lifecycle::observe(modern, MODERN_MACHINE_SET_FINALIZER)),
        pair_established,
    );
    if plan != DeletionAction::Proceed {
        return execute_deletion(plan, &legacy_api, &modern_api, &legacy, modern.as_ref()).await;
    }

    lifecycle::ensure_sync_finalizer(&legacy_api, legacy.as_ref()).await?;
    if let Some(modern) = modern.as_ref() {
        lifecycle::ensure_sync_finalizer(&modern_api, modern).await?;
    }

    match (direction, modern) {
        (SyncDirection::LegacyToModern, modern) => {
            sync_legacy_to_modern(&ctx, &legacy_api, &modern_api, &legacy, modern).await
        }
        (SyncDirection::ModernToLegacy, Some(modern)) => {
            sync_modern_to_legacy(&ctx, &legacy_api, &legacy, modern).await
        }
        // The direction predicate only picks ModernToLegacy when the modern
        // mirror exists.
        _ => Err(ControllerError::invalid_state(
            "MachineSet",
            name,
            "modern mirror disappeared during a modern-to-legacy sync",
        )),
    }
}

async fn execute_deletion(
    plan: DeletionAction,
    legacy_api: &Api<LegacyMachineSet>,
    modern_api: &Api<ModernMachineSet>,
    legacy: &Arc<LegacyMachineSet>,
    modern: Option<&ModernMachineSet>,
) -> Result<Action> {
    let name = legacy.name_any();
    debug!(machine_set = %name, ?plan, "executing deletion step");

    match plan {
        DeletionAction::Proceed => Ok(Action::await_change()),
        DeletionAction::DeleteLegacy => {
            sync::delete_ignoring_absent(legacy_api, &name).await?;
            Ok(Action::requeue(sync::DELETION_REQUEUE))
        }
        DeletionAction::RemoveLegacySyncFinalizer => {
            lifecycle::remove_finalizers(legacy_api, legacy.as_ref(), &[SYNC_FINALIZER]).await?;
            Ok(Action::await_change())
        }
        DeletionAction::DeleteModernAndStripFinalizers => {
            sync::delete_ignoring_absent(modern_api, &name).await?;
            if let Some(modern) = modern {
                lifecycle::remove_finalizers(
                    modern_api,
                    modern,
                    &[MODERN_MACHINE_SET_FINALIZER, SYNC_FINALIZER],
                )
                .await?;
            }
            Ok(Action::requeue(sync::DELETION_REQUEUE))
        }
        DeletionAction::StripModernFinalizers => {
            if let Some(modern) = modern {
                lifecycle::remove_finalizers(
                    modern_api,
                    modern,
                    &[MODERN_MACHINE_SET_FINALIZER, SYNC_FINALIZER],
                )
                .await?;
            }
            Ok(Action::requeue(sync::DELETION_REQUEUE))
        }
        DeletionAction::RemoveBothSyncFinalizers
        | DeletionAction::RemoveModernThenLegacySyncFinalizers => {
            if let Some(modern) = modern {
                lifecycle::remove_finalizers(modern_api, modern, &[SYNC_FINALIZER]).await?;
            }
            lifecycle::remove_finalizers(legacy_api, legacy.as_ref(), &[SYNC_FINALIZER]).await?;
            Ok(Action::await_change())
        }
        DeletionAction::RemoveModernSyncFinalizer => {
            if let Some(modern) = modern {
                lifecycle::remove_finalizers(modern_api, modern, &[SYNC_FINALIZER]).await?;
            }
            Ok(Action::await_change())
        }
        DeletionAction::WaitForModernActuator => Ok(Action::requeue(sync::DELETION_REQUEUE)),
    }
}

async fn sync_legacy_to_modern(
    ctx: &Arc<Context>,
    legacy_api: &Api<LegacyMachineSet>,
    modern_api: &Api<ModernMachineSet>,
    legacy: &Arc<LegacyMachineSet>,
    existing_modern: Option<ModernMachineSet>,
) -> Result<Action> {
    let name = legacy.name_any();
    let resource_version = legacy.resource_version();
    let observed_generation = legacy.metadata.generation;
    let existing_conditions = legacy
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_deref());

    let cluster = match sync::fetch_cluster(ctx).await {
        Ok(cluster) => cluster,
        Err(primary) => {
            return Err(sync::fail_sync(
                legacy_api,
                &name,
                resource_version.as_deref(),
                CONTROLLER,
                reasons::FAILED_TO_GET_INFRA_RESOURCES,
                primary,
                observed_generation,
                existing_conditions,
            )
            .await);
        }
    };

    let (mut desired, mut template_desired, warnings) =
        match ctx.converter.legacy_machine_set_to_modern(legacy, &cluster) {
            Ok(converted) => converted,
            Err(err) if err.is_terminal() => {
                return sync::fail_terminally(
                    legacy_api,
                    &name,
                    resource_version.as_deref(),
                    CONTROLLER,
                    reasons::FAILED_TO_CONVERT_LEGACY_TO_MODERN,
                    ControllerError::ConvertLegacyToModern(err),
                    observed_generation,
                    existing_conditions,
                )
                .await;
            }
            Err(err) => {
                return Err(sync::fail_sync(
                    legacy_api,
                    &name,
                    resource_version.as_deref(),
                    CONTROLLER,
                    reasons::FAILED_TO_CONVERT_LEGACY_TO_MODERN,
                    ControllerError::ConvertLegacyToModern(err),
                    observed_generation,
                    existing_conditions,
                )
                .await);
            }
        };

    sync::emit_warnings(ctx, legacy.as_ref(), &warnings).await;

    let keep_paused = legacy
        .status
        .as_ref()
        .and_then(|status| status.authoritative_api)
        == Some(MachineAuthority::Legacy);

    // The template goes first so the set never references a missing one.
    let template_api: Api<DynamicObject> = Api::namespaced_with(
        ctx.client.clone(),
        &ctx.modern_namespace,
        &ctx.converter.template_resource(),
    );
    template_desired.metadata.namespace = Some(ctx.modern_namespace.clone());
    template_desired.metadata.owner_references = Some(vec![sync::cluster_owner_ref(&cluster)]);
    if keep_paused {
        sync::insert_paused_annotation(&mut template_desired.metadata);
    }
    if let Err(primary) = ensure_template(&template_api, &name, template_desired).await {
        return Err(sync::fail_sync(
            legacy_api,
            &name,
            resource_version.as_deref(),
            CONTROLLER,
            reasons::FAILED_TO_GET_INFRA_RESOURCES,
            primary,
            observed_generation,
            existing_conditions,
        )
        .await);
    }

    desired.metadata.namespace = Some(ctx.modern_namespace.clone());
    desired.metadata.owner_references = Some(vec![sync::cluster_owner_ref(&cluster)]);
    desired.spec.template.spec.infrastructure_ref.namespace = Some(ctx.modern_namespace.clone());
    if keep_paused {
        sync::insert_paused_annotation(&mut desired.metadata);
    }

    let (operation, write) = match existing_modern {
        None => (
            "FailedToCreateModernMachineSet",
            modern_api
                .create(&PostParams::default(), &desired)
                .await
                .map(|_| true),
        ),
        Some(existing) => {
            sync::merge_identity(&mut desired.metadata, &existing.metadata);
            let spec_changed =
                serde_json::to_value(&existing.spec)? != serde_json::to_value(&desired.spec)?;
            if spec_changed || sync::meta_subset_changed(&existing.metadata, &desired.metadata) {
                (
                    "FailedToUpdateModernMachineSet",
                    modern_api
                        .replace(&name, &PostParams::default(), &desired)
                        .await
                        .map(|_| true),
                )
            } else {
                ("", Ok(false))
            }
        }
    };
    if let Err(error) = write {
        return Err(sync::fail_sync(
            legacy_api,
            &name,
            resource_version.as_deref(),
            CONTROLLER,
            operation,
            error.into(),
            observed_generation,
            existing_conditions,
        )
        .await);
    }

    let source_generation = legacy.metadata.generation.unwrap_or_default();
    if !status_is_synchronized(legacy, MachineAuthority::Legacy, source_generation) {
        status::apply_status(
            legacy_api,
            &name,
            resource_version.as_deref(),
            &status::synchronized_condition_owner(CONTROLLER),
            status::synchronized_status(
                MachineAuthority::Legacy,
                source_generation,
                observed_generation,
                existing_conditions,
            ),
        )
        .await?;
    }
    Ok(Action::await_change())
}

async fn sync_modern_to_legacy(
    ctx: &Arc<Context>,
    legacy_api: &Api<LegacyMachineSet>,
    legacy: &Arc<LegacyMachineSet>,
    modern: ModernMachineSet,
) -> Result<Action> {
    let name = legacy.name_any();
    let mut resource_version = legacy.resource_version();
    let observed_generation = legacy.metadata.generation;
    let existing_conditions = legacy
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_deref());

    let cluster = match sync::fetch_cluster(ctx).await {
        Ok(cluster) => cluster,
        Err(primary) => {
            return Err(sync::fail_sync(
                legacy_api,
                &name,
                resource_version.as_deref(),
                CONTROLLER,
                reasons::FAILED_TO_GET_INFRA_RESOURCES,
                primary,
                observed_generation,
                existing_conditions,
            )
            .await);
        }
    };

    // Unlike machines, the template is required: the set cannot round-trip
    // without its provider payload.
    let template_api: Api<DynamicObject> = Api::namespaced_with(
        ctx.client.clone(),
        &ctx.modern_namespace,
        &ctx.converter.template_resource(),
    );
    let template_name = modern
        .spec
        .template
        .spec
        .infrastructure_ref
        .name
        .clone()
        .unwrap_or_else(|| name.clone());
    let template = match template_api.get_opt(&template_name).await? {
        Some(template) => template,
        None => {
            let primary = ControllerError::InfraResources(format!(
                "infrastructure template {template_name} not found in {}",
                ctx.modern_namespace,
            ));
            return Err(sync::fail_sync(
                legacy_api,
                &name,
                resource_version.as_deref(),
                CONTROLLER,
                reasons::FAILED_TO_GET_INFRA_RESOURCES,
                primary,
                observed_generation,
                existing_conditions,
            )
            .await);
        }
    };

    let (mut desired, warnings) =
        match ctx
            .converter
            .modern_machine_set_to_legacy(&modern, &template, &cluster)
        {
            Ok(converted) => converted,
            Err(err) if err.is_terminal() => {
                return sync::fail_terminally(
                    legacy_api,
                    &name,
                    resource_version.as_deref(),
                    CONTROLLER,
                    reasons::FAILED_TO_CONVERT_MODERN_TO_LEGACY,
                    ControllerError::ConvertModernToLegacy(err),
                    observed_generation,
                    existing_conditions,
                )
                .await;
            }
            Err(err) => {
                return Err(sync::fail_sync(
                    legacy_api,
                    &name,
                    resource_version.as_deref(),
                    CONTROLLER,
                    reasons::FAILED_TO_CONVERT_MODERN_TO_LEGACY,
                    ControllerError::ConvertModernToLegacy(err),
                    observed_generation,
                    existing_conditions,
                )
                .await);
            }
        };

    sync::emit_warnings(ctx, legacy.as_ref(), &warnings).await;

    // Fields that do not round-trip: authority at set and template level,
    // and the immutable selector.
    desired.spec.authoritative_api = legacy.spec.authoritative_api;
    desired.spec.template.spec.authoritative_api = legacy.spec.template.spec.authoritative_api;
    desired.spec.selector = legacy.spec.selector.clone();
    desired.metadata.namespace = Some(ctx.legacy_namespace.clone());
    sync::merge_identity(&mut desired.metadata, &legacy.metadata);
    desired.metadata.owner_references = None;

    if machine_set_changed(legacy, &desired)? {
        let updated = legacy_api
            .replace(&name, &PostParams::default(), &desired)
            .await
            .map_err(ControllerError::from);
        match updated {
            Ok(updated) => resource_version = updated.resource_version(),
            Err(primary) => {
                return Err(sync::fail_sync(
                    legacy_api,
                    &name,
                    resource_version.as_deref(),
                    CONTROLLER,
                    "FailedToUpdateLegacyMachineSet",
                    primary,
                    observed_generation,
                    existing_conditions,
                )
                .await);
            }
        }
    }

    let source_generation = modern.metadata.generation.unwrap_or_default();
    if !status_is_synchronized(legacy, MachineAuthority::Modern, source_generation) {
        status::apply_status(
            legacy_api,
            &name,
            resource_version.as_deref(),
            &status::synchronized_condition_owner(CONTROLLER),
            status::synchronized_status(
                MachineAuthority::Modern,
                source_generation,
                observed_generation,
                existing_conditions,
            ),
        )
        .await?;
    }
    Ok(Action::await_change())
}

/// Creates or updates the infrastructure template after diffing its spec and
/// object-meta subset.
async fn ensure_template(
    template_api: &Api<DynamicObject>,
    name: &str,
    desired: DynamicObject,
) -> Result<()> {
    match template_api.get_opt(name).await? {
        None => {
            template_api.create(&PostParams::default(), &desired).await?;
        }
        Some(existing) => {
            let mut desired = desired;
            sync::merge_identity(&mut desired.metadata, &existing.metadata);
            let spec_changed = existing.data.get("spec") != desired.data.get("spec");
            if spec_changed || sync::meta_subset_changed(&existing.metadata, &desired.metadata) {
                template_api
                    .replace(name, &PostParams::default(), &desired)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Diff on provider spec (semantic), spec minus provider spec, and the
/// curated object-meta subset.
fn machine_set_changed(existing: &LegacyMachineSet, desired: &LegacyMachineSet) -> Result<bool> {
    let provider_changed = serde_json::to_value(&existing.spec.template.spec.provider_spec)?
        != serde_json::to_value(&desired.spec.template.spec.provider_spec)?;

    let mut existing_spec = serde_json::to_value(&existing.spec)?;
    let mut desired_spec = serde_json::to_value(&desired.spec)?;
    for value in [&mut existing_spec, &mut desired_spec] {
        if let Some(spec) = value.pointer_mut("/template/spec").and_then(|v| v.as_object_mut()) {
            spec.remove("providerSpec");
        }
    }

    Ok(provider_changed
        || existing_spec != desired_spec
        || sync::meta_subset_changed(&existing.metadata, &desired.metadata))
}

fn status_is_synchronized(
    legacy: &LegacyMachineSet,
    source: MachineAuthority,
    source_generation: i64,
) -> bool {
    let Some(status) = legacy.status.as_ref() else {
        return false;
    };
    status.synchronized_api == Some(source)
        && status.synchronized_generation == Some(source_generation)
        && conditions::find(status.conditions.as_deref(), SYNCHRONIZED_CONDITION).is_some_and(
            |condition| {
                condition.status == conditions::CONDITION_TRUE
                    && condition.reason == reasons::RESOURCE_SYNCHRONIZED
            },
        )
}

#[cfg(test)]
mod tests {
    use handover_api::legacy::{
        LegacyMachineSetSpec, LegacyMachineSpec, LegacyMachineTemplate, ProviderSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

    use super::*;

    fn set(instance_type: &str, replicas: i32) -> LegacyMachineSet {
        LegacyMachineSet::new(
            "worker-a",
            LegacyMachineSetSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some([("set".to_string(), "worker-a".to_string())].into()),
                    ..Default::default()
                },
                template: LegacyMachineTemplate {
                    metadata: None,
                    spec: LegacyMachineSpec {
                        provider_spec: Some(ProviderSpec {
                            value: Some(serde_json::json!({"instanceType": instance_type})),
                        }),
                        ..Default::default()
                    },
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn unchanged_set_issues_no_update() {
        let stored = set("m5.large", 3);
        assert!(!machine_set_changed(&stored, &stored.clone()).unwrap());
    }

    #[test]
    fn template_provider_drift_is_a_change() {
        assert!(machine_set_changed(&set("m5.large", 3), &set("m5.xlarge", 3)).unwrap());
    }

    #[test]
    fn replica_drift_is_a_change_outside_the_provider_spec() {
        assert!(machine_set_changed(&set("m5.large", 3), &set("m5.large", 5)).unwrap());
    }

    #[test]
    fn label_only_drift_is_a_change() {
        let stored = set("m5.large", 3);
        let mut desired = stored.clone();
        desired.metadata.labels = Some([("team".to_string(), "compute".to_string())].into());
        assert!(machine_set_changed(&stored, &desired).unwrap());
    }
}
