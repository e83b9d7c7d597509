//! Bidirectional mirroring of individual machines.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use handover_api::{
    conditions,
    legacy::LegacyMachine,
    modern::ModernMachine,
    reasons, MachineAuthority, MODERN_MACHINE_FINALIZER, SYNCHRONIZED_CONDITION, SYNC_FINALIZER,
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

pub(crate) const CONTROLLER: &str = "machine-sync-controller";

/// Runs the machine sync controller until shutdown.
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) {
    let legacy_api: Api<LegacyMachine> = Api::namespaced(ctx.client.clone(), &ctx.legacy_namespace);
    let modern_api: Api<ModernMachine> = Api::namespaced(ctx.client.clone(), &ctx.modern_namespace);
    let infra_resource = ctx.converter.infra_machine_resource();
    let infra_api: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &ctx.modern_namespace, &infra_resource);
    let legacy_namespace = ctx.legacy_namespace.clone();
    let infra_mapper_namespace = ctx.legacy_namespace.clone();

    info!("starting machine sync controller");
    Controller::new(legacy_api, watcher::Config::default())
        .watches(
            modern_api,
            watcher::Config::default(),
            move |modern: ModernMachine| {
                Some(ObjectRef::<LegacyMachine>::new(&modern.name_any()).within(&legacy_namespace))
            },
        )
        .watches_with(
            infra_api,
            infra_resource,
            watcher::Config::default(),
            move |infra: DynamicObject| {
                infra.metadata.name.map(|name| {
                    ObjectRef::<LegacyMachine>::new(&name).within(&infra_mapper_namespace)
                })
            },
        )
        .graceful_shutdown_on(shutdown.cancelled_owned())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            match result {
                Ok((object, _)) => debug!(%object, "reconciled"),
                Err(error) => warn!(%error, "machine sync reconcile failed"),
            }
            futures::future::ready(())
        })
        .await;
    debug!("machine sync controller finished");
}

fn error_policy(legacy: Arc<LegacyMachine>, error: &ControllerError, _ctx: Arc<Context>) -> Action {
    error!(machine = %legacy.name_any(), %error, "machine sync failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile(legacy: Arc<LegacyMachine>, ctx: Arc<Context>) -> Result<Action> {
    let name = legacy.name_any();
    let legacy_api: Api<LegacyMachine> = Api::namespaced(ctx.client.clone(), &ctx.legacy_namespace);
    let modern_api: Api<ModernMachine> = Api::namespaced(ctx.client.clone(), &ctx.modern_namespace);

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
        Some(lifecycle::observe(legacy.as_ref(), MODERN_MACHINE_FINALIZER)),
        modern
            .as_ref()
            .map(|modern| lifecycle::observe(modern, MODERN_MACHINE_FINALIZER)),
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
            "Machine",
            name,
            "modern mirror disappeared during a modern-to-legacy sync",
        )),
    }
}

async fn execute_deletion(
    plan: DeletionAction,
    legacy_api: &Api<LegacyMachine>,
    modern_api: &Api<ModernMachine>,
    legacy: &Arc<LegacyMachine>,
    modern: Option<&ModernMachine>,
) -> Result<Action> {
    let name = legacy.name_any();
    debug!(machine = %name, ?plan, "executing deletion step");

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
                    &[MODERN_MACHINE_FINALIZER, SYNC_FINALIZER],
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
                    &[MODERN_MACHINE_FINALIZER, SYNC_FINALIZER],
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
    legacy_api: &Api<LegacyMachine>,
    modern_api: &Api<ModernMachine>,
    legacy: &Arc<LegacyMachine>,
    existing_modern: Option<ModernMachine>,
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

    let (mut desired, mut infra_desired, warnings) =
        match ctx.converter.legacy_machine_to_modern(legacy, &cluster) {
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

    // While legacy holds authority, everything on the modern side stays
    // quiescent behind the paused annotation.
    let keep_paused = legacy
        .status
        .as_ref()
        .and_then(|status| status.authoritative_api)
        == Some(MachineAuthority::Legacy);

    // The infrastructure machine goes first so the machine never references
    // a missing provider payload.
    let infra_api: Api<DynamicObject> = Api::namespaced_with(
        ctx.client.clone(),
        &ctx.modern_namespace,
        &ctx.converter.infra_machine_resource(),
    );
    infra_desired.metadata.namespace = Some(ctx.modern_namespace.clone());
    infra_desired.metadata.owner_references = Some(vec![sync::cluster_owner_ref(&cluster)]);
    if keep_paused {
        sync::insert_paused_annotation(&mut infra_desired.metadata);
    }
    if let Err(primary) = ensure_infra_machine(&infra_api, &name, infra_desired).await {
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
    desired.spec.infrastructure_ref.namespace = Some(ctx.modern_namespace.clone());
    if keep_paused {
        sync::insert_paused_annotation(&mut desired.metadata);
    }

    let (operation, write) = match existing_modern {
        None => (
            "FailedToCreateModernMachine",
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
                    "FailedToUpdateModernMachine",
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
    legacy_api: &Api<LegacyMachine>,
    legacy: &Arc<LegacyMachine>,
    modern: ModernMachine,
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

    let infra_api: Api<DynamicObject> = Api::namespaced_with(
        ctx.client.clone(),
        &ctx.modern_namespace,
        &ctx.converter.infra_machine_resource(),
    );
    let infra_machine = infra_api.get_opt(&name).await?;

    let (mut desired, warnings) =
        match ctx
            .converter
            .modern_machine_to_legacy(&modern, infra_machine.as_ref(), &cluster)
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

    // Legacy-only fields do not round-trip: restore them from the existing
    // mirror before diffing.
    desired.spec.authoritative_api = legacy.spec.authoritative_api;
    if desired.spec.provider_spec.is_none() {
        desired.spec.provider_spec = legacy.spec.provider_spec.clone();
    }
    desired.metadata.namespace = Some(ctx.legacy_namespace.clone());
    sync::merge_identity(&mut desired.metadata, &legacy.metadata);
    desired.metadata.owner_references = None;

    if machine_changed(legacy, &desired)? {
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
                    "FailedToUpdateLegacyMachine",
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

/// Creates or updates the infrastructure machine carrying the provider
/// payload.
async fn ensure_infra_machine(
    infra_api: &Api<DynamicObject>,
    name: &str,
    desired: DynamicObject,
) -> Result<()> {
    match infra_api.get_opt(name).await? {
        None => {
            infra_api.create(&PostParams::default(), &desired).await?;
        }
        Some(existing) => {
            let mut desired = desired;
            sync::merge_identity(&mut desired.metadata, &existing.metadata);
            let spec_changed = existing.data.get("spec") != desired.data.get("spec");
            if spec_changed || sync::meta_subset_changed(&existing.metadata, &desired.metadata) {
                infra_api.replace(name, &PostParams::default(), &desired).await?;
            }
        }
    }
    Ok(())
}

/// Whether the rebuilt legacy machine differs from the stored one on the
/// fields the write protocol owns: provider spec (compared semantically),
/// the rest of the spec, and the curated object-meta subset.
fn machine_changed(existing: &LegacyMachine, desired: &LegacyMachine) -> Result<bool> {
    let provider_changed = serde_json::to_value(&existing.spec.provider_spec)?
        != serde_json::to_value(&desired.spec.provider_spec)?;

    let mut existing_spec = serde_json::to_value(&existing.spec)?;
    let mut desired_spec = serde_json::to_value(&desired.spec)?;
    for value in [&mut existing_spec, &mut desired_spec] {
        if let Some(map) = value.as_object_mut() {
            map.remove("providerSpec");
        }
    }

    Ok(provider_changed
        || existing_spec != desired_spec
        || sync::meta_subset_changed(&existing.metadata, &desired.metadata))
}

fn status_is_synchronized(
    legacy: &LegacyMachine,
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
    use handover_api::legacy::{LegacyMachineSpec, LegacyMachineStatus, ProviderSpec};

    use super::*;

    fn machine(authority: MachineAuthority, instance_type: &str) -> LegacyMachine {
        let mut machine = LegacyMachine::new(
            "worker-a-7xk2p",
            LegacyMachineSpec {
                authoritative_api: authority,
                provider_spec: Some(ProviderSpec {
                    value: Some(serde_json::json!({"instanceType": instance_type})),
                }),
                ..Default::default()
            },
        );
        machine.metadata.generation = Some(4);
        machine
    }

    #[test]
    fn unchanged_machine_issues_no_update() {
        let stored = machine(MachineAuthority::Legacy, "m5.large");
        let desired = stored.clone();
        assert!(!machine_changed(&stored, &desired).unwrap());
    }

    #[test]
    fn provider_spec_drift_is_a_change() {
        let stored = machine(MachineAuthority::Legacy, "m5.large");
        let desired = machine(MachineAuthority::Legacy, "m5.xlarge");
        assert!(machine_changed(&stored, &desired).unwrap());
    }

    #[test]
    fn authority_fields_participate_in_the_non_provider_diff() {
        let stored = machine(MachineAuthority::Legacy, "m5.large");
        let desired = machine(MachineAuthority::Modern, "m5.large");
        assert!(machine_changed(&stored, &desired).unwrap());
    }

    #[test]
    fn synchronized_status_check_requires_matching_provenance() {
        let mut legacy = machine(MachineAuthority::Legacy, "m5.large");
        assert!(!status_is_synchronized(&legacy, MachineAuthority::Legacy, 4));

        legacy.status = Some(LegacyMachineStatus {
            authoritative_api: Some(MachineAuthority::Legacy),
            synchronized_api: Some(MachineAuthority::Legacy),
            synchronized_generation: Some(4),
            conditions: Some(vec![handover_api::conditions::new_condition(
                SYNCHRONIZED_CONDITION,
                conditions::CONDITION_TRUE,
                reasons::RESOURCE_SYNCHRONIZED,
                "",
                Some(4),
            )]),
        });
        assert!(status_is_synchronized(&legacy, MachineAuthority::Legacy, 4));
        // A stale generation or the wrong source must force a fresh write.
        assert!(!status_is_synchronized(&legacy, MachineAuthority::Legacy, 5));
        assert!(!status_is_synchronized(&legacy, MachineAuthority::Modern, 4));
    }
}
