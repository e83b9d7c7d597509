//! Authority hand-off for individual machines.
//!
//! Machines differ from sets in one respect: pausing the modern side also
//! pauses the infrastructure machine referenced by `spec.infrastructureRef`.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use handover_api::{
    conditions, has_paused_annotation, legacy::LegacyMachine, modern::ModernMachine,
    MachineAuthority, PAUSED_CONDITION, SYNCHRONIZED_CONDITION,
};
use kube::{
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
    error::{ControllerError, Result},
    migration::{self, MigrationObservation, MigrationStep},
    status,
    sync::lifecycle,
    Context,
};

pub(crate) const CONTROLLER: &str = "machine-migration-controller";

/// Runs the machine migration controller until shutdown.
pub async fn run(ctx: Arc<Context>, shutdown: CancellationToken) {
    let legacy_api: Api<LegacyMachine> = Api::namespaced(ctx.client.clone(), &ctx.legacy_namespace);
    let modern_api: Api<ModernMachine> = Api::namespaced(ctx.client.clone(), &ctx.modern_namespace);
    let infra_resource = ctx.converter.infra_machine_resource();
    let infra_api: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &ctx.modern_namespace, &infra_resource);
    let legacy_namespace = ctx.legacy_namespace.clone();
    let infra_mapper_namespace = ctx.legacy_namespace.clone();

    info!("starting machine migration controller");
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
                Err(error) => warn!(%error, "machine migration reconcile failed"),
            }
            futures::future::ready(())
        })
        .await;
    debug!("machine migration controller finished");
}

fn error_policy(legacy: Arc<LegacyMachine>, error: &ControllerError, _ctx: Arc<Context>) -> Action {
    error!(machine = %legacy.name_any(), %error, "machine migration failed");
    Action::requeue(Duration::from_secs(5))
}

async fn reconcile(legacy: Arc<LegacyMachine>, ctx: Arc<Context>) -> Result<Action> {
    if legacy.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let name = legacy.name_any();
    let legacy_api: Api<LegacyMachine> = Api::namespaced(ctx.client.clone(), &ctx.legacy_namespace);
    let modern_api: Api<ModernMachine> = Api::namespaced(ctx.client.clone(), &ctx.modern_namespace);
    let infra_api: Api<DynamicObject> = Api::namespaced_with(
        ctx.client.clone(),
        &ctx.modern_namespace,
        &ctx.converter.infra_machine_resource(),
    );

    let modern = modern_api.get_opt(&name).await?;
    let infra_name = modern
        .as_ref()
        .and_then(|modern| modern.spec.infrastructure_ref.name.clone())
        .unwrap_or_else(|| name.clone());
    let infra = infra_api.get_opt(&infra_name).await?;

    lifecycle::ensure_sync_finalizer(&legacy_api, legacy.as_ref()).await?;
    if let Some(modern) = modern
        .as_ref()
        .filter(|modern| modern.metadata.deletion_timestamp.is_none())
    {
        lifecycle::ensure_sync_finalizer(&modern_api, modern).await?;
    }

    let status = legacy.status.as_ref();
    let status_conditions = status.and_then(|status| status.conditions.as_deref());
    let view = MigrationObservation {
        kind: "Machine",
        name: name.clone(),
        desired: legacy.spec.authoritative_api,
        observed: status.and_then(|status| status.authoritative_api),
        synchronized_api: status.and_then(|status| status.synchronized_api),
        synchronized_generation: status.and_then(|status| status.synchronized_generation),
        synchronized_condition: conditions::is_true(status_conditions, SYNCHRONIZED_CONDITION),
        legacy_generation: legacy.metadata.generation.unwrap_or_default(),
        modern_generation: modern.as_ref().and_then(|modern| modern.metadata.generation),
        legacy_paused: conditions::is_true(status_conditions, PAUSED_CONDITION),
        modern: modern.as_ref().map(|modern| {
            migration::observe_pause(
                &modern.metadata,
                modern
                    .status
                    .as_ref()
                    .and_then(|status| status.conditions.as_deref()),
            )
        }),
        infra: infra.as_ref().map(migration::observe_dynamic_pause),
        infra_required: true,
    };

    let step = migration::next_step(&view)?;
    debug!(machine = %name, ?step, "migration step");

    let resource_version = legacy.resource_version();
    match step {
        MigrationStep::Noop | MigrationStep::WaitForSync => Ok(Action::await_change()),

        MigrationStep::Initialize => {
            status::apply_status(
                &legacy_api,
                &name,
                resource_version.as_deref(),
                &status::authoritative_api_owner(CONTROLLER),
                status::authority_status(legacy.spec.authoritative_api),
            )
            .await?;
            Ok(Action::await_change())
        }

        MigrationStep::Acknowledge => {
            status::apply_status(
                &legacy_api,
                &name,
                resource_version.as_deref(),
                &status::authoritative_api_owner(CONTROLLER),
                status::authority_status(MachineAuthority::Migrating),
            )
            .await?;
            Ok(Action::await_change())
        }

        MigrationStep::Cancel => {
            // Roll back without ever entering the target authority. A
            // missing infra object is skipped here: cleanup must not block
            // on it.
            if let Some(modern) = modern
                .as_ref()
                .filter(|modern| has_paused_annotation(&modern.metadata))
            {
                migration::set_pause_annotation(&modern_api, &modern.name_any(), false).await?;
            }
            if infra
                .as_ref()
                .is_some_and(|infra| has_paused_annotation(&infra.metadata))
            {
                migration::set_pause_annotation(&infra_api, &infra_name, false).await?;
            }
            let Some(current) = MachineAuthority::from_synchronized_api(view.synchronized_api)
            else {
                return Ok(Action::requeue(migration::WAIT_REQUEUE));
            };
            status::apply_status(
                &legacy_api,
                &name,
                resource_version.as_deref(),
                &status::authoritative_api_owner(CONTROLLER),
                status::authority_changed_status(
                    current,
                    legacy.metadata.generation,
                    status_conditions,
                ),
            )
            .await?;
            Ok(Action::await_change())
        }

        MigrationStep::PauseOld => {
            if !view.modern.unwrap_or_default().annotated {
                migration::set_pause_annotation(&modern_api, &name, true).await?;
            }
            if infra.is_some() && !view.infra.unwrap_or_default().annotated {
                migration::set_pause_annotation(&infra_api, &infra_name, true).await?;
            }
            // The resulting condition flip arrives through no watch.
            Ok(Action::requeue(migration::PAUSE_REQUEUE))
        }

        MigrationStep::WaitForOldPause | MigrationStep::WaitForNewUnpause => {
            Ok(Action::requeue(migration::WAIT_REQUEUE))
        }

        MigrationStep::UnpauseNew => {
            if view.modern.unwrap_or_default().annotated {
                migration::set_pause_annotation(&modern_api, &name, false).await?;
            }
            if view.infra.unwrap_or_default().annotated {
                migration::set_pause_annotation(&infra_api, &infra_name, false).await?;
            }
            Ok(Action::requeue(migration::PAUSE_REQUEUE))
        }

        MigrationStep::Commit => {
            status::apply_status(
                &legacy_api,
                &name,
                resource_version.as_deref(),
                &status::authoritative_api_owner(CONTROLLER),
                status::authority_changed_status(
                    legacy.spec.authoritative_api,
                    legacy.metadata.generation,
                    status_conditions,
                ),
            )
            .await?;
            Ok(Action::await_change())
        }
    }
}
