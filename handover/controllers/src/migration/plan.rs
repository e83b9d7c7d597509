//! The authority hand-off state machine, as a pure function of one
//! observation.
//!
//! Ordering is load-bearing: cancellation is detected before the
//! synchronisation gate, and the gate strictly precedes the `Migrating`
//! acknowledgement. Sync freezes the moment status flips to `Migrating`, so
//! acknowledging an unsynchronised resource would deadlock it.

use handover_api::MachineAuthority;

use crate::error::ControllerError;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct PauseObservation {
    /// The paused annotation is present (the request).
    pub annotated: bool,
    /// The `Paused` condition is `True` (the acknowledgement).
    pub paused: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct MigrationObservation {
    /// Kind and name of the legacy resource, for error context.
    pub kind: &'static str,
    pub name: String,
    /// `spec.authoritativeAPI`.
    pub desired: MachineAuthority,
    /// `status.authoritativeAPI`.
    pub observed: Option<MachineAuthority>,
    pub synchronized_api: Option<MachineAuthority>,
    pub synchronized_generation: Option<i64>,
    /// `Synchronized` condition is `True`.
    pub synchronized_condition: bool,
    pub legacy_generation: i64,
    pub modern_generation: Option<i64>,
    /// `Paused` condition on the legacy mirror; absent counts as unpaused.
    pub legacy_paused: bool,
    pub modern: Option<PauseObservation>,
    pub infra: Option<PauseObservation>,
    /// Machines pause their infra object alongside the modern mirror; sets
    /// have no per-resource infra object.
    pub infra_required: bool,
}

impl Default for MigrationObservation {
    fn default() -> Self {
        Self {
            kind: "Machine",
            name: String::new(),
            desired: MachineAuthority::default(),
            observed: None,
            synchronized_api: None,
            synchronized_generation: None,
            synchronized_condition: false,
            legacy_generation: 0,
            modern_generation: None,
            legacy_paused: false,
            modern: None,
            infra: None,
            infra_required: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MigrationStep {
    Noop,
    /// One-shot bootstrap: adopt the desired authority as observed.
    Initialize,
    /// The user reverted the spec mid-flight; roll back to the current
    /// authority without ever entering the target one.
    Cancel,
    /// The source mirror is not caught up; syncing must finish first.
    WaitForSync,
    /// Flip `status.authoritativeAPI` to `Migrating`, freezing sync.
    Acknowledge,
    PauseOld,
    WaitForOldPause,
    UnpauseNew,
    WaitForNewUnpause,
    /// Adopt the new authority and force a resync from it.
    Commit,
}

pub(crate) fn next_step(
    view: &MigrationObservation,
) -> Result<MigrationStep, ControllerError> {
    if !matches!(
        view.desired,
        MachineAuthority::Legacy | MachineAuthority::Modern
    ) {
        return Err(ControllerError::UnknownEnumValue {
            field: "spec.authoritativeAPI",
        });
    }

    let Some(observed) = view.observed else {
        return Ok(MigrationStep::Initialize);
    };
    if observed == MachineAuthority::Unknown {
        return Err(ControllerError::UnknownEnumValue {
            field: "status.authoritativeAPI",
        });
    }
    if observed == view.desired {
        return Ok(MigrationStep::Noop);
    }

    let current = MachineAuthority::from_synchronized_api(view.synchronized_api);
    let is_migrating = observed == MachineAuthority::Migrating;

    if is_migrating && current.is_some_and(|current| current == view.desired) {
        return Ok(MigrationStep::Cancel);
    }

    if !source_synchronized(view)? {
        return Ok(MigrationStep::WaitForSync);
    }

    if !is_migrating {
        return Ok(MigrationStep::Acknowledge);
    }

    let Some(old) = current else {
        return Ok(MigrationStep::WaitForSync);
    };

    // Pause the authority being left behind.
    match old {
        MachineAuthority::Legacy => {
            // Implicit: the flipped spec already tells the legacy actuator to
            // stand down; only the acknowledgement is awaited.
            if !view.legacy_paused {
                return Ok(MigrationStep::WaitForOldPause);
            }
        }
        _ => {
            let modern = view.modern.ok_or_else(|| {
                ControllerError::invalid_state(
                    view.kind,
                    view.name.clone(),
                    "modern mirror missing while migrating away from it",
                )
            })?;
            if !modern.annotated {
                return Ok(MigrationStep::PauseOld);
            }
            if view.infra_required {
                match view.infra {
                    None => {
                        return Err(ControllerError::InfraResources(
                            "infrastructure machine missing while pausing".to_string(),
                        ));
                    }
                    Some(infra) if !infra.annotated => return Ok(MigrationStep::PauseOld),
                    Some(infra) if !infra.paused => return Ok(MigrationStep::WaitForOldPause),
                    Some(_) => {}
                }
            }
            if !modern.paused {
                return Ok(MigrationStep::WaitForOldPause);
            }
        }
    }

    // Unpause the authority being handed to.
    match view.desired {
        MachineAuthority::Modern => {
            let modern = view.modern.unwrap_or_default();
            let infra_annotated =
                view.infra_required && view.infra.is_some_and(|infra| infra.annotated);
            if modern.annotated || infra_annotated {
                return Ok(MigrationStep::UnpauseNew);
            }
            let infra_paused = view.infra_required && view.infra.is_some_and(|infra| infra.paused);
            if modern.paused || infra_paused {
                return Ok(MigrationStep::WaitForNewUnpause);
            }
        }
        _ => {
            // An absent condition counts as unpaused.
            if view.legacy_paused {
                return Ok(MigrationStep::WaitForNewUnpause);
            }
        }
    }

    Ok(MigrationStep::Commit)
}

fn source_synchronized(view: &MigrationObservation) -> Result<bool, ControllerError> {
    if !view.synchronized_condition {
        return Ok(false);
    }
    match view.synchronized_api {
        None => Ok(false),
        Some(MachineAuthority::Legacy) => {
            Ok(view.synchronized_generation == Some(view.legacy_generation))
        }
        Some(MachineAuthority::Modern) => Ok(view.modern_generation.is_some()
            && view.synchronized_generation == view.modern_generation),
        Some(_) => Err(ControllerError::UnknownEnumValue {
            field: "status.synchronizedAPI",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::MigrationStep::*;
    use super::*;

    fn synced_from_legacy() -> MigrationObservation {
        MigrationObservation {
            desired: MachineAuthority::Modern,
            observed: Some(MachineAuthority::Legacy),
            synchronized_api: Some(MachineAuthority::Legacy),
            synchronized_generation: Some(4),
            synchronized_condition: true,
            legacy_generation: 4,
            modern_generation: Some(9),
            infra_required: true,
            modern: Some(PauseObservation {
                annotated: true,
                paused: true,
            }),
            infra: Some(PauseObservation {
                annotated: true,
                paused: true,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn uninitialised_status_bootstraps() {
        let view = MigrationObservation {
            desired: MachineAuthority::Legacy,
            observed: None,
            ..Default::default()
        };
        assert_eq!(next_step(&view).unwrap(), Initialize);
    }

    #[test]
    fn settled_authority_is_a_noop() {
        let view = MigrationObservation {
            desired: MachineAuthority::Legacy,
            observed: Some(MachineAuthority::Legacy),
            ..Default::default()
        };
        assert_eq!(next_step(&view).unwrap(), Noop);
    }

    #[test]
    fn stale_source_blocks_the_acknowledgement() {
        // The gate must hold the state machine back while sync still runs:
        // acknowledging first would freeze sync and deadlock.
        let mut view = synced_from_legacy();
        view.synchronized_generation = Some(3);
        assert_eq!(next_step(&view).unwrap(), WaitForSync);

        view.synchronized_generation = Some(4);
        view.synchronized_condition = false;
        assert_eq!(next_step(&view).unwrap(), WaitForSync);
    }

    #[test]
    fn forward_migration_acknowledges_then_unpauses_then_commits() {
        // Freshly synced, not yet migrating.
        let mut view = synced_from_legacy();
        assert_eq!(next_step(&view).unwrap(), Acknowledge);

        // Acknowledged; the old (legacy) side must report paused.
        view.observed = Some(MachineAuthority::Migrating);
        assert_eq!(next_step(&view).unwrap(), WaitForOldPause);

        // Legacy paused; the new (modern) side still carries the annotation.
        view.legacy_paused = true;
        assert_eq!(next_step(&view).unwrap(), UnpauseNew);

        // Annotation removed, condition not yet flipped back.
        view.modern = Some(PauseObservation {
            annotated: false,
            paused: true,
        });
        view.infra = Some(PauseObservation {
            annotated: false,
            paused: true,
        });
        assert_eq!(next_step(&view).unwrap(), WaitForNewUnpause);

        // Fully unpaused: hand over.
        view.modern = Some(PauseObservation::default());
        view.infra = Some(PauseObservation::default());
        assert_eq!(next_step(&view).unwrap(), Commit);
    }

    #[test]
    fn reverse_migration_pauses_modern_and_its_infra_machine() {
        let mut view = MigrationObservation {
            desired: MachineAuthority::Legacy,
            observed: Some(MachineAuthority::Migrating),
            synchronized_api: Some(MachineAuthority::Modern),
            synchronized_generation: Some(9),
            synchronized_condition: true,
            legacy_generation: 4,
            modern_generation: Some(9),
            infra_required: true,
            modern: Some(PauseObservation::default()),
            infra: Some(PauseObservation::default()),
            ..Default::default()
        };
        assert_eq!(next_step(&view).unwrap(), PauseOld);

        // Annotated but not yet acknowledged.
        view.modern = Some(PauseObservation {
            annotated: true,
            paused: false,
        });
        view.infra = Some(PauseObservation {
            annotated: true,
            paused: false,
        });
        assert_eq!(next_step(&view).unwrap(), WaitForOldPause);

        // Both sides acknowledged; legacy is unpaused; commit.
        view.modern = Some(PauseObservation {
            annotated: true,
            paused: true,
        });
        view.infra = Some(PauseObservation {
            annotated: true,
            paused: true,
        });
        assert_eq!(next_step(&view).unwrap(), Commit);
    }

    #[test]
    fn missing_infra_machine_fails_the_main_flow() {
        let mut view = MigrationObservation {
            desired: MachineAuthority::Legacy,
            observed: Some(MachineAuthority::Migrating),
            synchronized_api: Some(MachineAuthority::Modern),
            synchronized_generation: Some(9),
            synchronized_condition: true,
            modern_generation: Some(9),
            infra_required: true,
            modern: Some(PauseObservation {
                annotated: true,
                paused: true,
            }),
            infra: None,
            ..Default::default()
        };
        assert!(matches!(
            next_step(&view),
            Err(ControllerError::InfraResources(_))
        ));

        // Sets have no infra object; the same observation passes for them.
        view.infra_required = false;
        view.legacy_paused = false;
        assert_eq!(next_step(&view).unwrap(), Commit);
    }

    #[test]
    fn mid_flight_revert_cancels_without_entering_the_target() {
        // Previously migrating Legacy -> Modern; user reset the spec.
        let mut view = synced_from_legacy();
        view.observed = Some(MachineAuthority::Migrating);
        view.desired = MachineAuthority::Legacy;
        // Even with everything else mid-hand-off, cancellation wins.
        view.legacy_paused = true;
        assert_eq!(next_step(&view).unwrap(), Cancel);
    }

    #[test]
    fn revert_before_acknowledgement_is_a_plain_noop() {
        let mut view = synced_from_legacy();
        view.desired = MachineAuthority::Legacy;
        assert_eq!(next_step(&view).unwrap(), Noop);
    }

    #[test]
    fn unrecognised_synchronized_api_is_fatal() {
        let mut view = synced_from_legacy();
        view.synchronized_api = Some(MachineAuthority::Unknown);
        assert!(matches!(
            next_step(&view),
            Err(ControllerError::UnknownEnumValue {
                field: "status.synchronizedAPI"
            })
        ));
    }

    #[test]
    fn unrecognised_observed_authority_is_fatal() {
        let mut view = synced_from_legacy();
        view.observed = Some(MachineAuthority::Unknown);
        assert!(next_step(&view).is_err());
    }
}
