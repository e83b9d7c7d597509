//! The migration-direction predicate shared by both sync engines.

use handover_api::MachineAuthority;

use crate::error::ControllerError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncDirection {
    LegacyToModern,
    ModernToLegacy,
    /// Authority hand-off in flight: sync does nothing until the migration
    /// engine commits or rolls back.
    Frozen,
    /// Nothing to do yet (authority not initialised).
    Idle,
}

/// Chooses the sync direction from the observed authority on the legacy
/// mirror and the presence of the modern one.
///
/// `Modern` authority with an absent modern mirror still syncs
/// legacy-to-modern: that is the initial materialisation of the pair.
pub fn sync_direction(
    observed_authority: Option<MachineAuthority>,
    modern_present: bool,
) -> Result<SyncDirection, ControllerError> {
    match observed_authority {
        Some(MachineAuthority::Legacy) => Ok(SyncDirection::LegacyToModern),
        Some(MachineAuthority::Modern) if modern_present => Ok(SyncDirection::ModernToLegacy),
        Some(MachineAuthority::Modern) => Ok(SyncDirection::LegacyToModern),
        Some(MachineAuthority::Migrating) => Ok(SyncDirection::Frozen),
        None => Ok(SyncDirection::Idle),
        Some(MachineAuthority::Unknown) => Err(ControllerError::UnknownEnumValue {
            field: "status.authoritativeAPI",
        }),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(Some(MachineAuthority::Legacy), false, SyncDirection::LegacyToModern)]
    #[case(Some(MachineAuthority::Legacy), true, SyncDirection::LegacyToModern)]
    #[case(Some(MachineAuthority::Modern), false, SyncDirection::LegacyToModern)]
    #[case(Some(MachineAuthority::Modern), true, SyncDirection::ModernToLegacy)]
    #[case(Some(MachineAuthority::Migrating), true, SyncDirection::Frozen)]
    #[case(Some(MachineAuthority::Migrating), false, SyncDirection::Frozen)]
    #[case(None, true, SyncDirection::Idle)]
    #[case(None, false, SyncDirection::Idle)]
    fn truth_table(
        #[case] observed: Option<MachineAuthority>,
        #[case] modern_present: bool,
        #[case] expected: SyncDirection,
    ) {
        assert_eq!(sync_direction(observed, modern_present).unwrap(), expected);
    }

    #[test]
    fn unrecognised_authority_is_a_protocol_error() {
        let err = sync_direction(Some(MachineAuthority::Unknown), true).unwrap_err();
        assert!(matches!(err, ControllerError::UnknownEnumValue { .. }));
    }
}
