use std::fmt::{Display, Formatter};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Which API is permitted to act on the underlying compute resource.
///
/// `spec.authoritativeAPI` on a legacy resource holds the *desired* authority
/// (`Legacy` or `Modern`); `status.authoritativeAPI` holds the *observed* one
/// and may additionally be `Migrating` while a hand-off is in flight, or
/// absent before the migration engine has initialised it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize, JsonSchema)]
pub enum MachineAuthority {
    #[default]
    Legacy,
    Modern,
    Migrating,
    /// What this controller sees when the stored value was written by a newer
    /// version of the API. Never written back.
    #[schemars(skip)]
    #[serde(other, skip_serializing)]
    Unknown,
}

impl Display for MachineAuthority {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MachineAuthority::Legacy => "Legacy",
            MachineAuthority::Modern => "Modern",
            MachineAuthority::Migrating => "Migrating",
            MachineAuthority::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

impl MachineAuthority {
    /// Maps a `status.synchronizedAPI` value onto the authority it implies.
    ///
    /// `synchronizedAPI` only ever holds `Legacy` or `Modern`; anything else
    /// has no authority mapping.
    pub fn from_synchronized_api(value: Option<MachineAuthority>) -> Option<MachineAuthority> {
        match value {
            Some(MachineAuthority::Legacy) => Some(MachineAuthority::Legacy),
            Some(MachineAuthority::Modern) => Some(MachineAuthority::Modern),
            _ => None,
        }
    }
}
