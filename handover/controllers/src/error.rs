use handover_convert::ConvertError;
use thiserror::Error;

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// Transient store errors: retried by the queue, no status change.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("failed to convert legacy resource to modern: {0}")]
    ConvertLegacyToModern(#[source] ConvertError),

    #[error("failed to convert modern resource to legacy: {0}")]
    ConvertModernToLegacy(#[source] ConvertError),

    /// A required collaborator (cluster object, template, infra machine) is
    /// missing or malformed.
    #[error("failed to get infra resources: {0}")]
    InfraResources(String),

    /// An enumerated status field holds a value this controller does not
    /// recognise. Never auto-corrected.
    #[error("unrecognised value in {field}")]
    UnknownEnumValue { field: &'static str },

    #[error("{kind} {name} is in an unexpected state: {reason}")]
    InvalidState {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// Carries the original failure when the condition write that should
    /// have reported it failed too, so neither error is masked.
    #[error("{primary}; additionally failed to record the Synchronized condition: {secondary}")]
    ConditionWriteFailed {
        #[source]
        primary: Box<ControllerError>,
        secondary: kube::Error,
    },
}

impl ControllerError {
    pub fn invalid_state(
        kind: &'static str,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ControllerError::InvalidState {
            kind,
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Folds the outcome of a condition write into `self`.
    pub fn aggregate(self, condition_write: Result<(), kube::Error>) -> Self {
        match condition_write {
            Ok(()) => self,
            Err(secondary) => ControllerError::ConditionWriteFailed {
                primary: Box::new(self),
                secondary,
            },
        }
    }
}
