//! Schema translation between the paired machine APIs.
//!
//! Conversion is polymorphic over a small closed set of platforms, dispatched
//! through a capability table selected once at startup (see [`platform`]).
//! All conversion functions are pure: they read one mirror and produce the
//! other, together with non-fatal warnings that the caller surfaces as
//! events. Identity fields, authority fields, and anything else that must be
//! merged from the existing target object are the caller's business.

use thiserror::Error;

pub mod machine;
pub mod machine_set;
pub mod platform;

mod ownership;

pub use platform::{Converter, Platform};

/// Non-fatal translation ambiguities, surfaced as events on the legacy
/// mirror.
pub type Warnings = Vec<String>;

#[derive(Debug, Error)]
pub enum ConvertError {
    /// The legacy mirror must not carry owner references. Cannot resolve
    /// without user action, so it is never retried.
    #[error("legacy mirror must not carry owner references, found {0}")]
    LegacyOwnerReferences(usize),

    /// The modern mirror's sole permitted owner reference must point at the
    /// cluster object. Cannot resolve without user action.
    #[error("modern mirror owner reference must point at the cluster, found {kind}/{name}")]
    ForeignOwnerReference { kind: String, name: String },

    /// Same rule, violated by count rather than target.
    #[error("modern mirror must carry at most one owner reference, found {0}")]
    TooManyOwnerReferences(usize),

    #[error("missing provider configuration in .spec.providerSpec.value")]
    MissingProviderSpec,

    #[error("infrastructure object has no provider payload under .spec")]
    MalformedInfraObject,

    #[error("unexpected infrastructure kind {found:?}, expected {expected}")]
    UnexpectedInfraKind { expected: &'static str, found: Option<String> },
}

impl ConvertError {
    /// Terminal errors cannot resolve without user action; the sync engine
    /// reports them once per trigger and does not retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConvertError::LegacyOwnerReferences(_)
                | ConvertError::ForeignOwnerReference { .. }
                | ConvertError::TooManyOwnerReferences(_)
        )
    }
}
