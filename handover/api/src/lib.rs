//! Typed resources for the paired machine APIs.
//!
//! Two parallel declarative APIs describe the same compute resources:
//! the legacy machine API (`legacy.machine.dev`) and the modern,
//! cluster-level machine API (`cluster.machine.dev`). Every logical machine
//! and machine-set exists as a mirrored pair, one resource per API, in
//! different namespaces. This crate holds the resource definitions, the
//! authority enumeration shared by both engines, and condition plumbing.

pub mod authority;
pub mod conditions;
pub mod config;
pub mod legacy;
pub mod modern;

pub use authority::MachineAuthority;

/// API group of the legacy machine API.
pub const LEGACY_GROUP: &str = "legacy.machine.dev";
/// API group of the modern cluster-level machine API.
pub const MODERN_GROUP: &str = "cluster.machine.dev";
/// API group of the platform infrastructure kinds (templates and machines).
pub const INFRA_GROUP: &str = "infrastructure.machine.dev";
/// Version shared by the machine API groups.
pub const MACHINE_API_VERSION: &str = "v1beta1";

/// Annotation that asks the modern actuator to take no action on a resource.
/// The actuator acknowledges by setting a `Paused=True` condition.
pub const PAUSED_ANNOTATION: &str = "cluster.machine.dev/paused";

/// Finalizer owned by the sync engine, present on both mirrors while the
/// pair is live to guarantee ordered teardown.
pub const SYNC_FINALIZER: &str = "handover.machine.dev/sync";

/// Finalizer the modern machine actuator places on machines it manages.
/// The sync engine removes it when the actuator is paused and cannot.
pub const MODERN_MACHINE_FINALIZER: &str = "machine.cluster.machine.dev";
/// Finalizer the modern machine-set actuator places on sets it manages.
pub const MODERN_MACHINE_SET_FINALIZER: &str = "machineset.cluster.machine.dev";

/// Condition type asserting that the mirror reflects the authoritative side.
pub const SYNCHRONIZED_CONDITION: &str = "Synchronized";
/// Condition type set by an actuator that has quiesced.
pub const PAUSED_CONDITION: &str = "Paused";

/// Whether `meta` carries the paused annotation, i.e. whether the modern
/// actuator has been *asked* to quiesce. Acknowledgement is observed through
/// the `Paused` condition instead.
pub fn has_paused_annotation(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> bool {
    meta.annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(PAUSED_ANNOTATION))
}

/// Reasons carried by the `Synchronized` condition.
pub mod reasons {
    pub const RESOURCE_SYNCHRONIZED: &str = "ResourceSynchronized";
    pub const FAILED_TO_CONVERT_LEGACY_TO_MODERN: &str = "FailedToConvertLegacyToModern";
    pub const FAILED_TO_CONVERT_MODERN_TO_LEGACY: &str = "FailedToConvertModernToLegacy";
    pub const FAILED_TO_GET_INFRA_RESOURCES: &str = "FailedToGetInfraResources";
    pub const AUTHORITATIVE_API_CHANGED: &str = "AuthoritativeAPIChanged";
}
