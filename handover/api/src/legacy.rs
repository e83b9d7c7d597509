//! Resource definitions for the legacy machine API (namespace `L`).
//!
//! Legacy resources are the user-facing end of a mirrored pair: migrations
//! are requested by flipping `spec.authoritativeAPI`, and the engines report
//! progress through the status fields and conditions defined here.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::authority::MachineAuthority;

/// Opaque, platform-specific machine configuration.
///
/// The payload is not interpreted by the engines beyond being carried across
/// the mirror; platform converters deserialise it.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
pub struct ProviderSpec {
    pub value: Option<serde_json::Value>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "legacy.machine.dev",
    version = "v1beta1",
    kind = "Machine",
    root = "LegacyMachine",
    status = "LegacyMachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMachineSpec {
    /// The API the user wants to be authoritative for this machine.
    /// Flipping this field requests a migration.
    #[serde(default, rename = "authoritativeAPI")]
    pub authoritative_api: MachineAuthority,

    /// Platform-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_spec: Option<ProviderSpec>,

    /// Provider-assigned identifier of the backing compute instance.
    #[serde(skip_serializing_if = "Option::is_none", rename = "providerID")]
    pub provider_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMachineStatus {
    /// The API currently observed to be authoritative. `Migrating` while a
    /// hand-off is in flight; absent until the migration engine initialises.
    #[serde(skip_serializing_if = "Option::is_none", rename = "authoritativeAPI")]
    pub authoritative_api: Option<MachineAuthority>,

    /// Which side was the source of the last successful sync.
    #[serde(skip_serializing_if = "Option::is_none", rename = "synchronizedAPI")]
    pub synchronized_api: Option<MachineAuthority>,

    /// Generation of the source at the time of the last successful sync.
    /// Reset to zero when authority changes, forcing a full resync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronized_generation: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// Object-meta subset carried by a machine template.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
pub struct MachineTemplateMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMachineTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MachineTemplateMeta>,
    pub spec: LegacyMachineSpec,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "legacy.machine.dev",
    version = "v1beta1",
    kind = "MachineSet",
    root = "LegacyMachineSet",
    status = "LegacyMachineSetStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMachineSetSpec {
    /// The API the user wants to be authoritative for this machine-set.
    #[serde(default, rename = "authoritativeAPI")]
    pub authoritative_api: MachineAuthority,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Label selector for machines belonging to this set. Immutable.
    pub selector: LabelSelector,

    pub template: LegacyMachineTemplate,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMachineSetStatus {
    #[serde(skip_serializing_if = "Option::is_none", rename = "authoritativeAPI")]
    pub authoritative_api: Option<MachineAuthority>,

    #[serde(skip_serializing_if = "Option::is_none", rename = "synchronizedAPI")]
    pub synchronized_api: Option<MachineAuthority>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronized_generation: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_round_trips_through_json() {
        let raw = r#"{
            "apiVersion": "legacy.machine.dev/v1beta1",
            "kind": "Machine",
            "metadata": {
                "name": "worker-a-7xk2p",
                "namespace": "machine-api",
                "generation": 4
            },
            "spec": {
                "authoritativeAPI": "Legacy",
                "providerSpec": {
                    "value": {
                        "instanceType": "m5.large",
                        "placement": {"region": "us-east-1"}
                    }
                }
            },
            "status": {
                "authoritativeAPI": "Legacy",
                "synchronizedAPI": "Legacy",
                "synchronizedGeneration": 4
            }
        }"#;

        let machine: LegacyMachine = serde_json::from_str(raw).unwrap();
        assert_eq!(
            machine.spec.authoritative_api,
            MachineAuthority::Legacy,
        );
        let status = machine.status.as_ref().unwrap();
        assert_eq!(status.synchronized_generation, Some(4));

        let value = serde_json::to_value(&machine).unwrap();
        assert_eq!(value["spec"]["providerSpec"]["value"]["instanceType"], "m5.large");
    }

    #[test]
    fn absent_status_fields_stay_absent() {
        let status = LegacyMachineStatus::default();
        let value = serde_json::to_value(status).unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn machine_set_parses_from_a_manifest() {
        let manifest = r#"
apiVersion: legacy.machine.dev/v1beta1
kind: MachineSet
metadata:
  name: worker-a
  namespace: machine-api
spec:
  authoritativeAPI: Modern
  replicas: 3
  selector:
    matchLabels:
      set: worker-a
  template:
    metadata:
      labels:
        set: worker-a
    spec:
      authoritativeAPI: Modern
      providerSpec:
        value:
          instanceType: m5.large
"#;
        let set: LegacyMachineSet = serde_yaml::from_str(manifest).unwrap();
        assert_eq!(set.spec.authoritative_api, MachineAuthority::Modern);
        assert_eq!(set.spec.replicas, Some(3));
        assert_eq!(
            set.spec.template.spec.authoritative_api,
            MachineAuthority::Modern
        );
    }

    #[test]
    fn machine_set_defaults_authority_to_legacy() {
        let raw = r#"{
            "selector": {"matchLabels": {"set": "worker-a"}},
            "template": {"spec": {}}
        }"#;
        let spec: LegacyMachineSetSpec = serde_json::from_str(raw).unwrap();
        assert_eq!(spec.authoritative_api, MachineAuthority::Legacy);
        assert_eq!(spec.template.spec.authoritative_api, MachineAuthority::Legacy);
    }
}
