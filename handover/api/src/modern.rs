//! Resource definitions for the modern, cluster-level machine API
//! (namespace `M`).
//!
//! Modern resources carry no authority fields of their own. Their actuator is
//! quiesced through the paused annotation and acknowledges with a `Paused`
//! condition. Every modern mirror is owned by the per-cluster `Cluster`
//! object and references its platform counterpart through
//! `infrastructureRef`.

use k8s_openapi::{
    api::core::v1::ObjectReference,
    apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector},
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::legacy::MachineTemplateMeta;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.machine.dev",
    version = "v1beta1",
    kind = "Machine",
    root = "ModernMachine",
    status = "ModernMachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ModernMachineSpec {
    /// Name of the `Cluster` this machine belongs to.
    pub cluster_name: String,

    /// Reference to the platform-specific infrastructure machine that holds
    /// the provider configuration for this machine.
    pub infrastructure_ref: ObjectReference,

    #[serde(skip_serializing_if = "Option::is_none", rename = "providerID")]
    pub provider_id: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModernMachineStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModernMachineTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MachineTemplateMeta>,
    pub spec: ModernMachineSpec,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.machine.dev",
    version = "v1beta1",
    kind = "MachineSet",
    root = "ModernMachineSet",
    status = "ModernMachineSetStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ModernMachineSetSpec {
    /// Name of the `Cluster` this machine-set belongs to.
    pub cluster_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    pub selector: LabelSelector,

    /// Template for machines created by this set. Its
    /// `spec.infrastructureRef` points at the platform infrastructure
    /// template that accompanies the set.
    pub template: ModernMachineTemplate,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModernMachineSetStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// The per-cluster singleton referenced as owner by all modern mirrors.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cluster.machine.dev",
    version = "v1beta1",
    kind = "Cluster",
    root = "ModernCluster",
    status = "ModernClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ModernClusterSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModernClusterStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_set_round_trips_infrastructure_ref() {
        let raw = r#"{
            "clusterName": "prod",
            "replicas": 3,
            "selector": {"matchLabels": {"set": "worker-a"}},
            "template": {
                "spec": {
                    "clusterName": "prod",
                    "infrastructureRef": {
                        "apiVersion": "infrastructure.machine.dev/v1beta1",
                        "kind": "AWSMachineTemplate",
                        "name": "worker-a"
                    }
                }
            }
        }"#;

        let spec: ModernMachineSetSpec = serde_json::from_str(raw).unwrap();
        let infra_ref = &spec.template.spec.infrastructure_ref;
        assert_eq!(infra_ref.kind.as_deref(), Some("AWSMachineTemplate"));

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["template"]["spec"]["infrastructureRef"]["name"], "worker-a");
    }
}
