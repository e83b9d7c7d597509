//! Cluster configuration singletons consumed at startup.
//!
//! `FeatureGate` and `Infrastructure` belong to a foreign API that this
//! process only reads, so they are implemented by hand rather than derived:
//! the manual [`Resource`]/[`Metadata`] impls keep us off the hook for
//! schema generation on types we do not own.

use k8s_openapi::{
    apimachinery::pkg::apis::meta::v1::ObjectMeta, ClusterResourceScope, ListableResource,
    Metadata, Resource,
};
use serde::{Deserialize, Serialize};

/// Feature the whole migration machinery sits behind. Disabled means the
/// process idles until signalled.
pub const MIGRATION_FEATURE: &str = "MachineAuthorityMigration";
/// Secondary gate required in addition to [`MIGRATION_FEATURE`] on VSphere.
pub const VSPHERE_MIGRATION_FEATURE: &str = "MachineAuthorityMigrationVSphere";

/// Well-known name of both configuration singletons.
pub const CLUSTER_SINGLETON: &str = "cluster";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FeatureGate {
    pub metadata: ObjectMeta,
    pub spec: Option<FeatureGateSpec>,
    pub status: Option<FeatureGateStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGateSpec {
    pub feature_set: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGateStatus {
    pub enabled: Option<Vec<String>>,
    pub disabled: Option<Vec<String>>,
}

impl FeatureGate {
    /// Whether the gate object has resolved its feature set yet. An empty
    /// status means the gate controller has not run; callers wait for it.
    pub fn initialized(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| status.enabled.is_some() || status.disabled.is_some())
    }

    pub fn enabled(&self, feature: &str) -> bool {
        self.status
            .as_ref()
            .and_then(|status| status.enabled.as_ref())
            .is_some_and(|enabled| enabled.iter().any(|name| name == feature))
    }
}

impl Resource for FeatureGate {
    const API_VERSION: &'static str = "config.machine.dev/v1";
    const GROUP: &'static str = "config.machine.dev";
    const KIND: &'static str = "FeatureGate";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "featuregates";
    type Scope = ClusterResourceScope;
}

impl ListableResource for FeatureGate {
    const LIST_KIND: &'static str = "FeatureGateList";
}

impl Metadata for FeatureGate {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Infrastructure {
    pub metadata: ObjectMeta,
    pub spec: Option<InfrastructureSpec>,
    pub status: Option<InfrastructureStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    pub platform: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    /// Identifier of this cluster, shared with the modern `Cluster` object's
    /// name.
    pub infrastructure_name: Option<String>,
    pub platform: Option<String>,
}

impl Infrastructure {
    /// Platform identifier, preferring the observed one over the declared
    /// one.
    pub fn platform(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.platform.as_deref())
            .or_else(|| self.spec.as_ref().and_then(|spec| spec.platform.as_deref()))
    }

    pub fn infrastructure_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.infrastructure_name.as_deref())
    }
}

impl Resource for Infrastructure {
    const API_VERSION: &'static str = "config.machine.dev/v1";
    const GROUP: &'static str = "config.machine.dev";
    const KIND: &'static str = "Infrastructure";
    const VERSION: &'static str = "v1";
    const URL_PATH_SEGMENT: &'static str = "infrastructures";
    type Scope = ClusterResourceScope;
}

impl ListableResource for Infrastructure {
    const LIST_KIND: &'static str = "InfrastructureList";
}

impl Metadata for Infrastructure {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}

#[cfg(test)]
pub mod test {
    #[test]
    fn test_feature_gate() {
        let raw_json = r#"{
  "apiVersion": "config.machine.dev/v1",
  "kind": "FeatureGate",
  "metadata": {
    "name": "cluster",
    "generation": 2,
    "resourceVersion": "88211",
    "uid": "4f1a3b7e-03a1-43a2-9d95-b867fbb0de20"
  },
  "spec": {
    "featureSet": "TechPreview"
  },
  "status": {
    "enabled": [
      "MachineAuthorityMigration",
      "GatewayAPI"
    ],
    "disabled": [
      "MachineAuthorityMigrationVSphere"
    ]
  }
}"#;

        let gate: super::FeatureGate = serde_json::from_str(raw_json).unwrap();
        assert!(gate.initialized());
        assert!(gate.enabled(super::MIGRATION_FEATURE));
        assert!(!gate.enabled(super::VSPHERE_MIGRATION_FEATURE));
    }

    #[test]
    fn test_uninitialized_feature_gate() {
        let raw_json = r#"{
  "apiVersion": "config.machine.dev/v1",
  "kind": "FeatureGate",
  "metadata": {"name": "cluster"},
  "spec": {"featureSet": "Default"}
}"#;

        let gate: super::FeatureGate = serde_json::from_str(raw_json).unwrap();
        assert!(!gate.initialized());
        assert!(!gate.enabled(super::MIGRATION_FEATURE));
    }

    #[test]
    fn test_infrastructure() {
        let raw_json = r#"{
  "apiVersion": "config.machine.dev/v1",
  "kind": "Infrastructure",
  "metadata": {
    "name": "cluster",
    "resourceVersion": "1022"
  },
  "spec": {
    "platform": "AWS"
  },
  "status": {
    "infrastructureName": "prod-4h7xl",
    "platform": "AWS"
  }
}"#;

        let infra: super::Infrastructure = serde_json::from_str(raw_json).unwrap();
        assert_eq!(infra.platform(), Some("AWS"));
        assert_eq!(infra.infrastructure_name(), Some("prod-4h7xl"));
    }
}
