//! Machine conversion.
//!
//! A legacy machine translates into a modern machine plus the platform
//! infrastructure machine that carries its provider configuration; the
//! reverse direction consumes both. The caller merges identity fields and
//! authority fields into the result before writing.

use std::collections::BTreeMap;

use handover_api::{
    legacy::{LegacyMachine, LegacyMachineSpec, ProviderSpec},
    modern::{ModernCluster, ModernMachine, ModernMachineSpec},
    INFRA_GROUP, MACHINE_API_VERSION, PAUSED_ANNOTATION,
};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{core::DynamicObject, ResourceExt};

use crate::{ownership, platform::Converter, ConvertError, Warnings};

impl Converter {
    /// Translates a legacy machine into its modern mirror and the
    /// infrastructure machine holding the provider payload.
    pub fn legacy_machine_to_modern(
        &self,
        legacy: &LegacyMachine,
        cluster: &ModernCluster,
    ) -> Result<(ModernMachine, DynamicObject, Warnings), ConvertError> {
        ownership::check_legacy(&legacy.metadata)?;

        let provider_value = legacy
            .spec
            .provider_spec
            .as_ref()
            .and_then(|provider_spec| provider_spec.value.as_ref())
            .ok_or(ConvertError::MissingProviderSpec)?;

        let mut warnings = Warnings::new();
        if let Some(warning) = self.provider_api_version_warning(provider_value) {
            warnings.push(warning);
        }

        let name = legacy.name_any();
        let caps = self.capabilities();

        let mut infra_machine = DynamicObject::new(&name, &self.infra_machine_resource());
        infra_machine.metadata.labels = legacy.metadata.labels.clone();
        infra_machine.data = serde_json::json!({ "spec": provider_value.clone() });

        let mut modern = ModernMachine::new(
            &name,
            ModernMachineSpec {
                cluster_name: cluster.name_any(),
                infrastructure_ref: ObjectReference {
                    api_version: Some(format!("{INFRA_GROUP}/{MACHINE_API_VERSION}")),
                    kind: Some(caps.infra_machine_kind.to_string()),
                    name: Some(name.clone()),
                    ..Default::default()
                },
                provider_id: legacy.spec.provider_id.clone(),
            },
        );
        modern.metadata.labels = legacy.metadata.labels.clone();
        modern.metadata.annotations = scrub_annotations(legacy.metadata.annotations.clone());

        Ok((modern, infra_machine, warnings))
    }

    /// Translates a modern machine (and its infrastructure machine, when it
    /// exists) back into the legacy schema. Authority fields and the
    /// provider spec fallback are restored by the writer from the existing
    /// legacy object.
    pub fn modern_machine_to_legacy(
        &self,
        modern: &ModernMachine,
        infra_machine: Option<&DynamicObject>,
        cluster: &ModernCluster,
    ) -> Result<(LegacyMachine, Warnings), ConvertError> {
        ownership::check_modern(&modern.metadata, cluster)?;

        let mut warnings = Warnings::new();
        let provider_spec = match infra_machine {
            Some(infra) => Some(ProviderSpec {
                value: Some(self.provider_payload(infra)?),
            }),
            None => {
                warnings.push(format!(
                    "infrastructure machine {} not found; provider configuration preserved from the existing mirror",
                    modern.name_any(),
                ));
                None
            }
        };

        let mut legacy = LegacyMachine::new(
            &modern.name_any(),
            LegacyMachineSpec {
                provider_spec,
                provider_id: modern.spec.provider_id.clone(),
                ..Default::default()
            },
        );
        legacy.metadata.labels = modern.metadata.labels.clone();
        legacy.metadata.annotations = scrub_annotations(modern.metadata.annotations.clone());

        Ok((legacy, warnings))
    }

    /// Extracts the provider payload out of an infrastructure object,
    /// checking the kind against this converter's platform.
    pub fn provider_payload(&self, infra: &DynamicObject) -> Result<serde_json::Value, ConvertError> {
        let expected = self.capabilities().infra_machine_kind;
        let found = infra.types.as_ref().map(|types| types.kind.clone());
        if found.as_deref() != Some(expected) {
            return Err(ConvertError::UnexpectedInfraKind { expected, found });
        }
        infra
            .data
            .get("spec")
            .cloned()
            .ok_or(ConvertError::MalformedInfraObject)
    }

    pub(crate) fn provider_api_version_warning(
        &self,
        provider_value: &serde_json::Value,
    ) -> Option<String> {
        let expected = self.capabilities().provider_spec_api_version;
        match provider_value.get("apiVersion").and_then(|v| v.as_str()) {
            Some(api_version) if api_version == expected => None,
            Some(api_version) => Some(format!(
                "provider spec declares apiVersion {api_version}, expected {expected}",
            )),
            None => None,
        }
    }
}

/// Drops control-plane annotations that must not travel across the mirror.
pub(crate) fn scrub_annotations(
    annotations: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut annotations = annotations?;
    annotations.remove(PAUSED_ANNOTATION);
    (!annotations.is_empty()).then_some(annotations)
}
