//! Machine-set conversion.
//!
//! A legacy machine-set translates into a modern machine-set plus the
//! infrastructure template its machines are stamped from. The template is
//! referenced, not owned, by the set (`spec.template.spec.infrastructureRef`).

use std::collections::BTreeMap;

use handover_api::{
    legacy::{LegacyMachineSet, LegacyMachineSetSpec, LegacyMachineSpec, LegacyMachineTemplate,
        MachineTemplateMeta, ProviderSpec},
    modern::{ModernCluster, ModernMachineSet, ModernMachineSetSpec, ModernMachineSpec,
        ModernMachineTemplate},
    INFRA_GROUP, MACHINE_API_VERSION,
};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{core::DynamicObject, ResourceExt};

use crate::{machine::scrub_annotations, ownership, platform::Converter, ConvertError, Warnings};

impl Converter {
    /// Translates a legacy machine-set into its modern mirror and the
    /// infrastructure template that accompanies it.
    pub fn legacy_machine_set_to_modern(
        &self,
        legacy: &LegacyMachineSet,
        cluster: &ModernCluster,
    ) -> Result<(ModernMachineSet, DynamicObject, Warnings), ConvertError> {
        ownership::check_legacy(&legacy.metadata)?;

        let provider_value = legacy
            .spec
            .template
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

        let mut template = DynamicObject::new(&name, &self.template_resource());
        template.metadata.labels = legacy.metadata.labels.clone();
        template.data = serde_json::json!({
            "spec": { "template": { "spec": provider_value.clone() } }
        });

        let mut modern = ModernMachineSet::new(
            &name,
            ModernMachineSetSpec {
                cluster_name: cluster.name_any(),
                replicas: legacy.spec.replicas,
                selector: legacy.spec.selector.clone(),
                template: ModernMachineTemplate {
                    metadata: legacy.spec.template.metadata.clone(),
                    spec: ModernMachineSpec {
                        cluster_name: cluster.name_any(),
                        infrastructure_ref: ObjectReference {
                            api_version: Some(format!("{INFRA_GROUP}/{MACHINE_API_VERSION}")),
                            kind: Some(caps.template_kind.to_string()),
                            name: Some(name.clone()),
                            ..Default::default()
                        },
                        provider_id: legacy.spec.template.spec.provider_id.clone(),
                    },
                },
            },
        );
        modern.metadata.labels = legacy.metadata.labels.clone();
        modern.metadata.annotations = scrub_annotations(legacy.metadata.annotations.clone());

        Ok((modern, template, warnings))
    }

    /// Translates a modern machine-set and its infrastructure template back
    /// into the legacy schema. The immutable selector and the authority
    /// fields are restored by the writer from the existing legacy object.
    pub fn modern_machine_set_to_legacy(
        &self,
        modern: &ModernMachineSet,
        template: &DynamicObject,
        cluster: &ModernCluster,
    ) -> Result<(LegacyMachineSet, Warnings), ConvertError> {
        ownership::check_modern(&modern.metadata, cluster)?;

        let mut warnings = Warnings::new();
        let provider_value = self.template_payload(template)?;

        // Template labels must keep covering the selector, whoever edited the
        // modern side last. Merge is additive; selector labels win nothing.
        let mut template_labels = modern
            .spec
            .template
            .metadata
            .as_ref()
            .and_then(|meta| meta.labels.clone())
            .unwrap_or_default();
        if let Some(match_labels) = modern.spec.selector.match_labels.as_ref() {
            for (key, value) in match_labels {
                if !template_labels.contains_key(key) {
                    warnings.push(format!(
                        "template was missing selector label {key}; restored additively",
                    ));
                    template_labels.insert(key.clone(), value.clone());
                }
            }
        }

        let mut legacy = LegacyMachineSet::new(
            &modern.name_any(),
            LegacyMachineSetSpec {
                replicas: modern.spec.replicas,
                selector: modern.spec.selector.clone(),
                template: LegacyMachineTemplate {
                    metadata: Some(MachineTemplateMeta {
                        labels: non_empty(template_labels),
                        annotations: modern
                            .spec
                            .template
                            .metadata
                            .as_ref()
                            .and_then(|meta| meta.annotations.clone()),
                    }),
                    spec: LegacyMachineSpec {
                        provider_spec: Some(ProviderSpec {
                            value: Some(provider_value),
                        }),
                        provider_id: modern.spec.template.spec.provider_id.clone(),
                        ..Default::default()
                    },
                },
                ..Default::default()
            },
        );
        legacy.metadata.labels = modern.metadata.labels.clone();
        legacy.metadata.annotations = scrub_annotations(modern.metadata.annotations.clone());

        Ok((legacy, warnings))
    }

    /// Extracts the provider payload out of an infrastructure template,
    /// checking the kind against this converter's platform.
    pub fn template_payload(&self, template: &DynamicObject) -> Result<serde_json::Value, ConvertError> {
        let expected = self.capabilities().template_kind;
        let found = template.types.as_ref().map(|types| types.kind.clone());
        if found.as_deref() != Some(expected) {
            return Err(ConvertError::UnexpectedInfraKind { expected, found });
        }
        template
            .data
            .pointer("/spec/template/spec")
            .cloned()
            .ok_or(ConvertError::MalformedInfraObject)
    }
}

fn non_empty(labels: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    (!labels.is_empty()).then_some(labels)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};

    use super::*;
    use crate::Platform;

    fn converter() -> Converter {
        Converter::new(Platform::Aws)
    }

    fn cluster() -> ModernCluster {
        let mut cluster = ModernCluster::new("prod-4h7xl", Default::default());
        cluster.metadata.uid = Some("c9b2".to_string());
        cluster
    }

    fn selector() -> LabelSelector {
        LabelSelector {
            match_labels: Some([("set".to_string(), "worker-a".to_string())].into()),
            ..Default::default()
        }
    }

    fn legacy_set() -> LegacyMachineSet {
        LegacyMachineSet::new(
            "worker-a",
            LegacyMachineSetSpec {
                replicas: Some(3),
                selector: selector(),
                template: LegacyMachineTemplate {
                    metadata: Some(MachineTemplateMeta {
                        labels: Some([("set".to_string(), "worker-a".to_string())].into()),
                        annotations: None,
                    }),
                    spec: LegacyMachineSpec {
                        provider_spec: Some(ProviderSpec {
                            value: Some(serde_json::json!({
                                "apiVersion": "awsprovider.legacy.machine.dev/v1beta1",
                                "instanceType": "m5.large"
                            })),
                        }),
                        ..Default::default()
                    },
                },
                ..Default::default()
            },
        )
    }

    #[test]
    fn set_conversion_round_trips() {
        let converter = converter();
        let original = legacy_set();

        let (modern, template, warnings) = converter
            .legacy_machine_set_to_modern(&original, &cluster())
            .unwrap();
        assert!(warnings.is_empty());
        assert_eq!(modern.spec.replicas, Some(3));
        assert_eq!(
            modern.spec.template.spec.infrastructure_ref.kind.as_deref(),
            Some("AWSMachineTemplate")
        );
        assert_eq!(
            template.data.pointer("/spec/template/spec/instanceType"),
            Some(&serde_json::json!("m5.large"))
        );

        let (restored, warnings) = converter
            .modern_machine_set_to_legacy(&modern, &template, &cluster())
            .unwrap();
        assert!(warnings.is_empty());
        assert_eq!(
            restored.spec.template.spec.provider_spec,
            original.spec.template.spec.provider_spec
        );
        assert_eq!(
            restored.spec.template.metadata,
            original.spec.template.metadata
        );
        assert_eq!(restored.spec.replicas, original.spec.replicas);
    }

    #[test]
    fn selector_labels_are_restored_additively() {
        let converter = converter();
        let (mut modern, template, _) = converter
            .legacy_machine_set_to_modern(&legacy_set(), &cluster())
            .unwrap();
        modern.spec.template.metadata = None;

        let (restored, warnings) = converter
            .modern_machine_set_to_legacy(&modern, &template, &cluster())
            .unwrap();
        assert_eq!(warnings.len(), 1);
        let labels = restored
            .spec
            .template
            .metadata
            .unwrap()
            .labels
            .unwrap();
        assert_eq!(labels.get("set").map(String::as_str), Some("worker-a"));
    }

    #[test]
    fn template_of_the_wrong_platform_is_rejected() {
        let converter = converter();
        let (modern, _, _) = converter
            .legacy_machine_set_to_modern(&legacy_set(), &cluster())
            .unwrap();

        let foreign = DynamicObject::new(
            "worker-a",
            &Converter::new(Platform::VSphere).template_resource(),
        );
        assert!(matches!(
            converter.modern_machine_set_to_legacy(&modern, &foreign, &cluster()),
            Err(ConvertError::UnexpectedInfraKind { .. })
        ));
    }

    #[test]
    fn modern_set_owned_by_something_else_fails_terminally() {
        let converter = converter();
        let (mut modern, template, _) = converter
            .legacy_machine_set_to_modern(&legacy_set(), &cluster())
            .unwrap();
        modern.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: "not-a-cluster".to_string(),
            uid: "9".to_string(),
            ..Default::default()
        }]);

        let err = converter
            .modern_machine_set_to_legacy(&modern, &template, &cluster())
            .unwrap_err();
        assert!(err.is_terminal());
    }
}
