//! Platform dispatch.
//!
//! A fixed set of platforms is supported. Each row of [`CAPABILITIES`] names
//! the infrastructure kinds and provider-spec schema that platform uses; a
//! [`Converter`] is built from one row at startup and parameterises both sync
//! engines for the life of the process.

use std::fmt::{Display, Formatter};

use handover_api::{config::Infrastructure, INFRA_GROUP, MACHINE_API_VERSION};
use kube::core::{ApiResource, GroupVersionKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    Aws,
    OpenStack,
    VSphere,
    PowerVs,
}

/// One capability row per supported platform: the infrastructure kinds the
/// modern API uses and the apiVersion expected inside the legacy provider
/// spec.
#[derive(Debug)]
pub struct PlatformCapabilities {
    pub platform: Platform,
    pub template_kind: &'static str,
    pub infra_machine_kind: &'static str,
    pub provider_spec_api_version: &'static str,
}

static CAPABILITIES: [PlatformCapabilities; 4] = [
    PlatformCapabilities {
        platform: Platform::Aws,
        template_kind: "AWSMachineTemplate",
        infra_machine_kind: "AWSMachine",
        provider_spec_api_version: "awsprovider.legacy.machine.dev/v1beta1",
    },
    PlatformCapabilities {
        platform: Platform::OpenStack,
        template_kind: "OpenStackMachineTemplate",
        infra_machine_kind: "OpenStackMachine",
        provider_spec_api_version: "openstackprovider.legacy.machine.dev/v1alpha1",
    },
    PlatformCapabilities {
        platform: Platform::VSphere,
        template_kind: "VSphereMachineTemplate",
        infra_machine_kind: "VSphereMachine",
        provider_spec_api_version: "vsphereprovider.legacy.machine.dev/v1beta1",
    },
    PlatformCapabilities {
        platform: Platform::PowerVs,
        template_kind: "PowerVSMachineTemplate",
        infra_machine_kind: "PowerVSMachine",
        provider_spec_api_version: "powervsprovider.legacy.machine.dev/v1beta1",
    },
];

impl Platform {
    /// Parses the platform identifier from the infrastructure singleton.
    /// Unknown platforms are unsupported; the process idles on them.
    pub fn from_infrastructure(infrastructure: &Infrastructure) -> Option<Self> {
        match infrastructure.platform()? {
            "AWS" => Some(Platform::Aws),
            "OpenStack" => Some(Platform::OpenStack),
            "VSphere" => Some(Platform::VSphere),
            "PowerVS" => Some(Platform::PowerVs),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> &'static PlatformCapabilities {
        CAPABILITIES
            .iter()
            .find(|row| row.platform == *self)
            .expect("capability table covers every platform variant")
    }

    /// Whether this platform sits behind a secondary feature gate.
    pub fn gated_separately(&self) -> bool {
        matches!(self, Platform::VSphere)
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Platform::Aws => "AWS",
            Platform::OpenStack => "OpenStack",
            Platform::VSphere => "VSphere",
            Platform::PowerVs => "PowerVS",
        };
        f.write_str(name)
    }
}

/// Conversion functions for one platform, plus the dynamic resource handles
/// for its infrastructure kinds.
#[derive(Debug)]
pub struct Converter {
    caps: &'static PlatformCapabilities,
}

impl Converter {
    pub fn new(platform: Platform) -> Self {
        Self {
            caps: platform.capabilities(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.caps.platform
    }

    pub(crate) fn capabilities(&self) -> &'static PlatformCapabilities {
        self.caps
    }

    /// Dynamic handle for this platform's infrastructure template kind.
    pub fn template_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            INFRA_GROUP,
            MACHINE_API_VERSION,
            self.caps.template_kind,
        ))
    }

    /// Dynamic handle for this platform's infrastructure machine kind.
    pub fn infra_machine_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            INFRA_GROUP,
            MACHINE_API_VERSION,
            self.caps.infra_machine_kind,
        ))
    }
}

#[cfg(test)]
mod tests {
    use handover_api::config::{Infrastructure, InfrastructureStatus};
    use rstest::rstest;

    use super::*;

    fn infrastructure(platform: &str) -> Infrastructure {
        Infrastructure {
            status: Some(InfrastructureStatus {
                platform: Some(platform.to_string()),
                infrastructure_name: Some("prod-4h7xl".to_string()),
            }),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("AWS", Some(Platform::Aws))]
    #[case("OpenStack", Some(Platform::OpenStack))]
    #[case("VSphere", Some(Platform::VSphere))]
    #[case("PowerVS", Some(Platform::PowerVs))]
    #[case("BareMetal", None)]
    fn platform_parsing(#[case] name: &str, #[case] expected: Option<Platform>) {
        assert_eq!(Platform::from_infrastructure(&infrastructure(name)), expected);
    }

    #[test]
    fn capability_rows_are_platform_consistent() {
        for platform in [Platform::Aws, Platform::OpenStack, Platform::VSphere, Platform::PowerVs] {
            let caps = platform.capabilities();
            assert_eq!(caps.platform, platform);
            assert!(caps.template_kind.ends_with("MachineTemplate"));
            assert!(caps.infra_machine_kind.ends_with("Machine"));
        }
    }

    #[test]
    fn only_vsphere_is_gated_separately() {
        assert!(Platform::VSphere.gated_separately());
        assert!(!Platform::Aws.gated_separately());
    }

    #[test]
    fn template_resource_carries_infra_group() {
        let converter = Converter::new(Platform::Aws);
        let resource = converter.template_resource();
        assert_eq!(resource.group, "infrastructure.machine.dev");
        assert_eq!(resource.kind, "AWSMachineTemplate");
    }
}
