//! Owner-reference validation.
//!
//! One rule for machines and sets alike: legacy mirrors carry zero owner
//! references, modern mirrors at most one, and that one must point at the
//! cluster object.

use handover_api::modern::ModernCluster;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::ConvertError;

pub(crate) fn check_legacy(meta: &ObjectMeta) -> Result<(), ConvertError> {
    let count = meta
        .owner_references
        .as_ref()
        .map(|refs| refs.len())
        .unwrap_or_default();
    if count > 0 {
        return Err(ConvertError::LegacyOwnerReferences(count));
    }
    Ok(())
}

pub(crate) fn check_modern(meta: &ObjectMeta, cluster: &ModernCluster) -> Result<(), ConvertError> {
    let Some(refs) = meta.owner_references.as_ref().filter(|refs| !refs.is_empty()) else {
        return Ok(());
    };
    if refs.len() > 1 {
        return Err(ConvertError::TooManyOwnerReferences(refs.len()));
    }

    let owner = &refs[0];
    let points_at_cluster = owner.kind == "Cluster"
        && owner.name == cluster.name_any()
        && cluster
            .metadata
            .uid
            .as_ref()
            .map(|uid| *uid == owner.uid)
            .unwrap_or(true);
    if !points_at_cluster {
        return Err(ConvertError::ForeignOwnerReference {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;

    fn cluster() -> ModernCluster {
        let mut cluster = ModernCluster::new("prod-4h7xl", Default::default());
        cluster.metadata.uid = Some("c9b2".to_string());
        cluster
    }

    fn owner(kind: &str, name: &str, uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "cluster.machine.dev/v1beta1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn legacy_mirror_must_be_ownerless() {
        let mut meta = ObjectMeta::default();
        assert!(check_legacy(&meta).is_ok());

        meta.owner_references = Some(vec![owner("MachineSet", "worker-a", "1")]);
        let err = check_legacy(&meta).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn modern_mirror_accepts_the_cluster_owner() {
        let meta = ObjectMeta {
            owner_references: Some(vec![owner("Cluster", "prod-4h7xl", "c9b2")]),
            ..Default::default()
        };
        assert!(check_modern(&meta, &cluster()).is_ok());
    }

    #[test]
    fn modern_mirror_rejects_foreign_owner() {
        let meta = ObjectMeta {
            owner_references: Some(vec![owner("MachineDeployment", "worker-a", "7")]),
            ..Default::default()
        };
        let err = check_modern(&meta, &cluster()).unwrap_err();
        assert!(err.is_terminal());
        assert!(matches!(err, ConvertError::ForeignOwnerReference { .. }));
    }

    #[test]
    fn modern_mirror_rejects_multiple_owners() {
        let meta = ObjectMeta {
            owner_references: Some(vec![
                owner("Cluster", "prod-4h7xl", "c9b2"),
                owner("Cluster", "prod-4h7xl", "c9b2"),
            ]),
            ..Default::default()
        };
        assert!(matches!(
            check_modern(&meta, &cluster()),
            Err(ConvertError::TooManyOwnerReferences(2))
        ));
    }
}
