//! Rebind maneuver: move a provisioned volume from the shadow claim to the
//! original claim.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use kube::ResourceExt;
use serde_json::{Value, json};
use tracing::info;

use crate::error::Result;
use crate::store::ResourceStore;
use crate::types::ANNOTATION_POPULATED_FROM;

/// Whether the volume's claim reference already names `claim`.
///
/// A volume without a claim reference never matches.
pub fn claim_ref_matches(volume: &PersistentVolume, claim: &PersistentVolumeClaim) -> bool {
    volume
        .spec
        .as_ref()
        .and_then(|spec| spec.claim_ref.as_ref())
        .is_some_and(|claim_ref| {
            claim_ref.name.as_deref() == claim.metadata.name.as_deref()
                && claim_ref.namespace.as_deref() == claim.metadata.namespace.as_deref()
                && claim_ref.uid.as_deref() == claim.metadata.uid.as_deref()
        })
}

/// Merge patch pointing `volume` at `claim`.
///
/// The patch carries the volume's resource version, so it only applies to
/// the version that was read.
pub fn rebind_patch(
    volume: &PersistentVolume,
    claim: &PersistentVolumeClaim,
    snapshot_name: &str,
) -> Value {
    let namespace = claim.namespace().unwrap_or_default();
    let mut metadata = json!({
        "annotations": {
            ANNOTATION_POPULATED_FROM: format!("{namespace}/{snapshot_name}"),
        },
    });
    if let (Some(version), Some(fields)) = (volume.resource_version(), metadata.as_object_mut()) {
        fields.insert("resourceVersion".to_string(), Value::String(version));
    }

    json!({
        "metadata": metadata,
        "spec": {
            "claimRef": {
                "namespace": namespace,
                "name": claim.name_any(),
                "uid": claim.uid(),
                "resourceVersion": claim.resource_version(),
            },
        },
    })
}

/// Patch `volume` over to `claim`.
pub async fn rebind_volume(
    store: &dyn ResourceStore,
    volume: &PersistentVolume,
    claim: &PersistentVolumeClaim,
    snapshot_name: &str,
) -> Result<PersistentVolume> {
    let patch = rebind_patch(volume, claim, snapshot_name);
    let name = volume.name_any();
    info!(volume = %name, claim = %claim.name_any(), "Patching volume claim reference");
    store.patch_volume(&name, &patch).await
}
