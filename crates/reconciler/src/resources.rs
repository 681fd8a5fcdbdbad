//! Upstream custom resources read by the populator.
//!
//! Only the fields the populator looks at are modeled. Snapshots keep their
//! `spec` and `status` as raw JSON so a write-back does not drop anything.

use std::borrow::Cow;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use crate::types::{
    REPLICATION_DESTINATION_KIND, REPLICATION_GROUP, REPLICATION_VERSION, SNAPSHOT_GROUP,
    SNAPSHOT_KIND, SNAPSHOT_VERSION,
};

/// A replication destination (`volsync.backube/v1alpha1`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationDestination {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReplicationDestinationStatus>,
}

/// Observed state of a replication destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationStatus {
    /// The most recent image produced by the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_image: Option<TypedLocalObjectReference>,
}

impl ReplicationDestination {
    /// The most recent image, if one was recorded.
    pub fn latest_image(&self) -> Option<&TypedLocalObjectReference> {
        self.status
            .as_ref()
            .and_then(|status| status.latest_image.as_ref())
    }

    /// API resource used for dynamic access.
    pub fn api_resource() -> ApiResource {
        ApiResource::erase::<Self>(&())
    }
}

impl Resource for ReplicationDestination {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(REPLICATION_DESTINATION_KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(REPLICATION_GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(REPLICATION_VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("replicationdestinations")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// A volume snapshot (`snapshot.storage.k8s.io/v1`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

impl VolumeSnapshot {
    /// API resource used for dynamic access.
    pub fn api_resource() -> ApiResource {
        ApiResource::erase::<Self>(&())
    }
}

impl Resource for VolumeSnapshot {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(SNAPSHOT_KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(SNAPSHOT_GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(SNAPSHOT_VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("volumesnapshots")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Whether an image reference points at a volume snapshot.
///
/// Destinations using a direct copy method record the volume itself instead.
pub fn is_snapshot(image: &TypedLocalObjectReference) -> bool {
    image.kind == SNAPSHOT_KIND && image.api_group.as_deref() == Some(SNAPSHOT_GROUP)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use kube::ResourceExt;
    use serde_json::json;

    use super::*;
    use crate::types::ObjectKey;

    #[test]
    fn test_destination_parses_latest_image() {
        let rd: ReplicationDestination = serde_json::from_value(json!({
            "apiVersion": "volsync.backube/v1alpha1",
            "kind": "ReplicationDestination",
            "metadata": {"name": "rd1", "namespace": "apps"},
            "spec": {"trigger": {"manual": "once"}},
            "status": {
                "latestImage": {
                    "apiGroup": "snapshot.storage.k8s.io",
                    "kind": "VolumeSnapshot",
                    "name": "snap1"
                },
                "lastSyncTime": "2024-01-01T00:00:00Z"
            }
        }))
        .unwrap();

        let image = rd.latest_image().unwrap();
        assert_eq!(image.name, "snap1");
        assert!(is_snapshot(image));
    }

    #[test]
    fn test_destination_without_status() {
        let rd: ReplicationDestination = serde_json::from_value(json!({
            "metadata": {"name": "rd1", "namespace": "apps"}
        }))
        .unwrap();
        assert!(rd.latest_image().is_none());
    }

    #[test]
    fn test_direct_copy_image_is_not_snapshot() {
        let image = TypedLocalObjectReference {
            api_group: None,
            kind: "PersistentVolumeClaim".to_string(),
            name: "rd1-dest".to_string(),
        };
        assert!(!is_snapshot(&image));
    }

    #[test]
    fn test_snapshot_keeps_unknown_spec() {
        let snap: VolumeSnapshot = serde_json::from_value(json!({
            "metadata": {"name": "snap1", "namespace": "apps"},
            "spec": {"source": {"persistentVolumeClaimName": "src"}}
        }))
        .unwrap();
        let back = serde_json::to_value(&snap).unwrap();
        assert_eq!(back["spec"]["source"]["persistentVolumeClaimName"], "src");
    }

    #[test]
    fn test_api_resources() {
        assert_eq!(ReplicationDestination::api_resource().plural, "replicationdestinations");
        assert_eq!(VolumeSnapshot::api_resource().plural, "volumesnapshots");
        assert_eq!(VolumeSnapshot::api_resource().group, "snapshot.storage.k8s.io");
    }

    /// Given a parsed destination and snapshot
    /// When they are addressed through their resource metadata
    /// Then keys and API versions match the upstream kinds
    #[test]
    fn test_custom_resources_are_addressable() {
        let rd: ReplicationDestination = serde_json::from_value(json!({
            "metadata": {"name": "rd1", "namespace": "apps", "uid": "rd-uid"}
        }))
        .unwrap();
        let snap: VolumeSnapshot = serde_json::from_value(json!({
            "metadata": {"name": "snap1", "namespace": "apps"}
        }))
        .unwrap();

        assert_eq!(ObjectKey::of(&rd), ObjectKey::new("apps", "rd1"));
        assert_eq!(ObjectKey::of(&snap), ObjectKey::new("apps", "snap1"));
        assert_eq!(rd.uid().as_deref(), Some("rd-uid"));
        assert_eq!(ReplicationDestination::api_version(&()), "volsync.backube/v1alpha1");
        assert_eq!(VolumeSnapshot::api_version(&()), "snapshot.storage.k8s.io/v1");
        assert_eq!(VolumeSnapshot::kind(&()), "VolumeSnapshot");
    }
}
