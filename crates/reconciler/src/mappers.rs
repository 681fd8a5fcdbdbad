//! Change mappers: turn watch events into claim reconcile requests.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::{debug, error};

use crate::index::ClaimIndexName;
use crate::predicates::{claim_filter, destination_filter, shadow_filter, storage_class_filter};
use crate::resources::ReplicationDestination;
use crate::shadow::owner_of_shadow;
use crate::store::ResourceStore;
use crate::types::{ObjectKey, is_bound};
use crate::watch::ChangeEvent;

/// Unbound claims referring to `destination`, in its namespace.
pub async fn claims_for_destination(
    store: &dyn ResourceStore,
    destination: &ReplicationDestination,
) -> Vec<ObjectKey> {
    let name = destination.name_any();
    let namespace = destination.namespace().unwrap_or_default();
    match store
        .list_claims(ClaimIndexName::ReplicationDestination, &name, Some(&namespace))
        .await
    {
        Ok(claims) => unbound_keys(claims),
        Err(e) => {
            error!(
                error = %e,
                destination = %name,
                namespace = %namespace,
                index = ClaimIndexName::ReplicationDestination.as_str(),
                "Error looking up claims matching replication destination"
            );
            Vec::new()
        }
    }
}

/// Unbound claims using `class`, across all namespaces.
pub async fn claims_for_storage_class(
    store: &dyn ResourceStore,
    class: &StorageClass,
) -> Vec<ObjectKey> {
    let name = class.name_any();
    match store
        .list_claims(ClaimIndexName::StorageClass, &name, None)
        .await
    {
        Ok(claims) => unbound_keys(claims),
        Err(e) => {
            error!(
                error = %e,
                storage_class = %name,
                index = ClaimIndexName::StorageClass.as_str(),
                "Error looking up claims matching storage class"
            );
            Vec::new()
        }
    }
}

fn unbound_keys(claims: Vec<PersistentVolumeClaim>) -> Vec<ObjectKey> {
    claims
        .iter()
        .filter(|claim| !is_bound(claim))
        .map(ObjectKey::of)
        .collect()
}

/// Keys to reconcile for one change event.
///
/// Claims pass through the claim filter; shadow claims map to their owner;
/// destination and storage class changes are expanded through the index.
pub async fn map_change(store: &dyn ResourceStore, event: &ChangeEvent) -> Vec<ObjectKey> {
    let keys = match event {
        ChangeEvent::Claim(change) => {
            let mut keys = Vec::new();
            if claim_filter(change) {
                keys.push(ObjectKey::of(change.object()));
            }
            if shadow_filter(change) {
                keys.extend(owner_of_shadow(change.object()));
            }
            keys
        }
        ChangeEvent::Destination(change) if destination_filter(change) => {
            claims_for_destination(store, change.object()).await
        }
        ChangeEvent::StorageClass(change) if storage_class_filter(change) => {
            claims_for_storage_class(store, change.object()).await
        }
        ChangeEvent::Destination(_) | ChangeEvent::StorageClass(_) => Vec::new(),
    };

    if !keys.is_empty() {
        debug!(
            kind = event.kind(),
            change = event.verb(),
            count = keys.len(),
            "Mapped change to claims"
        );
    }
    keys
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, TypedObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::memory::{InMemoryStore, StoreOp};
    use crate::watch::WatchEvent;

    fn claim(namespace: &str, name: &str, class: &str, volume: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(class.to_string()),
                volume_name: volume.map(ToString::to_string),
                data_source_ref: Some(TypedObjectReference {
                    api_group: Some("volsync.backube".to_string()),
                    kind: "ReplicationDestination".to_string(),
                    name: "rd1".to_string(),
                    namespace: None,
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn destination(namespace: &str) -> ReplicationDestination {
        ReplicationDestination {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some("rd1".to_string()),
                ..Default::default()
            },
            status: None,
        }
    }

    fn class(name: &str) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: "csi.example.com".to_string(),
            ..Default::default()
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.apply_claim(claim("apps", "a", "fast", None)).await;
        store.apply_claim(claim("apps", "b", "fast", Some("pv-b"))).await;
        store.apply_claim(claim("other", "c", "fast", None)).await;
        store.apply_claim(claim("apps", "d", "slow", None)).await;
        store
    }

    #[tokio::test]
    async fn test_destination_maps_unbound_claims_in_namespace() {
        let store = seeded().await;
        let mut keys = claims_for_destination(&store, &destination("apps")).await;
        keys.sort();
        assert_eq!(keys, vec![ObjectKey::new("apps", "a"), ObjectKey::new("apps", "d")]);
    }

    /// Given claims queued before their storage class exists
    /// When the class is created
    /// Then exactly the unbound claims indexed under it are returned
    #[tokio::test]
    async fn test_storage_class_maps_unbound_claims_everywhere() {
        let store = seeded().await;
        let mut keys = claims_for_storage_class(&store, &class("fast")).await;
        keys.sort();
        assert_eq!(keys, vec![ObjectKey::new("apps", "a"), ObjectKey::new("other", "c")]);
    }

    #[tokio::test]
    async fn test_lookup_failure_maps_to_nothing() {
        let store = seeded().await;
        store.fail_next(StoreOp::ListClaims).await;
        assert!(claims_for_storage_class(&store, &class("fast")).await.is_empty());
    }

    #[tokio::test]
    async fn test_map_change_applies_filters() {
        let store = seeded().await;

        let update = ChangeEvent::StorageClass(WatchEvent::Updated {
            old: class("fast"),
            new: class("fast"),
        });
        assert!(map_change(&store, &update).await.is_empty());

        let deleted = ChangeEvent::Destination(WatchEvent::Deleted(destination("apps")));
        assert!(map_change(&store, &deleted).await.is_empty());

        let deleted_claim = ChangeEvent::Claim(WatchEvent::Deleted(claim("apps", "a", "fast", None)));
        assert!(map_change(&store, &deleted_claim).await.is_empty());

        let updated_claim = ChangeEvent::Claim(WatchEvent::Created(claim("apps", "a", "fast", None)));
        assert_eq!(
            map_change(&store, &updated_claim).await,
            vec![ObjectKey::new("apps", "a")]
        );
    }

    #[tokio::test]
    async fn test_map_change_routes_shadow_to_owner() {
        let store = InMemoryStore::new();
        let owner = store.apply_claim(claim("apps", "a", "fast", None)).await;
        let image = k8s_openapi::api::core::v1::TypedLocalObjectReference {
            api_group: Some("snapshot.storage.k8s.io".to_string()),
            kind: "VolumeSnapshot".to_string(),
            name: "snap1".to_string(),
        };
        let shadow = crate::shadow::build_shadow_claim("vs-prime", &owner, &image, None).unwrap();

        let keys = map_change(&store, &ChangeEvent::Claim(WatchEvent::Created(shadow))).await;
        assert_eq!(keys, vec![ObjectKey::new("apps", "a")]);
    }
}
