//! Fixtures shared by the integration tests.
//!
//! The helpers stand in for the external provisioner and binder, which own
//! the volume lifecycle around the populator.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeSpec, TypedLocalObjectReference,
    TypedObjectReference,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use volpop_reconciler::resources::ReplicationDestinationStatus;
use volpop_reconciler::shadow::shadow_key;
use volpop_reconciler::{
    InMemoryStore, MemoryRecorder, ObjectKey, Reconciler, ReconcilerBuilder,
    ReplicationDestination, VolumeSnapshot,
};

pub const NAMESPACE: &str = "apps";
pub const PREFIX: &str = "vs-prime";

pub fn snapshot_image(name: &str) -> TypedLocalObjectReference {
    TypedLocalObjectReference {
        api_group: Some("snapshot.storage.k8s.io".to_string()),
        kind: "VolumeSnapshot".to_string(),
        name: name.to_string(),
    }
}

pub fn volume_image(name: &str) -> TypedLocalObjectReference {
    TypedLocalObjectReference {
        api_group: None,
        kind: "PersistentVolumeClaim".to_string(),
        name: name.to_string(),
    }
}

pub fn destination(name: &str, image: Option<TypedLocalObjectReference>) -> ReplicationDestination {
    ReplicationDestination {
        metadata: ObjectMeta {
            namespace: Some(NAMESPACE.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(ReplicationDestinationStatus {
            latest_image: image,
        }),
    }
}

pub fn snapshot(name: &str) -> VolumeSnapshot {
    VolumeSnapshot {
        metadata: ObjectMeta {
            namespace: Some(NAMESPACE.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: serde_json::json!({"source": {"persistentVolumeClaimName": "source"}}),
        status: None,
    }
}

pub fn storage_class(name: &str, provisioner: &str, mode: Option<&str>) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: provisioner.to_string(),
        volume_binding_mode: mode.map(ToString::to_string),
        ..Default::default()
    }
}

/// A claim populated from replication destination `rd`.
pub fn claim(name: &str, rd: &str, class: Option<&str>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            namespace: Some(NAMESPACE.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: class.map(ToString::to_string),
            data_source_ref: Some(TypedObjectReference {
                api_group: Some("volsync.backube".to_string()),
                kind: "ReplicationDestination".to_string(),
                name: rd.to_string(),
                namespace: None,
            }),
            ..Default::default()
        }),
        status: None,
    }
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

pub fn reconciler(store: &Arc<InMemoryStore>, recorder: &Arc<MemoryRecorder>) -> Reconciler {
    ReconcilerBuilder::new()
        .with_store(store.clone())
        .with_recorder(recorder.clone())
        .shadow_prefix(PREFIX)
        .build()
        .unwrap()
}

/// Store with a destination whose latest image is `snap1`, the snapshot
/// itself, a storage class `fast` and an unbound claim `data` on it.
pub async fn populated_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store
        .apply_storage_class(storage_class("fast", "csi.example.com", None))
        .await;
    store.apply_snapshot(snapshot("snap1")).await;
    store
        .apply_destination(destination("rd1", Some(snapshot_image("snap1"))))
        .await;
    store.apply_claim(claim("data", "rd1", Some("fast"))).await;
    store
}

/// Current shadow claim of `claim`, if any.
pub async fn shadow_of(store: &InMemoryStore, claim: &str) -> Option<PersistentVolumeClaim> {
    let owner = store.claim(&key(claim)).await?;
    let shadow = shadow_key(PREFIX, &owner)?;
    store.claim(&shadow).await
}

/// Provision a volume for the shadow claim of `claim` and bind the two.
pub async fn provision_shadow(store: &InMemoryStore, claim: &str, volume: &str) {
    let mut shadow = shadow_of(store, claim).await.unwrap();
    store
        .apply_volume(PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                claim_ref: Some(ObjectReference {
                    namespace: shadow.namespace(),
                    name: Some(shadow.name_any()),
                    uid: shadow.uid(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        })
        .await;

    if let Some(spec) = shadow.spec.as_mut() {
        spec.volume_name = Some(volume.to_string());
    }
    shadow.status = Some(phase("Bound"));
    store.apply_claim(shadow).await;
}

/// Complete the binder's side of a rebind: the claim is bound to `volume`
/// and the shadow claim is marked Lost.
pub async fn acknowledge_rebind(store: &InMemoryStore, claim: &str, volume: &str) {
    let mut shadow = shadow_of(store, claim).await.unwrap();
    shadow.status = Some(phase("Lost"));
    store.apply_claim(shadow).await;

    let mut original = store.claim(&key(claim)).await.unwrap();
    if let Some(spec) = original.spec.as_mut() {
        spec.volume_name = Some(volume.to_string());
    }
    original.status = Some(phase("Bound"));
    store.apply_claim(original).await;
}

fn phase(phase: &str) -> PersistentVolumeClaimStatus {
    PersistentVolumeClaimStatus {
        phase: Some(phase.to_string()),
        ..Default::default()
    }
}

pub fn annotated(mut claim: PersistentVolumeClaim, key: &str, value: &str) -> PersistentVolumeClaim {
    claim
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
    claim
}
