//! Shadow claim naming and construction.
//!
//! A shadow claim is the temporary claim created from the latest snapshot of
//! a replication destination. Its name is derived from the original claim's
//! UID, so it can always be looked up directly.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    TypedObjectReference,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use crate::types::{
    ANNOTATION_SELECTED_NODE, CREATED_BY_VALUE, LABEL_CREATED_BY, LABEL_SHADOW_FOR, ObjectKey,
};

/// Name of the shadow claim for an original claim UID.
pub fn shadow_claim_name(prefix: &str, uid: &str) -> String {
    format!("{prefix}-{uid}")
}

/// Key of the shadow claim for `claim`, if the claim has a UID.
pub fn shadow_key(prefix: &str, claim: &PersistentVolumeClaim) -> Option<ObjectKey> {
    let uid = claim.uid().filter(|uid| !uid.is_empty())?;
    Some(ObjectKey::new(
        claim.namespace().unwrap_or_default(),
        shadow_claim_name(prefix, &uid),
    ))
}

/// Build the shadow claim for `claim` sourcing data from `image`.
///
/// The shadow copies access modes, resources, storage class and volume mode,
/// is controlled by the original claim (blocking its foreground deletion)
/// and carries the populator labels.
/// `selected_node` is copied as an annotation for late-binding classes.
/// Returns `None` when the original claim has no name or UID.
pub fn build_shadow_claim(
    prefix: &str,
    claim: &PersistentVolumeClaim,
    image: &TypedLocalObjectReference,
    selected_node: Option<&str>,
) -> Option<PersistentVolumeClaim> {
    let key = shadow_key(prefix, claim)?;
    let owner = OwnerReference {
        block_owner_deletion: Some(true),
        ..claim.controller_owner_ref(&())?
    };
    let spec = claim.spec.clone().unwrap_or_default();

    let labels = BTreeMap::from([
        (LABEL_SHADOW_FOR.to_string(), claim.name_any()),
        (LABEL_CREATED_BY.to_string(), CREATED_BY_VALUE.to_string()),
    ]);
    let annotations = selected_node.map(|node| {
        BTreeMap::from([(ANNOTATION_SELECTED_NODE.to_string(), node.to_string())])
    });

    Some(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(key.name),
            namespace: Some(key.namespace),
            labels: Some(labels),
            annotations,
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: spec.access_modes,
            resources: spec.resources,
            storage_class_name: spec.storage_class_name,
            volume_mode: spec.volume_mode,
            data_source_ref: Some(TypedObjectReference {
                api_group: image.api_group.clone(),
                kind: image.kind.clone(),
                name: image.name.clone(),
                namespace: None,
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Whether a claim carries the shadow label.
pub fn is_shadow_claim(claim: &PersistentVolumeClaim) -> bool {
    claim.labels().contains_key(LABEL_SHADOW_FOR)
}

/// Key of the claim controlling a shadow claim.
///
/// Only controller references to a claim count; the owner lives in the
/// shadow's namespace.
pub fn owner_of_shadow(shadow: &PersistentVolumeClaim) -> Option<ObjectKey> {
    shadow
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true) && owner.kind == "PersistentVolumeClaim")
        .map(|owner| ObjectKey::new(shadow.namespace().unwrap_or_default(), owner.name.clone()))
}

/// Name of the snapshot a shadow claim was created from.
pub fn shadow_source_name(shadow: &PersistentVolumeClaim) -> Option<&str> {
    shadow
        .spec
        .as_ref()
        .and_then(|spec| spec.data_source_ref.as_ref())
        .map(|source| source.name.as_str())
}
