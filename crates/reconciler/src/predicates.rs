//! Event filters deciding which store changes can wake the populator.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;

use crate::resources::ReplicationDestination;
use crate::shadow::is_shadow_claim;
use crate::types::has_replication_destination_source;
use crate::watch::WatchEvent;

/// Claims referring to a replication destination, on create/update/generic.
///
/// Deletes never trigger a reconcile; garbage collection handles cleanup.
pub fn claim_filter(event: &WatchEvent<PersistentVolumeClaim>) -> bool {
    match event {
        WatchEvent::Deleted(_) => false,
        WatchEvent::Created(claim) | WatchEvent::Generic(claim) => {
            has_replication_destination_source(claim)
        }
        WatchEvent::Updated { new, .. } => has_replication_destination_source(new),
    }
}

/// Shadow claims (carrying the populator label), on create/update/generic.
pub fn shadow_filter(event: &WatchEvent<PersistentVolumeClaim>) -> bool {
    match event {
        WatchEvent::Deleted(_) => false,
        WatchEvent::Created(claim) | WatchEvent::Generic(claim) => is_shadow_claim(claim),
        WatchEvent::Updated { new, .. } => is_shadow_claim(new),
    }
}

/// Every destination change except deletes.
pub const fn destination_filter(event: &WatchEvent<ReplicationDestination>) -> bool {
    !matches!(event, WatchEvent::Deleted(_))
}

/// Storage classes only matter when they first appear.
pub const fn storage_class_filter(event: &WatchEvent<StorageClass>) -> bool {
    matches!(event, WatchEvent::Created(_))
}
