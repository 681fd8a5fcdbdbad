//! Resource store and event recorder seams.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;

use crate::error::Result;
use crate::index::ClaimIndexName;
use crate::resources::{ReplicationDestination, VolumeSnapshot};
use crate::types::{EventType, ObjectKey, PopulatorEvent};

/// Object store consumed by the reconciler.
///
/// Reads return `Ok(None)` when the object does not exist; every other
/// failure is an error.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a claim.
    async fn get_claim(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>>;

    /// List claims through a named index, optionally within one namespace.
    async fn list_claims(
        &self,
        index: ClaimIndexName,
        value: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<PersistentVolumeClaim>>;

    /// Create a claim, returning the stored object.
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;

    /// Delete a claim. Deleting a missing claim succeeds.
    async fn delete_claim(&self, key: &ObjectKey) -> Result<()>;

    /// Get a volume by name.
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Apply a JSON merge patch to a volume.
    ///
    /// When the patch sets `metadata.resourceVersion` the write only succeeds
    /// against that version.
    async fn patch_volume(&self, name: &str, patch: &serde_json::Value)
    -> Result<PersistentVolume>;

    /// Get a storage class by name.
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    /// Get a replication destination.
    async fn get_replication_destination(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ReplicationDestination>>;

    /// Get a volume snapshot.
    async fn get_snapshot(&self, key: &ObjectKey) -> Result<Option<VolumeSnapshot>>;

    /// Replace a volume snapshot, guarded by its resource version.
    async fn update_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot>;
}

/// Sink for events reported against claims.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Record an event. Failures are handled by the recorder.
    async fn record(&self, claim: &PersistentVolumeClaim, event: &PopulatorEvent);
}

/// [`EventRecorder`] that only writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

#[async_trait]
impl EventRecorder for TracingRecorder {
    async fn record(&self, claim: &PersistentVolumeClaim, event: &PopulatorEvent) {
        let claim = ObjectKey::of(claim);
        match event.event_type {
            EventType::Normal => tracing::info!(
                claim = %claim,
                reason = %event.reason,
                message = %event.message,
                "Event"
            ),
            EventType::Warning => tracing::warn!(
                claim = %claim,
                reason = %event.reason,
                message = %event.message,
                "Event"
            ),
        }
    }
}
