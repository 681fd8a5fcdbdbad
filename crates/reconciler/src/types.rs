//! Core types for the reconciler.

use std::fmt;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

/// API group of replication destinations.
pub const REPLICATION_GROUP: &str = "volsync.backube";
/// API version of replication destinations.
pub const REPLICATION_VERSION: &str = "v1alpha1";
/// Kind a claim's data source must name to be populated by this controller.
pub const REPLICATION_DESTINATION_KIND: &str = "ReplicationDestination";

/// API group of volume snapshots.
pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
/// API version of volume snapshots.
pub const SNAPSHOT_VERSION: &str = "v1";
/// Kind of volume snapshots.
pub const SNAPSHOT_KIND: &str = "VolumeSnapshot";

/// Annotation the scheduler sets on claims bound late (WaitForFirstConsumer).
pub const ANNOTATION_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";
/// Annotation recorded on a rebound volume.
pub const ANNOTATION_POPULATED_FROM: &str = "volsync.backube/populated-from";
/// Annotation marking a claim migrated from an in-tree plugin to CSI.
pub const ANNOTATION_MIGRATED_TO: &str = "pv.kubernetes.io/migrated-to";

/// Label put on shadow claims; value is the original claim name.
pub const LABEL_SHADOW_FOR: &str = "volsync.backube/populator-pvc-for";
/// Label identifying objects created by volsync.
pub const LABEL_CREATED_BY: &str = "app.kubernetes.io/created-by";
/// Value of [`LABEL_CREATED_BY`].
pub const CREATED_BY_VALUE: &str = "volsync";
/// Label protecting a snapshot from upstream cleanup.
pub const LABEL_DO_NOT_DELETE: &str = "volsync.backube/do-not-delete";

/// Storage class binding mode that delays provisioning until scheduling.
pub const BINDING_WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";
/// Claim phase set by the binder once a claim's volume is gone or rebound.
pub const PHASE_LOST: &str = "Lost";

/// Key of a reconcile request.
///
/// Cluster-scoped objects have an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a namespaced key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a key for a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    /// Key of any kube object.
    pub fn of<K: kube::Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Whether the claim's data source names a replication destination.
///
/// Only claims passing this check are indexed, watched or reconciled.
pub fn has_replication_destination_source(claim: &PersistentVolumeClaim) -> bool {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.data_source_ref.as_ref())
        .is_some_and(|source| {
            source.api_group.as_deref() == Some(REPLICATION_GROUP)
                && source.kind == REPLICATION_DESTINATION_KIND
                && !source.name.is_empty()
        })
}

/// Name of the replication destination a claim refers to.
pub fn destination_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.data_source_ref.as_ref())
        .map(|source| source.name.as_str())
        .filter(|name| !name.is_empty())
}

/// Storage class name of a claim, if any.
pub fn storage_class_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.storage_class_name.as_deref())
}

/// Name of the volume a claim is bound to, if any.
pub fn volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_name.as_deref())
        .filter(|name| !name.is_empty())
}

/// A claim with a volume name set is bound.
pub fn is_bound(claim: &PersistentVolumeClaim) -> bool {
    volume_name(claim).is_some()
}

/// Whether the binder has marked the claim Lost.
pub fn is_lost(claim: &PersistentVolumeClaim) -> bool {
    claim
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some(PHASE_LOST)
}

/// Whether the object is being deleted.
pub fn is_terminating<K: kube::Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Result of one reconcile pass over a claim.
///
/// Every variant is a clean result; transient failures are reported through
/// [`crate::Error`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    /// The claim no longer exists.
    ClaimMissing,
    /// The claim's data source is not a replication destination.
    NotApplicable,
    /// The claim's storage class does not exist yet.
    StorageClassPending,
    /// The storage class uses an in-tree provisioner that cannot populate.
    UnsupportedProvisioner,
    /// WaitForFirstConsumer binding and no node selected yet.
    NodePending,
    /// The replication destination does not exist.
    DestinationMissing,
    /// The replication destination has no latest image.
    NoLatestImage,
    /// The latest image is not a volume snapshot.
    UnsupportedImage,
    /// The shadow claim was created.
    ShadowCreated,
    /// The shadow claim has no volume yet.
    ShadowProvisioning,
    /// The shadow claim names a volume that does not exist yet.
    VolumeMissing,
    /// The volume was patched over to the original claim.
    Rebound,
    /// Waiting for the binder to mark the shadow claim Lost.
    AwaitingRebindAck,
    /// Population finished; the shadow claim was deleted.
    Finished,
    /// The claim is bound and no shadow claim is left.
    AlreadyPopulated,
}

/// Coarse classification of a [`ReconcileOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// Nothing to do until a watch fires again.
    Waiting,
    /// The pass changed cluster state.
    Progressed,
    /// Nothing to do for the current inputs.
    Terminal,
}

impl ReconcileOutcome {
    /// Classify the outcome.
    pub const fn kind(self) -> OutcomeKind {
        match self {
            Self::StorageClassPending
            | Self::NodePending
            | Self::DestinationMissing
            | Self::NoLatestImage
            | Self::ShadowProvisioning
            | Self::VolumeMissing
            | Self::AwaitingRebindAck => OutcomeKind::Waiting,
            Self::ShadowCreated | Self::Rebound | Self::Finished => OutcomeKind::Progressed,
            Self::ClaimMissing
            | Self::NotApplicable
            | Self::UnsupportedProvisioner
            | Self::UnsupportedImage
            | Self::AlreadyPopulated => OutcomeKind::Terminal,
        }
    }

    /// Short name for logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClaimMissing => "claim-missing",
            Self::NotApplicable => "not-applicable",
            Self::StorageClassPending => "storage-class-pending",
            Self::UnsupportedProvisioner => "unsupported-provisioner",
            Self::NodePending => "node-pending",
            Self::DestinationMissing => "destination-missing",
            Self::NoLatestImage => "no-latest-image",
            Self::UnsupportedImage => "unsupported-image",
            Self::ShadowCreated => "shadow-created",
            Self::ShadowProvisioning => "shadow-provisioning",
            Self::VolumeMissing => "volume-missing",
            Self::Rebound => "rebound",
            Self::AwaitingRebindAck => "awaiting-rebind-ack",
            Self::Finished => "finished",
            Self::AlreadyPopulated => "already-populated",
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// Machine-readable reason of an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventReason {
    PopulatorFinished,
    PopulatorError,
    DestinationMissing,
    NoLatestImage,
    ShadowCreated,
    ShadowCreationError,
}

impl EventReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PopulatorFinished => "VolSyncPopulatorFinished",
            Self::PopulatorError => "VolSyncPopulatorError",
            Self::DestinationMissing => "VolSyncPopulatorReplicationDestinationMissing",
            Self::NoLatestImage => "VolSyncPopulatorReplicationDestinationNoLatestImage",
            Self::ShadowCreated => "VolSyncPopulatorPVCCreated",
            Self::ShadowCreationError => "VolSyncPopulatorPVCCreationError",
        }
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event reported against a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulatorEvent {
    pub event_type: EventType,
    pub reason: EventReason,
    pub message: String,
}

impl PopulatorEvent {
    /// Create a normal event.
    pub fn normal(reason: EventReason, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Normal,
            reason,
            message: message.into(),
        }
    }

    /// Create a warning event.
    pub fn warning(reason: EventReason, message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason,
            message: message.into(),
        }
    }
}
