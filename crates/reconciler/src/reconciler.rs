//! Reconciler implementation.
//!
//! One pass looks at a single claim and applies the next required step of
//! the population: create the shadow claim, rebind its volume, or clean up.
//! Every pass starts from freshly read store state.

use std::sync::Arc;

use either::Either;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};
use volpop_core::PopulatorConfig;
use volpop_core::config::DEFAULT_SHADOW_PREFIX;

use crate::error::{Error, Result};
use crate::rebind::{claim_ref_matches, rebind_volume};
use crate::resources::is_snapshot;
use crate::shadow::{build_shadow_claim, shadow_key, shadow_source_name};
use crate::snapshot::protect_snapshot;
use crate::store::{EventRecorder, ResourceStore, TracingRecorder};
use crate::types::{
    ANNOTATION_MIGRATED_TO, ANNOTATION_SELECTED_NODE, BINDING_WAIT_FOR_FIRST_CONSUMER,
    EventReason, ObjectKey, PopulatorEvent, ReconcileOutcome, destination_name,
    has_replication_destination_source, is_bound, is_lost, is_terminating, storage_class_name,
    volume_name,
};

/// Prefix of provisioners built into the platform.
const IN_TREE_PROVISIONER_PREFIX: &str = "kubernetes.io/";

/// Configuration for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Prefix of shadow claim names.
    pub shadow_prefix: String,
    /// Ignore claims on unmigrated in-tree provisioners.
    pub reject_in_tree_provisioners: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            shadow_prefix: DEFAULT_SHADOW_PREFIX.to_string(),
            reject_in_tree_provisioners: false,
        }
    }
}

impl From<&PopulatorConfig> for ReconcilerConfig {
    fn from(config: &PopulatorConfig) -> Self {
        Self {
            shadow_prefix: config.shadow_prefix.clone(),
            reject_in_tree_provisioners: config.reject_in_tree_provisioners,
        }
    }
}

/// Where the shadow claim has to be provisioned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Placement {
    /// Node chosen by the scheduler, for late-binding storage classes.
    selected_node: Option<String>,
}

/// Whether `class` uses an in-tree provisioner the claim was not migrated from.
pub fn is_unmigrated_in_tree(claim: &PersistentVolumeClaim, class: &StorageClass) -> bool {
    class.provisioner.starts_with(IN_TREE_PROVISIONER_PREFIX)
        && claim
            .annotations()
            .get(ANNOTATION_MIGRATED_TO)
            .is_none_or(String::is_empty)
}

/// Volume populator reconciler.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    recorder: Arc<dyn EventRecorder>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        recorder: Arc<dyn EventRecorder>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            recorder,
            config,
        }
    }

    /// Run one pass over the claim at `key`.
    ///
    /// `Err` is only returned for store failures; the caller retries those
    /// with backoff. Every other result is an `Ok` outcome.
    #[instrument(skip_all, fields(claim = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(claim) = self.store.get_claim(key).await? else {
            debug!("Claim not found");
            return Ok(ReconcileOutcome::ClaimMissing);
        };

        if !has_replication_destination_source(&claim) {
            return Ok(ReconcileOutcome::NotApplicable);
        }

        let placement = match self.resolve_placement(&claim).await? {
            Either::Left(outcome) => return Ok(outcome),
            Either::Right(placement) => placement,
        };

        let Some(shadow_key) = shadow_key(&self.config.shadow_prefix, &claim) else {
            debug!("Claim has no UID yet");
            return Ok(ReconcileOutcome::NotApplicable);
        };
        let shadow = self.store.get_claim(&shadow_key).await?;

        if !is_bound(&claim) {
            let Some(shadow) = shadow.as_ref() else {
                return self.create_shadow(&claim, &placement).await;
            };

            let Some(volume_name) = volume_name(shadow) else {
                info!(shadow = %shadow_key, "Shadow claim has no volume yet");
                return Ok(ReconcileOutcome::ShadowProvisioning);
            };

            let Some(volume) = self.store.get_volume(volume_name).await? else {
                debug!(volume = volume_name, "Volume not found yet");
                return Ok(ReconcileOutcome::VolumeMissing);
            };

            if !claim_ref_matches(&volume, &claim) {
                let snapshot = shadow_source_name(shadow).unwrap_or_default();
                rebind_volume(self.store.as_ref(), &volume, &claim, snapshot).await?;
                info!(volume = volume_name, "Volume rebound, waiting for binder");
                return Ok(ReconcileOutcome::Rebound);
            }
        }

        self.finish(&claim, shadow.as_ref()).await
    }

    /// Check the storage class. `Left` ends the pass with that outcome.
    async fn resolve_placement(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<Either<ReconcileOutcome, Placement>> {
        let Some(class_name) = storage_class_name(claim) else {
            debug!("Claim names no storage class, assuming immediate binding");
            return Ok(Either::Right(Placement::default()));
        };

        let Some(class) = self.store.get_storage_class(class_name).await? else {
            info!(storage_class = class_name, "Storage class not found, cannot populate volume yet");
            return Ok(Either::Left(ReconcileOutcome::StorageClassPending));
        };

        if self.config.reject_in_tree_provisioners && is_unmigrated_in_tree(claim, &class) {
            info!(
                storage_class = class_name,
                provisioner = %class.provisioner,
                "In-tree provisioner cannot populate, ignoring claim"
            );
            return Ok(Either::Left(ReconcileOutcome::UnsupportedProvisioner));
        }

        if class.volume_binding_mode.as_deref() != Some(BINDING_WAIT_FOR_FIRST_CONSUMER) {
            return Ok(Either::Right(Placement::default()));
        }

        match claim
            .annotations()
            .get(ANNOTATION_SELECTED_NODE)
            .filter(|node| !node.is_empty())
        {
            Some(node) => Ok(Either::Right(Placement {
                selected_node: Some(node.clone()),
            })),
            None => {
                info!(
                    annotation = ANNOTATION_SELECTED_NODE,
                    "Binding mode is WaitForFirstConsumer, waiting for node selection"
                );
                Ok(Either::Left(ReconcileOutcome::NodePending))
            }
        }
    }

    /// Create the shadow claim from the destination's latest snapshot.
    async fn create_shadow(
        &self,
        claim: &PersistentVolumeClaim,
        placement: &Placement,
    ) -> Result<ReconcileOutcome> {
        let destination_key = ObjectKey::new(
            claim.namespace().unwrap_or_default(),
            destination_name(claim).unwrap_or_default(),
        );

        let Some(destination) = self
            .store
            .get_replication_destination(&destination_key)
            .await?
        else {
            warn!(destination = %destination_key, "Replication destination not found, cannot populate volume yet");
            self.record(
                claim,
                PopulatorEvent::warning(
                    EventReason::DestinationMissing,
                    format!(
                        "Unable to populate volume: replication destination {destination_key} not found"
                    ),
                ),
            )
            .await;
            return Ok(ReconcileOutcome::DestinationMissing);
        };

        let Some(image) = destination.latest_image() else {
            info!(destination = %destination_key, "Replication destination has no latest image yet");
            self.record(
                claim,
                PopulatorEvent::warning(
                    EventReason::NoLatestImage,
                    "Unable to populate volume, waiting for replicationdestination to have latestImage",
                ),
            )
            .await;
            return Ok(ReconcileOutcome::NoLatestImage);
        };

        if !is_snapshot(image) {
            error!(
                destination = %destination_key,
                kind = %image.kind,
                "Latest image is not a volume snapshot"
            );
            self.record(
                claim,
                PopulatorEvent::warning(
                    EventReason::PopulatorError,
                    "Unable to populate volume: ReplicationDestination latestImage is not a volumesnapshot",
                ),
            )
            .await;
            return Ok(ReconcileOutcome::UnsupportedImage);
        }

        let snapshot_key = ObjectKey::new(destination_key.namespace.clone(), image.name.clone());
        protect_snapshot(self.store.as_ref(), &snapshot_key).await?;

        self.create_shadow_from(claim, image, placement).await
    }

    async fn create_shadow_from(
        &self,
        claim: &PersistentVolumeClaim,
        image: &TypedLocalObjectReference,
        placement: &Placement,
    ) -> Result<ReconcileOutcome> {
        let Some(shadow) = build_shadow_claim(
            &self.config.shadow_prefix,
            claim,
            image,
            placement.selected_node.as_deref(),
        ) else {
            return Ok(ReconcileOutcome::NotApplicable);
        };

        info!(shadow = %shadow.name_any(), snapshot = %image.name, "Creating shadow claim from snapshot");
        match self.store.create_claim(&shadow).await {
            Ok(_) => {
                self.record(
                    claim,
                    PopulatorEvent::normal(
                        EventReason::ShadowCreated,
                        format!("Populator pvc created from snapshot {}", image.name),
                    ),
                )
                .await;
                Ok(ReconcileOutcome::ShadowCreated)
            }
            Err(e) => {
                self.record(
                    claim,
                    PopulatorEvent::warning(
                        EventReason::ShadowCreationError,
                        format!("Failed to create populator PVC: {e}"),
                    ),
                )
                .await;
                Err(e)
            }
        }
    }

    /// Wait for the binder, then remove the shadow claim.
    async fn finish(
        &self,
        claim: &PersistentVolumeClaim,
        shadow: Option<&PersistentVolumeClaim>,
    ) -> Result<ReconcileOutcome> {
        let Some(shadow) = shadow else {
            debug!("Claim bound and no shadow claim left");
            return Ok(ReconcileOutcome::AlreadyPopulated);
        };

        if !is_lost(shadow) {
            info!(shadow = %shadow.name_any(), "Waiting for volume rebind");
            return Ok(ReconcileOutcome::AwaitingRebindAck);
        }

        self.record(
            claim,
            PopulatorEvent::normal(EventReason::PopulatorFinished, "Populator finished"),
        )
        .await;

        if !is_terminating(shadow) {
            info!(shadow = %shadow.name_any(), "Deleting shadow claim");
            self.store.delete_claim(&ObjectKey::of(shadow)).await?;
        }
        Ok(ReconcileOutcome::Finished)
    }

    async fn record(&self, claim: &PersistentVolumeClaim, event: PopulatorEvent) {
        self.recorder.record(claim, &event).await;
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Get the configuration.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    store: Option<Arc<dyn ResourceStore>>,
    recorder: Option<Arc<dyn EventRecorder>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            store: None,
            recorder: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Set the resource store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the event recorder.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the shadow claim prefix.
    #[must_use]
    pub fn shadow_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.shadow_prefix = prefix.into();
        self
    }

    /// Enable/disable the in-tree provisioner rule.
    #[must_use]
    pub const fn reject_in_tree_provisioners(mut self, enabled: bool) -> Self {
        self.config.reject_in_tree_provisioners = enabled;
        self
    }

    /// Build the reconciler.
    pub fn build(self) -> Result<Reconciler> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("Resource store is required"))?;

        if self.config.shadow_prefix.is_empty() {
            return Err(Error::invalid_config("Shadow prefix must not be empty"));
        }

        let recorder = self
            .recorder
            .unwrap_or_else(|| Arc::new(TracingRecorder));

        Ok(Reconciler::new(store, recorder, self.config))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, TypedObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::memory::{InMemoryStore, MemoryRecorder, StoreOp};

    fn claim(class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some("apps".to_string()),
                name: Some("data".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: class.map(ToString::to_string),
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

    fn storage_class(name: &str, provisioner: &str, mode: Option<&str>) -> StorageClass {
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

    fn setup() -> (Reconciler, Arc<InMemoryStore>, Arc<MemoryRecorder>) {
        let store = Arc::new(InMemoryStore::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let reconciler = Reconciler::new(store.clone(), recorder.clone(), ReconcilerConfig::default());
        (reconciler, store, recorder)
    }

    fn key() -> ObjectKey {
        ObjectKey::new("apps", "data")
    }

    #[tokio::test]
    async fn test_missing_claim() {
        let (reconciler, _, _) = setup();
        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::ClaimMissing);
    }

    #[tokio::test]
    async fn test_claim_without_destination_source_is_ignored() {
        let (reconciler, store, recorder) = setup();
        let mut plain = claim(Some("fast"));
        plain.spec = Some(PersistentVolumeClaimSpec::default());
        store.apply_claim(plain).await;

        let outcome = reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::NotApplicable);
        assert!(store.writes().await.is_empty());
        assert!(recorder.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_storage_class_waits() {
        let (reconciler, store, recorder) = setup();
        store.apply_claim(claim(Some("fast"))).await;

        let outcome = reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::StorageClassPending);
        assert!(recorder.events().await.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_first_consumer_needs_node() {
        let (reconciler, store, _) = setup();
        store
            .apply_storage_class(storage_class("late", "csi.example.com", Some("WaitForFirstConsumer")))
            .await;
        store.apply_claim(claim(Some("late"))).await;

        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NodePending);

        let mut selected = claim(Some("late"));
        selected.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_SELECTED_NODE.to_string(),
            "node-a".to_string(),
        )]));
        store.apply_claim(selected).await;

        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DestinationMissing);
    }

    #[tokio::test]
    async fn test_in_tree_rule_is_off_by_default() {
        let (reconciler, store, _) = setup();
        store
            .apply_storage_class(storage_class("legacy", "kubernetes.io/aws-ebs", None))
            .await;
        store.apply_claim(claim(Some("legacy"))).await;

        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DestinationMissing);
    }

    #[tokio::test]
    async fn test_in_tree_rule_when_enabled() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = ReconcilerBuilder::new()
            .with_store(store.clone())
            .reject_in_tree_provisioners(true)
            .build()
            .unwrap();
        store
            .apply_storage_class(storage_class("legacy", "kubernetes.io/aws-ebs", None))
            .await;
        store.apply_claim(claim(Some("legacy"))).await;

        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::UnsupportedProvisioner);

        let mut migrated = claim(Some("legacy"));
        migrated.metadata.annotations = Some(BTreeMap::from([(
            ANNOTATION_MIGRATED_TO.to_string(),
            "ebs.csi.aws.com".to_string(),
        )]));
        store.apply_claim(migrated).await;

        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::DestinationMissing);
    }

    #[tokio::test]
    async fn test_missing_destination_emits_warning() {
        let (reconciler, store, recorder) = setup();
        store.apply_claim(claim(None)).await;

        let outcome = reconciler.reconcile(&key()).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::DestinationMissing);
        assert_eq!(recorder.reasons().await, vec![EventReason::DestinationMissing]);
        assert!(store.writes().await.is_empty());
    }

    #[tokio::test]
    async fn test_store_error_propagates_without_event() {
        let (reconciler, store, recorder) = setup();
        store.apply_claim(claim(None)).await;
        store.fail_next(StoreOp::GetReplicationDestination).await;

        let result = reconciler.reconcile(&key()).await;

        assert!(result.is_err_and(|e| e.is_transient()));
        assert!(recorder.events().await.is_empty());
    }

    #[test]
    fn test_is_unmigrated_in_tree() {
        let legacy = storage_class("legacy", "kubernetes.io/gce-pd", None);
        let csi = storage_class("csi", "pd.csi.storage.gke.io", None);
        assert!(is_unmigrated_in_tree(&claim(None), &legacy));
        assert!(!is_unmigrated_in_tree(&claim(None), &csi));
    }

    #[test]
    fn test_builder() {
        let store: Arc<dyn ResourceStore> = Arc::new(InMemoryStore::new());

        let result = ReconcilerBuilder::new()
            .with_store(store.clone())
            .shadow_prefix("custom")
            .build();
        assert_eq!(
            result.as_ref().map(|r| r.config().shadow_prefix.clone()).ok(),
            Some("custom".to_string())
        );

        assert!(ReconcilerBuilder::new().build().is_err());
        assert!(
            ReconcilerBuilder::new()
                .with_store(store)
                .shadow_prefix("")
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_config_from_populator_config() {
        let config = PopulatorConfig::default().shadow_prefix("other");
        let converted = ReconcilerConfig::from(&config);
        assert_eq!(converted.shadow_prefix, "other");
        assert!(!converted.reject_in_tree_provisioners);
    }
}
