//! In-memory resource store and event recorder.
//!
//! Used by tests and local runs. The store keeps the claim indexes up to
//! date, assigns UIDs and resource versions, enforces resource-version
//! preconditions, garbage-collects claims owned by a deleted claim and
//! broadcasts every change to watchers.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::index::{ClaimIndex, ClaimIndexName};
use crate::resources::{ReplicationDestination, VolumeSnapshot};
use crate::store::{EventRecorder, ResourceStore};
use crate::types::{EventReason, ObjectKey, PopulatorEvent};
use crate::watch::{ChangeEvent, WatchEvent};

const WATCH_CAPACITY: usize = 1024;

/// Store operations, used for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetClaim,
    ListClaims,
    CreateClaim,
    DeleteClaim,
    GetVolume,
    PatchVolume,
    GetStorageClass,
    GetReplicationDestination,
    GetSnapshot,
    UpdateSnapshot,
}

impl StoreOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetClaim => "get_claim",
            Self::ListClaims => "list_claims",
            Self::CreateClaim => "create_claim",
            Self::DeleteClaim => "delete_claim",
            Self::GetVolume => "get_volume",
            Self::PatchVolume => "patch_volume",
            Self::GetStorageClass => "get_storage_class",
            Self::GetReplicationDestination => "get_replication_destination",
            Self::GetSnapshot => "get_snapshot",
            Self::UpdateSnapshot => "update_snapshot",
        }
    }
}

/// A write made through the [`ResourceStore`] interface.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    CreateClaim(ObjectKey),
    DeleteClaim(ObjectKey),
    PatchVolume { name: String, patch: Value },
    UpdateSnapshot(ObjectKey),
}

#[derive(Debug, Default)]
struct State {
    claims: ClaimIndex,
    volumes: BTreeMap<String, PersistentVolume>,
    storage_classes: BTreeMap<String, StorageClass>,
    destinations: BTreeMap<ObjectKey, ReplicationDestination>,
    snapshots: BTreeMap<ObjectKey, VolumeSnapshot>,
    version: u64,
    writes: Vec<StoreWrite>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version = self.version.saturating_add(1);
        self.version.to_string()
    }

    /// Remove a claim and everything it owns, collecting the removed claims.
    fn remove_claim_cascade(&mut self, key: &ObjectKey, removed: &mut Vec<PersistentVolumeClaim>) {
        let Some(claim) = self.claims.remove(key) else {
            return;
        };
        let owned = claim
            .uid()
            .map(|uid| self.claims.owned_by(&uid))
            .unwrap_or_default();
        removed.push(claim);
        for child in owned {
            self.remove_claim_cascade(&ObjectKey::of(&child), removed);
        }
    }
}

/// In-memory [`ResourceStore`].
pub struct InMemoryStore {
    state: RwLock<State>,
    failures: Mutex<HashMap<StoreOp, usize>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            failures: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Make the next call of `op` fail with a store error.
    pub async fn fail_next(&self, op: StoreOp) {
        self.fail_times(op, 1).await;
    }

    /// Make the next `times` calls of `op` fail with a store error.
    pub async fn fail_times(&self, op: StoreOp, times: usize) {
        let mut failures = self.failures.lock().await;
        let count = failures.entry(op).or_default();
        *count = count.saturating_add(times);
    }

    async fn check(&self, op: StoreOp) -> Result<()> {
        let mut failures = self.failures.lock().await;
        match failures.get_mut(&op) {
            Some(count) if *count > 0 => {
                *count = count.saturating_sub(1);
                debug!(operation = op.as_str(), "Injected store failure");
                Err(Error::store_failed(op.as_str(), "injected failure"))
            }
            _ => Ok(()),
        }
    }

    fn emit(&self, event: ChangeEvent) {
        // No receivers is fine.
        let _ = self.changes.send(event);
    }

    /// Insert or replace a claim, assigning a UID on first insert.
    pub async fn apply_claim(&self, mut claim: PersistentVolumeClaim) -> PersistentVolumeClaim {
        let mut state = self.state.write().await;
        let key = ObjectKey::of(&claim);
        let old = state.claims.get(&key).cloned();
        if claim.metadata.uid.is_none() {
            claim.metadata.uid = Some(
                old.as_ref()
                    .and_then(ResourceExt::uid)
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            );
        }
        claim.metadata.resource_version = Some(state.next_version());
        state.claims.upsert(claim.clone());
        self.emit(ChangeEvent::Claim(match old {
            Some(old) => WatchEvent::Updated {
                old,
                new: claim.clone(),
            },
            None => WatchEvent::Created(claim.clone()),
        }));
        claim
    }

    /// Insert or replace a volume.
    pub async fn apply_volume(&self, mut volume: PersistentVolume) -> PersistentVolume {
        let mut state = self.state.write().await;
        volume.metadata.resource_version = Some(state.next_version());
        state.volumes.insert(volume.name_any(), volume.clone());
        volume
    }

    /// Insert or replace a storage class.
    pub async fn apply_storage_class(&self, mut class: StorageClass) -> StorageClass {
        let mut state = self.state.write().await;
        class.metadata.resource_version = Some(state.next_version());
        let old = state.storage_classes.insert(class.name_any(), class.clone());
        self.emit(ChangeEvent::StorageClass(match old {
            Some(old) => WatchEvent::Updated {
                old,
                new: class.clone(),
            },
            None => WatchEvent::Created(class.clone()),
        }));
        class
    }

    /// Insert or replace a replication destination.
    pub async fn apply_destination(
        &self,
        mut destination: ReplicationDestination,
    ) -> ReplicationDestination {
        let mut state = self.state.write().await;
        destination.metadata.resource_version = Some(state.next_version());
        let old = state
            .destinations
            .insert(ObjectKey::of(&destination), destination.clone());
        self.emit(ChangeEvent::Destination(match old {
            Some(old) => WatchEvent::Updated {
                old,
                new: destination.clone(),
            },
            None => WatchEvent::Created(destination.clone()),
        }));
        destination
    }

    /// Remove a replication destination.
    pub async fn remove_destination(&self, key: &ObjectKey) -> Option<ReplicationDestination> {
        let mut state = self.state.write().await;
        let removed = state.destinations.remove(key);
        if let Some(destination) = &removed {
            self.emit(ChangeEvent::Destination(WatchEvent::Deleted(
                destination.clone(),
            )));
        }
        removed
    }

    /// Insert or replace a volume snapshot.
    pub async fn apply_snapshot(&self, mut snapshot: VolumeSnapshot) -> VolumeSnapshot {
        let mut state = self.state.write().await;
        snapshot.metadata.resource_version = Some(state.next_version());
        state
            .snapshots
            .insert(ObjectKey::of(&snapshot), snapshot.clone());
        snapshot
    }

    /// Current copy of a claim.
    pub async fn claim(&self, key: &ObjectKey) -> Option<PersistentVolumeClaim> {
        self.state.read().await.claims.get(key).cloned()
    }

    /// Current copies of all claims.
    pub async fn claims(&self) -> Vec<PersistentVolumeClaim> {
        self.state.read().await.claims.claims().cloned().collect()
    }

    /// Current copy of a volume.
    pub async fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.state.read().await.volumes.get(name).cloned()
    }

    /// Current copy of a snapshot.
    pub async fn snapshot(&self, key: &ObjectKey) -> Option<VolumeSnapshot> {
        self.state.read().await.snapshots.get(key).cloned()
    }

    /// Writes made through the store interface, oldest first.
    pub async fn writes(&self) -> Vec<StoreWrite> {
        self.state.read().await.writes.clone()
    }

    /// Watch all changes.
    ///
    /// The stream starts with a `Created` event for every claim, destination
    /// and storage class present when it is opened, then follows live changes.
    pub async fn watch(&self) -> BoxStream<'static, ChangeEvent> {
        let state = self.state.read().await;
        let receiver = self.changes.subscribe();

        let mut replay: Vec<ChangeEvent> = state
            .storage_classes
            .values()
            .cloned()
            .map(|class| ChangeEvent::StorageClass(WatchEvent::Created(class)))
            .collect();
        replay.extend(
            state
                .destinations
                .values()
                .cloned()
                .map(|rd| ChangeEvent::Destination(WatchEvent::Created(rd))),
        );
        replay.extend(
            state
                .claims
                .claims()
                .cloned()
                .map(|claim| ChangeEvent::Claim(WatchEvent::Created(claim))),
        );
        drop(state);

        let live = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Store watch lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        futures::stream::iter(replay).chain(live).boxed()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_claim(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>> {
        self.check(StoreOp::GetClaim).await?;
        Ok(self.state.read().await.claims.get(key).cloned())
    }

    async fn list_claims(
        &self,
        index: ClaimIndexName,
        value: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        self.check(StoreOp::ListClaims).await?;
        Ok(self.state.read().await.claims.lookup(index, value, namespace))
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.check(StoreOp::CreateClaim).await?;
        let mut state = self.state.write().await;
        let key = ObjectKey::of(claim);
        if state.claims.get(&key).is_some() {
            return Err(Error::already_exists("PersistentVolumeClaim", key.to_string()));
        }

        let mut created = claim.clone();
        created.metadata.uid = Some(Uuid::new_v4().to_string());
        created.metadata.resource_version = Some(state.next_version());
        state.claims.upsert(created.clone());
        state.writes.push(StoreWrite::CreateClaim(key));
        self.emit(ChangeEvent::Claim(WatchEvent::Created(created.clone())));
        Ok(created)
    }

    async fn delete_claim(&self, key: &ObjectKey) -> Result<()> {
        self.check(StoreOp::DeleteClaim).await?;
        let mut state = self.state.write().await;
        let mut removed = Vec::new();
        state.remove_claim_cascade(key, &mut removed);
        if removed.is_empty() {
            return Ok(());
        }
        state.writes.push(StoreWrite::DeleteClaim(key.clone()));
        for claim in removed {
            debug!(claim = %ObjectKey::of(&claim), "Claim deleted");
            self.emit(ChangeEvent::Claim(WatchEvent::Deleted(claim)));
        }
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        self.check(StoreOp::GetVolume).await?;
        Ok(self.state.read().await.volumes.get(name).cloned())
    }

    async fn patch_volume(&self, name: &str, patch: &Value) -> Result<PersistentVolume> {
        self.check(StoreOp::PatchVolume).await?;
        let mut state = self.state.write().await;
        let current = state
            .volumes
            .get(name)
            .ok_or_else(|| Error::not_found("PersistentVolume", name))?;

        if let Some(expected) = patch
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
        {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(Error::conflict("PersistentVolume", name, expected));
            }
        }

        let mut document = serde_json::to_value(current)?;
        merge_patch(&mut document, patch);
        let mut patched: PersistentVolume = serde_json::from_value(document)?;
        patched.metadata.resource_version = Some(state.next_version());
        state.volumes.insert(name.to_string(), patched.clone());
        state.writes.push(StoreWrite::PatchVolume {
            name: name.to_string(),
            patch: patch.clone(),
        });
        Ok(patched)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        self.check(StoreOp::GetStorageClass).await?;
        Ok(self.state.read().await.storage_classes.get(name).cloned())
    }

    async fn get_replication_destination(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ReplicationDestination>> {
        self.check(StoreOp::GetReplicationDestination).await?;
        Ok(self.state.read().await.destinations.get(key).cloned())
    }

    async fn get_snapshot(&self, key: &ObjectKey) -> Result<Option<VolumeSnapshot>> {
        self.check(StoreOp::GetSnapshot).await?;
        Ok(self.state.read().await.snapshots.get(key).cloned())
    }

    async fn update_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        self.check(StoreOp::UpdateSnapshot).await?;
        let mut state = self.state.write().await;
        let key = ObjectKey::of(snapshot);
        let current = state
            .snapshots
            .get(&key)
            .ok_or_else(|| Error::not_found("VolumeSnapshot", key.to_string()))?;

        if let Some(expected) = snapshot.metadata.resource_version.as_deref() {
            if current.metadata.resource_version.as_deref() != Some(expected) {
                return Err(Error::conflict("VolumeSnapshot", key.to_string(), expected));
            }
        }

        let mut updated = snapshot.clone();
        updated.metadata.resource_version = Some(state.next_version());
        state.snapshots.insert(key.clone(), updated.clone());
        state.writes.push(StoreWrite::UpdateSnapshot(key));
        Ok(updated)
    }
}

/// Apply a JSON merge patch (RFC 7386) in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (name, value) in entries {
            if value.is_null() {
                fields.remove(name);
            } else {
                merge_patch(fields.entry(name.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// An event captured by [`MemoryRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub claim: ObjectKey,
    pub event: PopulatorEvent,
}

/// [`EventRecorder`] keeping events in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, oldest first.
    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().await.clone()
    }

    /// Reasons of all recorded events, oldest first.
    pub async fn reasons(&self) -> Vec<EventReason> {
        self.events
            .lock()
            .await
            .iter()
            .map(|recorded| recorded.event.reason)
            .collect()
    }

    /// Number of recorded events with `reason`.
    pub async fn count(&self, reason: EventReason) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|recorded| recorded.event.reason == reason)
            .count()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(&self, claim: &PersistentVolumeClaim, event: &PopulatorEvent) {
        self.events.lock().await.push(RecordedEvent {
            claim: ObjectKey::of(claim),
            event: event.clone(),
        });
    }
}
