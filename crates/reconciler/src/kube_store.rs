//! Kubernetes-backed resource store and event recorder.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Event, EventSource, PersistentVolume, PersistentVolumeClaim,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::chrono::Utc;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::index::{ClaimIndex, ClaimIndexName};
use crate::resources::{ReplicationDestination, VolumeSnapshot};
use crate::store::{EventRecorder, ResourceStore};
use crate::types::{ObjectKey, PopulatorEvent};

/// Map a 404 to `None`.
fn found<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Convert a dynamic object into its typed form.
fn convert<T: Serialize, U: DeserializeOwned>(obj: &T) -> Result<U> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a typed object into a dynamic one of `resource`'s kind.
fn to_dynamic<T: Serialize>(obj: &T, resource: &ApiResource) -> Result<DynamicObject> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(fields) = value.as_object_mut() {
        fields.insert("apiVersion".to_string(), resource.api_version.clone().into());
        fields.insert("kind".to_string(), resource.kind.clone().into());
    }
    Ok(serde_json::from_value(value)?)
}

/// [`ResourceStore`] talking to the API server.
///
/// Point reads go to the API server; index lookups are answered from a claim
/// cache that the claim watch keeps current.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    claims: Arc<RwLock<ClaimIndex>>,
}

impl KubeStore {
    /// Create a store with an empty claim cache.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            claims: Arc::new(RwLock::new(ClaimIndex::new())),
        }
    }

    /// Shared claim cache; feed it from the claim watch.
    pub fn claim_index(&self) -> Arc<RwLock<ClaimIndex>> {
        Arc::clone(&self.claims)
    }

    fn destinations(&self, namespace: &str) -> (Api<DynamicObject>, ApiResource) {
        let resource = ReplicationDestination::api_resource();
        (
            Api::namespaced_with(self.client.clone(), namespace, &resource),
            resource,
        )
    }

    fn snapshots(&self, namespace: &str) -> (Api<DynamicObject>, ApiResource) {
        let resource = VolumeSnapshot::api_resource();
        (
            Api::namespaced_with(self.client.clone(), namespace, &resource),
            resource,
        )
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_claim(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &key.namespace);
        found(api.get(&key.name).await)
    }

    async fn list_claims(
        &self,
        index: ClaimIndexName,
        value: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self.claims.read().await.lookup(index, value, namespace))
    }

    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = claim.namespace().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), claim).await?)
    }

    async fn delete_claim(&self, key: &ObjectKey) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(claim = %key, "Claim already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        found(api.get(name).await)
    }

    async fn patch_volume(
        &self,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        found(api.get(name).await)
    }

    async fn get_replication_destination(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<ReplicationDestination>> {
        let (api, _) = self.destinations(&key.namespace);
        found(api.get(&key.name).await)?
            .map(|obj| convert(&obj))
            .transpose()
    }

    async fn get_snapshot(&self, key: &ObjectKey) -> Result<Option<VolumeSnapshot>> {
        let (api, _) = self.snapshots(&key.namespace);
        found(api.get(&key.name).await)?
            .map(|obj| convert(&obj))
            .transpose()
    }

    async fn update_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        let (api, resource) = self.snapshots(&snapshot.namespace().unwrap_or_default());
        let object = to_dynamic(snapshot, &resource)?;
        let replaced = api
            .replace(&snapshot.name_any(), &PostParams::default(), &object)
            .await?;
        convert(&replaced)
    }
}

/// [`EventRecorder`] creating core/v1 events next to the claim.
pub struct KubeRecorder {
    client: Client,
    component: String,
}

impl KubeRecorder {
    /// Create a recorder reporting as `component`.
    pub fn new(client: Client, component: impl Into<String>) -> Self {
        Self {
            client,
            component: component.into(),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeRecorder {
    async fn record(&self, claim: &PersistentVolumeClaim, event: &PopulatorEvent) {
        let namespace = claim.namespace().unwrap_or_default();
        let now = Time(Utc::now());
        let k8s_event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", claim.name_any())),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            involved_object: claim.object_ref(&()),
            reason: Some(event.reason.as_str().to_string()),
            message: Some(event.message.clone()),
            type_: Some(event.event_type.as_str().to_string()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            source: Some(EventSource {
                component: Some(self.component.clone()),
                host: None,
            }),
            reporting_component: Some(self.component.clone()),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(e) = api.create(&PostParams::default(), &k8s_event).await {
            warn!(
                error = %e,
                claim = %ObjectKey::of(claim),
                reason = %event.reason,
                "Failed to record event"
            );
        }
    }
}
