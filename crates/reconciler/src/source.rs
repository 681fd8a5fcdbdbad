//! Cluster watch sources.
//!
//! Raw watcher events carry no previous object and no create/update
//! distinction, so each source keeps the last seen copy of every object and
//! derives [`WatchEvent`]s from it. A relist that no longer contains an object
//! produces a delete.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use itertools::Itertools;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use volpop_core::ResultExt;

use crate::index::ClaimIndex;
use crate::resources::ReplicationDestination;
use crate::types::ObjectKey;
use crate::watch::{ChangeEvent, WatchEvent};

/// Last seen copy of every object of one kind.
#[derive(Debug)]
pub struct Tracker<K> {
    seen: HashMap<String, K>,
    relist: Option<HashSet<String>>,
}

impl<K> Default for Tracker<K> {
    fn default() -> Self {
        Self {
            seen: HashMap::new(),
            relist: None,
        }
    }
}

impl<K: Resource + Clone> Tracker<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one raw watcher event.
    pub fn translate(&mut self, event: Event<K>) -> Vec<WatchEvent<K>> {
        match event {
            Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(obj) => {
                if let Some(relist) = self.relist.as_mut() {
                    relist.insert(identity(&obj));
                }
                self.observe(obj).into_iter().collect()
            }
            Event::InitDone => {
                let Some(relist) = self.relist.take() else {
                    return Vec::new();
                };
                let gone = self
                    .seen
                    .keys()
                    .filter(|id| !relist.contains(*id))
                    .cloned()
                    .collect_vec();
                let deleted: Vec<_> = gone
                    .into_iter()
                    .filter_map(|id| self.seen.remove(&id))
                    .map(WatchEvent::Deleted)
                    .collect();
                debug!(
                    known = self.known(),
                    deleted = deleted.len(),
                    "Relist complete"
                );
                deleted
            }
            Event::Apply(obj) => self.observe(obj).into_iter().collect(),
            Event::Delete(obj) => {
                self.seen.remove(&identity(&obj));
                vec![WatchEvent::Deleted(obj)]
            }
        }
    }

    fn known(&self) -> usize {
        self.seen.len()
    }

    fn observe(&mut self, obj: K) -> Option<WatchEvent<K>> {
        match self.seen.insert(identity(&obj), obj.clone()) {
            None => Some(WatchEvent::Created(obj)),
            Some(old) if old.resource_version() == obj.resource_version() => None,
            Some(old) => Some(WatchEvent::Updated { old, new: obj }),
        }
    }
}

fn identity<K: Resource>(obj: &K) -> String {
    obj.uid().unwrap_or_else(|| ObjectKey::of(obj).to_string())
}

/// Watch one kind and derive change events.
pub fn changes<K>(api: Api<K>) -> BoxStream<'static, WatchEvent<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut tracker = Tracker::new();
    watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(|result| async move {
            result
                .map_err(|e| warn!(error = %e, "Watch error"))
                .ok()
        })
        .flat_map(move |event| stream::iter(tracker.translate(event)))
        .boxed()
}

/// Claim changes; keeps `index` in step with what the watch has seen.
pub fn claim_changes(
    api: Api<PersistentVolumeClaim>,
    index: Arc<RwLock<ClaimIndex>>,
) -> BoxStream<'static, WatchEvent<PersistentVolumeClaim>> {
    changes(api)
        .then(move |event| {
            let index = Arc::clone(&index);
            async move {
                index.write().await.apply(&event);
                event
            }
        })
        .boxed()
}

/// Replication destination changes, decoded from dynamic objects.
pub fn destination_changes(
    api: Api<DynamicObject>,
) -> BoxStream<'static, WatchEvent<ReplicationDestination>> {
    changes(api)
        .filter_map(|event| async move {
            event
                .try_map(|obj| serde_json::to_value(obj).and_then(serde_json::from_value))
                .into_option_logged()
        })
        .boxed()
}

/// Every change the populator reacts to, from the cluster.
///
/// Claims and destinations are watched in `namespace` when given, otherwise
/// cluster-wide. Storage classes are always cluster-scoped.
pub fn cluster_changes(
    client: Client,
    index: Arc<RwLock<ClaimIndex>>,
    namespace: Option<&str>,
) -> BoxStream<'static, ChangeEvent> {
    let resource = ReplicationDestination::api_resource();
    let (claims, destinations): (Api<PersistentVolumeClaim>, Api<DynamicObject>) = match namespace {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced_with(client.clone(), ns, &resource),
        ),
        None => (Api::all(client.clone()), Api::all_with(client.clone(), &resource)),
    };
    let classes: Api<StorageClass> = Api::all(client);

    debug!(namespace = namespace.unwrap_or("*"), "Starting watches");
    stream::select_all([
        claim_changes(claims, index).map(ChangeEvent::Claim).boxed(),
        destination_changes(destinations)
            .map(ChangeEvent::Destination)
            .boxed(),
        changes(classes).map(ChangeEvent::StorageClass).boxed(),
    ])
    .boxed()
}
