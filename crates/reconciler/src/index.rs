//! Secondary indexes over populator claims.
//!
//! Two lookup tables are kept: claims by referenced replication destination
//! and claims by storage class name. Only claims whose data source refers to a
//! replication destination are ever indexed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;

use crate::types::{ObjectKey, destination_name, has_replication_destination_source, storage_class_name};
use crate::watch::WatchEvent;

/// Named secondary index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimIndexName {
    /// Claims keyed by the name of their replication destination.
    ReplicationDestination,
    /// Claims keyed by their storage class name.
    StorageClass,
}

impl ClaimIndexName {
    /// Registered index name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReplicationDestination => "volPopPvc.spec.dataSourceRef.Name",
            Self::StorageClass => "volPopPvc.spec.storageClassName",
        }
    }
}

/// Index values of a claim; empty unless the claim passes the data-source check.
pub fn index_values(index: ClaimIndexName, claim: &PersistentVolumeClaim) -> Vec<String> {
    if !has_replication_destination_source(claim) {
        return Vec::new();
    }
    let value = match index {
        ClaimIndexName::ReplicationDestination => destination_name(claim),
        ClaimIndexName::StorageClass => storage_class_name(claim),
    };
    value
        .filter(|v| !v.is_empty())
        .map(|v| vec![v.to_string()])
        .unwrap_or_default()
}

type Table = HashMap<String, BTreeSet<ObjectKey>>;

/// Claim cache with incrementally maintained secondary indexes.
///
/// `entries` records where each claim was indexed, so re-indexing one claim
/// only touches its own entries.
#[derive(Debug, Default, Clone)]
pub struct ClaimIndex {
    claims: BTreeMap<ObjectKey, PersistentVolumeClaim>,
    by_destination: Table,
    by_storage_class: Table,
    entries: HashMap<ObjectKey, Vec<(ClaimIndexName, String)>>,
}

impl ClaimIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a claim, re-indexing it.
    pub fn upsert(&mut self, claim: PersistentVolumeClaim) {
        let key = ObjectKey::of(&claim);
        self.unindex(&key);
        let mut entries = Vec::new();
        for index in [ClaimIndexName::ReplicationDestination, ClaimIndexName::StorageClass] {
            for value in index_values(index, &claim) {
                self.table_mut(index)
                    .entry(value.clone())
                    .or_default()
                    .insert(key.clone());
                entries.push((index, value));
            }
        }
        if !entries.is_empty() {
            self.entries.insert(key.clone(), entries);
        }
        self.claims.insert(key, claim);
    }

    /// Remove a claim, returning it if it was present.
    pub fn remove(&mut self, key: &ObjectKey) -> Option<PersistentVolumeClaim> {
        self.unindex(key);
        self.claims.remove(key)
    }

    /// Claim by key.
    pub fn get(&self, key: &ObjectKey) -> Option<&PersistentVolumeClaim> {
        self.claims.get(key)
    }

    /// Claims indexed under `value`, optionally restricted to one namespace.
    pub fn lookup(
        &self,
        index: ClaimIndexName,
        value: &str,
        namespace: Option<&str>,
    ) -> Vec<PersistentVolumeClaim> {
        self.table(index)
            .get(value)
            .into_iter()
            .flatten()
            .filter(|key| namespace.is_none_or(|ns| key.namespace == ns))
            .filter_map(|key| self.claims.get(key))
            .cloned()
            .collect()
    }

    /// Claims owned by the object with the given UID.
    pub fn owned_by(&self, uid: &str) -> Vec<PersistentVolumeClaim> {
        self.claims
            .values()
            .filter(|claim| claim.owner_references().iter().any(|owner| owner.uid == uid))
            .cloned()
            .collect()
    }

    /// All cached claims.
    pub fn claims(&self) -> impl Iterator<Item = &PersistentVolumeClaim> {
        self.claims.values()
    }

    /// Number of cached claims.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Apply a watch event to the cache.
    pub fn apply(&mut self, event: &WatchEvent<PersistentVolumeClaim>) {
        match event {
            WatchEvent::Deleted(claim) => {
                self.remove(&ObjectKey::of(claim));
            }
            WatchEvent::Created(claim) | WatchEvent::Generic(claim) => self.upsert(claim.clone()),
            WatchEvent::Updated { new, .. } => self.upsert(new.clone()),
        }
    }

    const fn table(&self, index: ClaimIndexName) -> &Table {
        match index {
            ClaimIndexName::ReplicationDestination => &self.by_destination,
            ClaimIndexName::StorageClass => &self.by_storage_class,
        }
    }

    const fn table_mut(&mut self, index: ClaimIndexName) -> &mut Table {
        match index {
            ClaimIndexName::ReplicationDestination => &mut self.by_destination,
            ClaimIndexName::StorageClass => &mut self.by_storage_class,
        }
    }

    fn unindex(&mut self, key: &ObjectKey) {
        let Some(entries) = self.entries.remove(key) else {
            return;
        };
        for (index, value) in entries {
            let table = self.table_mut(index);
            if let Some(keys) = table.get_mut(&value) {
                keys.remove(key);
                if keys.is_empty() {
                    table.remove(&value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, TypedObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use proptest::prelude::*;

    use super::*;

    fn values(index: &ClaimIndex, which: ClaimIndexName) -> BTreeSet<String> {
        index.table(which).keys().cloned().collect()
    }

    fn claim(namespace: &str, name: &str, rd: Option<&str>, class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                data_source_ref: rd.map(|rd| TypedObjectReference {
                    api_group: Some("volsync.backube".to_string()),
                    kind: "ReplicationDestination".to_string(),
                    name: rd.to_string(),
                    namespace: None,
                }),
                storage_class_name: class.map(ToString::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_index_names() {
        assert_eq!(
            ClaimIndexName::ReplicationDestination.as_str(),
            "volPopPvc.spec.dataSourceRef.Name"
        );
        assert_eq!(
            ClaimIndexName::StorageClass.as_str(),
            "volPopPvc.spec.storageClassName"
        );
    }

    #[test]
    fn test_claims_without_destination_are_not_indexed() {
        let plain = claim("apps", "plain", None, Some("fast"));
        assert!(index_values(ClaimIndexName::StorageClass, &plain).is_empty());

        let mut index = ClaimIndex::new();
        index.upsert(plain);
        assert_eq!(index.len(), 1);
        assert!(index.lookup(ClaimIndexName::StorageClass, "fast", None).is_empty());
    }

    #[test]
    fn test_lookup_by_destination_respects_namespace() {
        let mut index = ClaimIndex::new();
        index.upsert(claim("apps", "a", Some("rd1"), Some("fast")));
        index.upsert(claim("other", "b", Some("rd1"), Some("fast")));

        let in_apps = index.lookup(ClaimIndexName::ReplicationDestination, "rd1", Some("apps"));
        assert_eq!(in_apps.len(), 1);
        assert_eq!(in_apps.first().map(ResourceExt::name_any).as_deref(), Some("a"));

        let everywhere = index.lookup(ClaimIndexName::StorageClass, "fast", None);
        assert_eq!(everywhere.len(), 2);
    }

    #[test]
    fn test_upsert_moves_claim_between_values() {
        let mut index = ClaimIndex::new();
        index.upsert(claim("apps", "a", Some("rd1"), Some("slow")));
        index.upsert(claim("apps", "a", Some("rd2"), Some("fast")));

        assert!(index.lookup(ClaimIndexName::ReplicationDestination, "rd1", None).is_empty());
        assert!(index.lookup(ClaimIndexName::StorageClass, "slow", None).is_empty());
        assert_eq!(index.lookup(ClaimIndexName::ReplicationDestination, "rd2", None).len(), 1);
        assert_eq!(
            values(&index, ClaimIndexName::StorageClass),
            BTreeSet::from(["fast".to_string()])
        );
    }

    #[test]
    fn test_apply_delete_removes_claim() {
        let mut index = ClaimIndex::new();
        let c = claim("apps", "a", Some("rd1"), None);
        index.apply(&WatchEvent::Created(c.clone()));
        assert_eq!(index.len(), 1);

        index.apply(&WatchEvent::Deleted(c));
        assert!(index.is_empty());
        assert!(values(&index, ClaimIndexName::ReplicationDestination).is_empty());
        assert!(index.entries.is_empty());
    }

    /// Given many indexed claims
    /// When one of them is updated
    /// Then only that claim's entries change
    #[test]
    fn test_upsert_only_touches_own_entries() {
        let mut index = ClaimIndex::new();
        for n in 0..50 {
            index.upsert(claim("apps", &format!("c{n}"), Some("rd1"), Some("fast")));
        }
        index.upsert(claim("apps", "c7", Some("rd2"), None));

        assert_eq!(index.lookup(ClaimIndexName::ReplicationDestination, "rd1", None).len(), 49);
        assert_eq!(index.lookup(ClaimIndexName::StorageClass, "fast", None).len(), 49);
        assert_eq!(
            index.entries.get(&ObjectKey::new("apps", "c7")),
            Some(&vec![(ClaimIndexName::ReplicationDestination, "rd2".to_string())])
        );

        index.upsert(claim("apps", "c7", None, Some("fast")));
        assert!(!index.entries.contains_key(&ObjectKey::new("apps", "c7")));
        assert!(index.lookup(ClaimIndexName::ReplicationDestination, "rd2", None).is_empty());
        assert_eq!(index.entries.len(), 49);
    }

    proptest! {
        /// Index contents always match a from-scratch rebuild of the cache.
        #[test]
        fn prop_index_matches_rebuild(
            ops in prop::collection::vec(
                (0usize..4, prop::option::of(0usize..3), prop::option::of(0usize..3), any::<bool>()),
                0..40,
            )
        ) {
            let mut index = ClaimIndex::new();
            for (n, rd, class, delete) in ops {
                let name = format!("c{n}");
                if delete {
                    index.remove(&ObjectKey::new("apps", name));
                } else {
                    let rd = rd.map(|i| format!("rd{i}"));
                    let class = class.map(|i| format!("sc{i}"));
                    index.upsert(claim("apps", &name, rd.as_deref(), class.as_deref()));
                }
            }

            let mut rebuilt = ClaimIndex::new();
            for c in index.claims() {
                rebuilt.upsert(c.clone());
            }
            for which in [ClaimIndexName::ReplicationDestination, ClaimIndexName::StorageClass] {
                prop_assert_eq!(values(&index, which), values(&rebuilt, which));
                for value in values(&index, which) {
                    let mut got: Vec<_> = index.lookup(which, &value, None).iter().map(ObjectKey::of).collect();
                    let mut want: Vec<_> = rebuilt.lookup(which, &value, None).iter().map(ObjectKey::of).collect();
                    got.sort();
                    want.sort();
                    prop_assert_eq!(got, want);
                }
            }
            prop_assert_eq!(&index.entries, &rebuilt.entries);
        }
    }
}
