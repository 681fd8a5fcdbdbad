//! Snapshot guard: protect consumed snapshots from upstream cleanup.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::resources::VolumeSnapshot;
use crate::store::ResourceStore;
use crate::types::{LABEL_DO_NOT_DELETE, ObjectKey};

/// Add the do-not-delete label to `snapshot`. Returns whether it changed.
pub fn mark_do_not_delete(snapshot: &mut VolumeSnapshot) -> bool {
    let labels = snapshot.metadata.labels.get_or_insert_with(Default::default);
    if labels.get(LABEL_DO_NOT_DELETE).map(String::as_str) == Some("true") {
        return false;
    }
    labels.insert(LABEL_DO_NOT_DELETE.to_string(), "true".to_string());
    true
}

/// Fetch the snapshot and mark it protected if it is not yet.
///
/// A missing snapshot is an error: nothing watches snapshots, so the claim is
/// retried with backoff until it shows up.
pub async fn protect_snapshot(store: &dyn ResourceStore, key: &ObjectKey) -> Result<VolumeSnapshot> {
    let mut snapshot = store
        .get_snapshot(key)
        .await?
        .ok_or_else(|| Error::snapshot_missing(&key.namespace, &key.name))?;

    if !mark_do_not_delete(&mut snapshot) {
        debug!(snapshot = %key, "Snapshot already protected");
        return Ok(snapshot);
    }

    let updated = store.update_snapshot(&snapshot).await?;
    info!(snapshot = %key, "Snapshot marked do-not-delete");
    Ok(updated)
}
