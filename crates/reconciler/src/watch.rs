//! Change notifications delivered by a store watch.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;

use crate::resources::ReplicationDestination;

/// One change to a watched object.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    /// The object was created (or first seen by the watch).
    Created(T),
    /// The object changed.
    Updated { old: T, new: T },
    /// The object was deleted.
    Deleted(T),
    /// A resync notification without a known change.
    Generic(T),
}

impl<T> WatchEvent<T> {
    /// The current object (the new one for updates).
    pub const fn object(&self) -> &T {
        match self {
            Self::Created(obj) | Self::Deleted(obj) | Self::Generic(obj) => obj,
            Self::Updated { new, .. } => new,
        }
    }

    /// Convert the carried objects, dropping the event if any conversion fails.
    pub fn try_map<U, E, F>(self, mut f: F) -> Result<WatchEvent<U>, E>
    where
        F: FnMut(T) -> Result<U, E>,
    {
        Ok(match self {
            Self::Created(obj) => WatchEvent::Created(f(obj)?),
            Self::Updated { old, new } => WatchEvent::Updated {
                old: f(old)?,
                new: f(new)?,
            },
            Self::Deleted(obj) => WatchEvent::Deleted(f(obj)?),
            Self::Generic(obj) => WatchEvent::Generic(f(obj)?),
        })
    }

    /// Short name for logs.
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated { .. } => "updated",
            Self::Deleted(_) => "deleted",
            Self::Generic(_) => "generic",
        }
    }
}

/// A change to any object kind the populator watches.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Claim(WatchEvent<PersistentVolumeClaim>),
    Destination(WatchEvent<ReplicationDestination>),
    StorageClass(WatchEvent<StorageClass>),
}

impl ChangeEvent {
    /// Kind of the changed object, for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Claim(_) => "PersistentVolumeClaim",
            Self::Destination(_) => "ReplicationDestination",
            Self::StorageClass(_) => "StorageClass",
        }
    }

    /// Short name of the change, for logs.
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Claim(change) => change.verb(),
            Self::Destination(change) => change.verb(),
            Self::StorageClass(change) => change.verb(),
        }
    }
}
