//! Volume populator reconciliation.
//!
//! A claim whose data source refers to a replication destination is filled
//! from the destination's latest snapshot: a shadow claim restores the
//! snapshot, and once the shadow is bound its volume is handed over to the
//! original claim.
//!
//! - [`Reconciler`]: one idempotent pass over a claim.
//! - [`PopulatorLoop`]: change-driven work queue running passes concurrently.
//! - [`ResourceStore`] / [`EventRecorder`]: seams to the cluster, with
//!   [`KubeStore`] for a real cluster and [`InMemoryStore`] for tests.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod index;
pub mod kube_store;
pub mod r#loop;
pub mod mappers;
pub mod memory;
pub mod predicates;
pub mod rebind;
pub mod reconciler;
pub mod resources;
pub mod shadow;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod types;
pub mod watch;

pub use error::{Error, Result};
pub use index::{ClaimIndex, ClaimIndexName};
pub use kube_store::{KubeRecorder, KubeStore};
pub use r#loop::{LoopConfig, LoopStats, LoopStopper, PopulatorLoop};
pub use memory::{InMemoryStore, MemoryRecorder, StoreOp, StoreWrite};
pub use reconciler::{Reconciler, ReconcilerBuilder, ReconcilerConfig};
pub use resources::{ReplicationDestination, VolumeSnapshot};
pub use source::cluster_changes;
pub use store::{EventRecorder, ResourceStore, TracingRecorder};
pub use types::{EventReason, EventType, ObjectKey, PopulatorEvent, ReconcileOutcome};
pub use watch::{ChangeEvent, WatchEvent};
