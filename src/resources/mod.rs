//! Resource generation module.
//!
//! Pure generators for every object a cluster owns. Nothing here talks to the
//! API server.
//!
//! ## Resources Generated
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | StatefulSet | One single-pod workload per replica |
//! | ConfigMap | Rendered server configuration per replica |
//! | Headless Service | Replica discovery (publishNotReadyAddresses) |
//! | Client Service | Client access endpoint |
//! | PodDisruptionBudget | Ensemble quorum (Keeper) or per-shard availability (ClickHouse) |
//! | Secret | Operator management credentials (ClickHouse) |

pub mod clickhouse;
pub mod common;
pub mod configmap;
pub mod keeper;
pub mod pdb;
pub mod secret;
pub mod services;
pub mod statefulset;

// Re-export commonly used items from common
pub use common::{owner_reference, standard_labels};
