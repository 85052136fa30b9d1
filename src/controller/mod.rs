//! Controller module for clickhouse-operator.
//!
//! Contains the reconciliation passes for both cluster kinds and the
//! building blocks they share.
//!
//! This module supports two controllers:
//! - KeeperCluster controller (`keeper`)
//! - ClickHouseCluster controller (`clickhouse`)

// Shared modules
pub mod context;
pub mod error;
pub mod fanout;
pub mod reconciler;
pub mod replica;
pub mod resource;
pub mod retry;
pub mod revision;
pub mod rollout;
pub mod status;
pub mod store;

// Per-kind controllers
pub mod clickhouse;
pub mod keeper;
