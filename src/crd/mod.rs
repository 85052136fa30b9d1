//! Custom Resource Definitions (CRDs) for clickhouse-operator.
//!
//! - `KeeperCluster`: ClickHouse Keeper coordination ensemble
//! - `ClickHouseCluster`: sharded, replicated ClickHouse servers

mod clickhouse_cluster;
mod common;
mod keeper_cluster;

pub use clickhouse_cluster::*;
pub use common::*;
pub use keeper_cluster::*;
