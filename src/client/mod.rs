//! Management-plane clients.
//!
//! ## Architecture
//!
//! - `connection`: HTTP sessions with ClickHouse servers and their error type
//! - `commander`: per-cluster command set (ping, databases, replica sync)
//! - `keeper_status`: Keeper `mntr` probe
//! - `parsing`: pure parsers for command output

pub mod commander;
pub mod connection;
pub mod keeper_status;
pub mod parsing;

pub use commander::Commander;
pub use connection::{
    CommandError, Connection, Connector, ConnectorFactory, Credentials, HttpConnector,
    HttpConnectorFactory,
};
pub use keeper_status::{KeeperMode, KeeperProbe, TcpKeeperProbe};
pub use parsing::DatabaseDescriptor;
