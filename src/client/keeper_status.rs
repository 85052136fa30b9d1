//! Keeper server mode probe.
//!
//! Sends the `mntr` four-letter command over the Keeper client port and reads
//! `zk_server_state` from the reply.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::client::connection::{CommandError, STATUS_REQUEST_TIMEOUT};
use crate::client::parsing::{ParseError, parse_mntr};

/// Keeper client port.
pub const KEEPER_CLIENT_PORT: u16 = 9181;

/// Mode a Keeper server reports about itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeeperMode {
    Leader,
    Follower,
    Standalone,
    Other(String),
}

impl KeeperMode {
    pub fn parse(state: &str) -> Self {
        match state {
            "leader" => KeeperMode::Leader,
            "follower" => KeeperMode::Follower,
            "standalone" => KeeperMode::Standalone,
            other => KeeperMode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for KeeperMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeeperMode::Leader => f.write_str("leader"),
            KeeperMode::Follower => f.write_str("follower"),
            KeeperMode::Standalone => f.write_str("standalone"),
            KeeperMode::Other(other) => f.write_str(other),
        }
    }
}

/// Reports the mode of a Keeper server.
#[async_trait]
pub trait KeeperProbe: Send + Sync {
    async fn server_mode(&self, hostname: &str) -> Result<KeeperMode, CommandError>;
}

/// [`KeeperProbe`] over a plain TCP connection.
#[derive(Clone, Debug)]
pub struct TcpKeeperProbe {
    pub port: u16,
    pub timeout: Duration,
}

impl Default for TcpKeeperProbe {
    fn default() -> Self {
        Self {
            port: KEEPER_CLIENT_PORT,
            timeout: STATUS_REQUEST_TIMEOUT,
        }
    }
}

impl TcpKeeperProbe {
    async fn mntr(&self, hostname: &str) -> Result<String, CommandError> {
        let mut stream = TcpStream::connect((hostname, self.port)).await?;
        stream.write_all(b"mntr").await?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok(reply)
    }
}

#[async_trait]
impl KeeperProbe for TcpKeeperProbe {
    #[instrument(skip(self))]
    async fn server_mode(&self, hostname: &str) -> Result<KeeperMode, CommandError> {
        let reply = tokio::time::timeout(self.timeout, self.mntr(hostname))
            .await
            .map_err(|_| CommandError::Timeout {
                operation: format!("mntr {hostname}"),
                duration: self.timeout,
            })??;

        let state = parse_mntr(&reply)
            .remove("zk_server_state")
            .ok_or_else(|| ParseError::MissingField("zk_server_state".to_string()))?;
        debug!(hostname = %hostname, state = %state, "Keeper server state");
        Ok(KeeperMode::parse(&state))
    }
}
