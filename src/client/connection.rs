//! Management connections to ClickHouse servers.
//!
//! Commands go over the ClickHouse HTTP interface. A [`Connector`] opens
//! connections to the replicas of one cluster; a [`ConnectorFactory`] builds
//! connectors per cluster so tests can replace the network entirely.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::crd::{ClickHouseCluster, ClickHouseReplicaId};

/// HTTP interface port of ClickHouse servers.
pub const HTTP_PORT: u16 = 8123;
/// Deadline for every management request.
pub const STATUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from management commands.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] crate::client::parsing::ParseError),

    #[error("cancelled")]
    Cancelled,

    #[error("{object}: {source}")]
    Object {
        object: String,
        #[source]
        source: Box<CommandError>,
    },

    #[error("for replica {replica}: {source}")]
    Replica {
        replica: String,
        #[source]
        source: Box<CommandError>,
    },

    #[error("{}", CommandFailures(.0))]
    Multiple(Vec<CommandError>),
}

impl CommandError {
    /// Tag the error with the replica it came from.
    pub fn for_replica(self, replica: impl fmt::Display) -> Self {
        CommandError::Replica {
            replica: replica.to_string(),
            source: Box::new(self),
        }
    }

    /// Name the database or table a command was working on.
    pub fn for_object(self, object: impl fmt::Display) -> Self {
        CommandError::Object {
            object: object.to_string(),
            source: Box::new(self),
        }
    }

    /// Fold several failures into one. `None` when there were none.
    pub fn combine(mut errors: Vec<CommandError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(CommandError::Multiple(errors)),
        }
    }
}

struct CommandFailures<'a>(&'a [CommandError]);

impl fmt::Display for CommandFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} command(s) failed:", self.0.len())?;
        for error in self.0 {
            write!(f, " [{error}]")?;
        }
        Ok(())
    }
}

/// An open management session with one server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Liveness check.
    async fn ping(&self) -> Result<(), CommandError>;

    /// Run a query and return its rows as `JSONEachRow` text.
    async fn query(&self, sql: &str) -> Result<String, CommandError>;

    /// Run a statement that returns no rows.
    async fn execute(&self, sql: &str) -> Result<(), CommandError>;

    /// Release the session. The default does nothing.
    async fn close(&self) {}
}

/// Opens connections to the replicas of one cluster.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        replica: ClickHouseReplicaId,
    ) -> Result<Arc<dyn Connection>, CommandError>;
}

/// Credentials of the operator's management user.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Builds a [`Connector`] for a cluster.
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, cluster: &ClickHouseCluster, credentials: Credentials)
    -> Arc<dyn Connector>;
}

/// [`ConnectorFactory`] over the HTTP interface.
#[derive(Clone, Default)]
pub struct HttpConnectorFactory {
    client: reqwest::Client,
}

impl ConnectorFactory for HttpConnectorFactory {
    fn connector(
        &self,
        cluster: &ClickHouseCluster,
        credentials: Credentials,
    ) -> Arc<dyn Connector> {
        Arc::new(HttpConnector {
            client: self.client.clone(),
            cluster: cluster.clone(),
            credentials,
            timeout: STATUS_REQUEST_TIMEOUT,
        })
    }
}

/// Connects to replicas by their stable hostname.
pub struct HttpConnector {
    client: reqwest::Client,
    cluster: ClickHouseCluster,
    credentials: Credentials,
    timeout: Duration,
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        replica: ClickHouseReplicaId,
    ) -> Result<Arc<dyn Connection>, CommandError> {
        let base_url = format!("http://{}:{}", self.cluster.hostname(replica), HTTP_PORT);
        debug!(replica = %replica, url = %base_url, "Opening management connection");
        Ok(Arc::new(HttpConnection {
            client: self.client.clone(),
            base_url,
            credentials: self.credentials.clone(),
            timeout: self.timeout,
        }))
    }
}

/// One server's HTTP interface.
pub struct HttpConnection {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
    timeout: Duration,
}

impl HttpConnection {
    async fn post(&self, url: &str, sql: &str) -> Result<String, CommandError> {
        let response = self
            .client
            .post(url)
            .header("X-ClickHouse-User", &self.credentials.user)
            .header("X-ClickHouse-Key", &self.credentials.password)
            .timeout(self.timeout)
            .body(sql.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CommandError::Server {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Connection for HttpConnection {
    #[instrument(skip(self), fields(url = %self.base_url))]
    async fn ping(&self) -> Result<(), CommandError> {
        let response = self
            .client
            .get(format!("{}/ping", self.base_url))
            .timeout(self.timeout)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CommandError::Server {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(url = %self.base_url))]
    async fn query(&self, sql: &str) -> Result<String, CommandError> {
        let url = format!("{}/?default_format=JSONEachRow", self.base_url);
        self.post(&url, sql).await
    }

    #[instrument(skip(self), fields(url = %self.base_url))]
    async fn execute(&self, sql: &str) -> Result<(), CommandError> {
        self.post(&format!("{}/", self.base_url), sql).await?;
        Ok(())
    }
}
