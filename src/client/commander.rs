//! Administrative commander for one ClickHouse cluster.
//!
//! Holds one lazily opened connection per replica for its own lifetime and
//! closes them all in [`Commander::close`]. Every error is tagged with the
//! replica it came from.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::connection::{CommandError, Connection, Connector};
use crate::client::parsing::{
    DatabaseDescriptor, parse_databases, parse_tables, quote_identifier,
};
use crate::controller::fanout::{TaskError, execute_parallel};
use crate::crd::ClickHouseReplicaId;

const DATABASES_QUERY: &str = "SELECT name, engine_full, engine = 'Replicated' AS is_replicated \
     FROM system.databases \
     WHERE engine NOT IN ('Atomic', 'Lazy', 'SQLite', 'Ordinary') \
     SETTINGS format_display_secrets_in_show_and_select=1";

const REPLICATED_TABLES_QUERY: &str =
    "SELECT database, name FROM system.tables WHERE engine LIKE 'Replicated%'";

/// Management commands against the replicas of one cluster.
pub struct Commander {
    connector: Arc<dyn Connector>,
    connections: Mutex<BTreeMap<ClickHouseReplicaId, Arc<dyn Connection>>>,
    cancel: CancellationToken,
}

impl Commander {
    pub fn new(connector: Arc<dyn Connector>, cancel: CancellationToken) -> Self {
        Self {
            connector,
            connections: Mutex::new(BTreeMap::new()),
            cancel,
        }
    }

    async fn connection(
        &self,
        replica: ClickHouseReplicaId,
    ) -> Result<Arc<dyn Connection>, CommandError> {
        if let Some(conn) = self.connections.lock().await.get(&replica) {
            return Ok(conn.clone());
        }

        let opened = self
            .connector
            .connect(replica)
            .await
            .map_err(|e| e.for_replica(replica))?;
        let mut connections = self.connections.lock().await;
        Ok(connections.entry(replica).or_insert(opened).clone())
    }

    /// Liveness check.
    pub async fn ping(&self, replica: ClickHouseReplicaId) -> Result<(), CommandError> {
        let conn = self.connection(replica).await?;
        conn.ping().await.map_err(|e| e.for_replica(replica))
    }

    /// Non-system databases of a replica.
    pub async fn databases(
        &self,
        replica: ClickHouseReplicaId,
    ) -> Result<BTreeMap<String, DatabaseDescriptor>, CommandError> {
        let conn = self.connection(replica).await?;
        let body = conn
            .query(DATABASES_QUERY)
            .await
            .map_err(|e| e.for_replica(replica))?;
        parse_databases(&body).map_err(|e| CommandError::from(e).for_replica(replica))
    }

    /// Create `databases` on a replica, waiting for replicated ones to catch up.
    pub async fn create_databases(
        &self,
        replica: ClickHouseReplicaId,
        databases: &BTreeMap<String, DatabaseDescriptor>,
    ) -> Result<(), CommandError> {
        let conn = self.connection(replica).await?;
        for (name, descriptor) in databases {
            let database = quote_identifier(name);
            debug!(replica = %replica, database = %name, "Creating database");
            conn.execute(&format!(
                "CREATE DATABASE IF NOT EXISTS {database} ENGINE = {}",
                descriptor.engine_full
            ))
            .await
            .map_err(|e| {
                e.for_object(format!("create database {database}"))
                    .for_replica(replica)
            })?;

            if descriptor.is_replicated {
                conn.execute(&format!("SYSTEM SYNC DATABASE REPLICA {database}"))
                    .await
                    .map_err(|e| {
                        e.for_object(format!("sync database {database}"))
                            .for_replica(replica)
                    })?;
            }
        }
        Ok(())
    }

    /// Sync every replicated database and replicated table on one replica.
    ///
    /// Keeps going past individual failures and reports all of them.
    pub async fn sync_replica(&self, replica: ClickHouseReplicaId) -> Result<(), CommandError> {
        let databases = self.databases(replica).await?;
        let conn = self.connection(replica).await?;
        let mut failures = Vec::new();

        for (name, descriptor) in &databases {
            if !descriptor.is_replicated {
                continue;
            }
            debug!(replica = %replica, database = %name, "Syncing database replica");
            let database = quote_identifier(name);
            let sql = format!("SYSTEM SYNC DATABASE REPLICA {database}");
            if let Err(e) = conn.execute(&sql).await {
                failures.push(
                    e.for_object(format!("sync database {database}"))
                        .for_replica(replica),
                );
            }
        }

        let tables = match conn.query(REPLICATED_TABLES_QUERY).await {
            Ok(body) => parse_tables(&body).map_err(CommandError::from),
            Err(e) => Err(e),
        };
        match tables {
            Ok(tables) => {
                for table in tables {
                    debug!(replica = %replica, table = %table, "Syncing table replica");
                    if let Err(e) = conn
                        .execute(&format!("SYSTEM SYNC REPLICA {table} LIGHTWEIGHT"))
                        .await
                    {
                        failures.push(
                            e.for_object(format!("sync table {table}"))
                                .for_replica(replica),
                        );
                    }
                }
            }
            Err(e) => failures.push(
                e.for_object("list replicated tables")
                    .for_replica(replica),
            ),
        }

        CommandError::combine(failures).map_or(Ok(()), Err)
    }

    /// Run [`Commander::sync_replica`] on every given replica of a shard concurrently.
    pub async fn sync_shard(&self, replicas: &[ClickHouseReplicaId]) -> Result<(), CommandError> {
        let (_, error) = execute_parallel(replicas.iter().copied(), &self.cancel, |replica| {
            self.sync_replica(replica)
        })
        .await;

        match error {
            None => Ok(()),
            Some(error) => {
                let failures = error
                    .failures
                    .into_iter()
                    .map(|(replica, failure)| match failure {
                        TaskError::Cancelled => CommandError::Cancelled.for_replica(replica),
                        TaskError::Failed(e) => e,
                    })
                    .collect();
                CommandError::combine(failures).map_or(Ok(()), Err)
            }
        }
    }

    /// Close and forget every cached connection.
    pub async fn close(&self) {
        let connections = std::mem::take(&mut *self.connections.lock().await);
        for (replica, conn) in connections {
            debug!(replica = %replica, "Closing management connection");
            conn.close().await;
        }
    }
}

impl Drop for Commander {
    fn drop(&mut self) {
        if let Ok(connections) = self.connections.try_lock()
            && !connections.is_empty()
        {
            warn!(
                connections = connections.len(),
                "Commander dropped without close"
            );
        }
    }
}
