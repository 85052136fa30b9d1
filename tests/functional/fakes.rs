//! In-memory stand-ins for the API server and the management plane.
//!
//! [`MemoryStore`] behaves like a namespaced API: it assigns resource
//! versions and generations, rejects stale replaces with 409, and filters
//! lists by equality label selectors. [`FakeKeeper`] and [`FakeClickHouse`]
//! answer probes and commands from per-replica state the test controls.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerState, ContainerStateWaiting, ContainerStatus, Pod, PodStatus, Secret,
    Service,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;

use clickhouse_operator::client::{
    CommandError, Connection, Connector, ConnectorFactory, Credentials, KeeperMode, KeeperProbe,
};
use clickhouse_operator::controller::context::Backends;
use clickhouse_operator::controller::retry::RetryConfig;
use clickhouse_operator::controller::store::{ObjectStore, Stores};
use clickhouse_operator::crd::{
    ClickHouseCluster, ClickHouseReplicaId, ClusterObject, KeeperCluster, KeeperReplicaId,
    ReplicaId,
};
use clickhouse_operator::resources::common::replica_object_name;
use clickhouse_operator::resources::statefulset::replica_selector;

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

/// Namespaced object store kept in memory.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    next_version: AtomicU32,
    writes: AtomicUsize,
    /// Upcoming replaces that fail with 409 regardless of version.
    conflicts: AtomicU32,
    /// Names whose creates and replaces fail with 500.
    unavailable: Mutex<BTreeSet<String>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            next_version: AtomicU32::new(1),
            writes: AtomicUsize::new(0),
            conflicts: AtomicU32::new(0),
            unavailable: Mutex::new(BTreeSet::new()),
        }
    }
}

impl<K: Resource + Clone> MemoryStore<K> {
    fn version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Insert or overwrite an object directly, as another client would.
    pub fn put(&self, mut obj: K) {
        let name = obj.name_any();
        obj.meta_mut().resource_version = Some(self.version());
        self.objects.lock().unwrap().insert(name, obj);
    }

    /// Rewrite a stored object in place without counting it as a write.
    pub fn modify(&self, name: &str, change: impl FnOnce(&mut K)) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.get_mut(name).expect("object to modify");
        change(obj);
        obj.meta_mut().resource_version = Some(self.version());
    }

    pub fn fetch(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Creates and replaces accepted so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_next_replaces(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    /// Fail every write to `name` until [`MemoryStore::restore`].
    pub fn fail_writes(&self, name: &str) {
        self.unavailable.lock().unwrap().insert(name.to_string());
    }

    pub fn restore(&self, name: &str) {
        self.unavailable.lock().unwrap().remove(name);
    }

    fn check_available(&self, name: &str) -> Result<(), kube::Error> {
        if self.unavailable.lock().unwrap().contains(name) {
            return Err(api_error(500, "InternalError", format!("{name}: etcd unavailable")));
        }
        Ok(())
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>, kube::Error> {
        Ok(self.fetch(name))
    }

    async fn create(&self, obj: &K) -> Result<K, kube::Error> {
        let name = obj.name_any();
        self.check_available(&name)?;
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")));
        }
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(self.version());
        stored.meta_mut().generation = Some(1);
        objects.insert(name, stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K, kube::Error> {
        self.check_available(name)?;
        if self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(api_error(409, "Conflict", format!("{name} was modified")));
        }

        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get(name) else {
            return Err(api_error(404, "NotFound", format!("{name} not found")));
        };
        if obj.meta().resource_version != current.meta().resource_version {
            return Err(api_error(409, "Conflict", format!("{name} was modified")));
        }
        let generation = current.meta().generation.unwrap_or_default() + 1;
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = Some(self.version());
        stored.meta_mut().generation = Some(generation);
        objects.insert(name.to_string(), stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        self.objects.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<K>, kube::Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|obj| matches_selector(obj.labels(), label_selector))
            .cloned()
            .collect())
    }
}

/// Keeper probe answering from a hostname table. Unknown hosts refuse.
#[derive(Default)]
pub struct FakeKeeper {
    modes: Mutex<HashMap<String, KeeperMode>>,
}

impl FakeKeeper {
    pub fn set_mode(&self, hostname: String, mode: KeeperMode) {
        self.modes.lock().unwrap().insert(hostname, mode);
    }

    pub fn clear(&self) {
        self.modes.lock().unwrap().clear();
    }
}

#[async_trait]
impl KeeperProbe for FakeKeeper {
    async fn server_mode(&self, hostname: &str) -> Result<KeeperMode, CommandError> {
        self.modes
            .lock()
            .unwrap()
            .get(hostname)
            .cloned()
            .ok_or_else(|| {
                CommandError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("{hostname} refused"),
                ))
            })
    }
}

/// One simulated ClickHouse server.
#[derive(Clone, Debug, Default)]
pub struct FakeServer {
    pub up: bool,
    /// name -> (engine_full, is_replicated)
    pub databases: BTreeMap<String, (String, bool)>,
    pub executed: Vec<String>,
    /// Statements starting with any of these fail with a server error.
    pub rejects: Vec<String>,
}

/// Management plane of every ClickHouse server in the test.
#[derive(Default)]
pub struct FakeClickHouse {
    servers: Mutex<BTreeMap<ClickHouseReplicaId, FakeServer>>,
    credentials: Mutex<Vec<Credentials>>,
    closed: AtomicUsize,
}

impl FakeClickHouse {
    pub fn start(&self, id: ClickHouseReplicaId) {
        self.servers.lock().unwrap().entry(id).or_default().up = true;
    }

    pub fn stop(&self, id: ClickHouseReplicaId) {
        self.servers.lock().unwrap().entry(id).or_default().up = false;
    }

    pub fn add_database(&self, id: ClickHouseReplicaId, name: &str, engine: &str) {
        self.servers.lock().unwrap().entry(id).or_default().databases.insert(
            name.to_string(),
            (engine.to_string(), engine.starts_with("Replicated")),
        );
    }

    /// Make `id` reject statements starting with `prefix`.
    pub fn reject(&self, id: ClickHouseReplicaId, prefix: &str) {
        self.servers
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .rejects
            .push(prefix.to_string());
    }

    pub fn server(&self, id: ClickHouseReplicaId) -> FakeServer {
        self.servers
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Credentials handed to every connector built so far.
    pub fn credentials(&self) -> Vec<Credentials> {
        self.credentials.lock().unwrap().clone()
    }

    pub fn closed_connections(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory handing out connectors onto a shared [`FakeClickHouse`].
pub struct FakeConnectorFactory(pub Arc<FakeClickHouse>);

impl ConnectorFactory for FakeConnectorFactory {
    fn connector(
        &self,
        _cluster: &ClickHouseCluster,
        credentials: Credentials,
    ) -> Arc<dyn Connector> {
        self.0.credentials.lock().unwrap().push(credentials);
        Arc::new(FakeConnector(self.0.clone()))
    }
}

struct FakeConnector(Arc<FakeClickHouse>);

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        replica: ClickHouseReplicaId,
    ) -> Result<Arc<dyn Connection>, CommandError> {
        Ok(Arc::new(FakeConnection {
            plane: self.0.clone(),
            replica,
        }))
    }
}

struct FakeConnection {
    plane: Arc<FakeClickHouse>,
    replica: ClickHouseReplicaId,
}

impl FakeConnection {
    fn with_server<T>(
        &self,
        f: impl FnOnce(&mut FakeServer) -> T,
    ) -> Result<T, CommandError> {
        let mut servers = self.plane.servers.lock().unwrap();
        match servers.get_mut(&self.replica) {
            Some(server) if server.up => Ok(f(server)),
            _ => Err(CommandError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "server down",
            ))),
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn ping(&self) -> Result<(), CommandError> {
        self.with_server(|_| ())
    }

    async fn query(&self, sql: &str) -> Result<String, CommandError> {
        self.with_server(|server| {
            if !sql.contains("system.databases") {
                return String::new();
            }
            server
                .databases
                .iter()
                .map(|(name, (engine, replicated))| {
                    serde_json::json!({
                        "name": name,
                        "engine_full": engine,
                        "is_replicated": u8::from(*replicated),
                    })
                    .to_string()
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    async fn execute(&self, sql: &str) -> Result<(), CommandError> {
        self.with_server(|server| {
            server.executed.push(sql.to_string());
            if server.rejects.iter().any(|prefix| sql.starts_with(prefix)) {
                return Err(CommandError::Server {
                    status: 500,
                    body: "Code: 243. NOT_ENOUGH_SPACE".to_string(),
                });
            }
            if let Some(rest) = sql.strip_prefix("CREATE DATABASE IF NOT EXISTS ")
                && let Some((name, engine)) = rest.split_once(" ENGINE = ")
            {
                server.databases.insert(
                    name.trim_matches('`').to_string(),
                    (engine.to_string(), engine.starts_with("Replicated")),
                );
            }
            Ok(())
        })?
    }

    async fn close(&self) {
        self.plane.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// One namespace worth of fake API server plus the management plane.
pub struct World {
    pub statefulsets: Arc<MemoryStore<StatefulSet>>,
    pub config_maps: Arc<MemoryStore<ConfigMap>>,
    pub services: Arc<MemoryStore<Service>>,
    pub pdbs: Arc<MemoryStore<PodDisruptionBudget>>,
    pub secrets: Arc<MemoryStore<Secret>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub keeper_clusters: Arc<MemoryStore<KeeperCluster>>,
    pub keeper: Arc<FakeKeeper>,
    pub clickhouse: Arc<FakeClickHouse>,
    pub cancel: CancellationToken,
}

impl World {
    pub fn new() -> Self {
        Self {
            statefulsets: Arc::default(),
            config_maps: Arc::default(),
            services: Arc::default(),
            pdbs: Arc::default(),
            secrets: Arc::default(),
            pods: Arc::default(),
            keeper_clusters: Arc::default(),
            keeper: Arc::default(),
            clickhouse: Arc::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            stores: Stores {
                statefulsets: self.statefulsets.clone(),
                config_maps: self.config_maps.clone(),
                services: self.services.clone(),
                pod_disruption_budgets: self.pdbs.clone(),
                secrets: self.secrets.clone(),
                pods: self.pods.clone(),
                keeper_clusters: self.keeper_clusters.clone(),
            },
            keeper_probe: self.keeper.clone(),
            connectors: Arc::new(FakeConnectorFactory(self.clickhouse.clone())),
            retry: RetryConfig::immediate(3),
        }
    }

    /// Let every StatefulSet catch up with its latest generation.
    pub fn mark_all_ready(&self) {
        for name in self.statefulsets.names() {
            self.statefulsets.modify(&name, |sts| {
                sts.status = Some(StatefulSetStatus {
                    observed_generation: sts.metadata.generation,
                    replicas: 1,
                    ready_replicas: Some(1),
                    ..Default::default()
                });
            });
        }
    }

    /// Add a pod for `id` whose container waits on `reason`.
    pub fn fail_pod<C: ClusterObject, Id: ReplicaId>(&self, cluster: &C, id: Id, reason: &str) {
        self.pods.put(Pod {
            metadata: ObjectMeta {
                name: Some(format!("{}-0", replica_object_name(cluster, &id))),
                labels: Some(replica_selector(cluster, &id)),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "server".to_string(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some(reason.to_string()),
                            message: None,
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    /// Report `modes[i]` for Keeper member `i`.
    pub fn set_keeper_modes(&self, cluster: &KeeperCluster, modes: &[KeeperMode]) {
        self.keeper.clear();
        for (index, mode) in modes.iter().enumerate() {
            let id = KeeperReplicaId(i32::try_from(index).unwrap());
            self.keeper.set_mode(cluster.hostname(id), mode.clone());
        }
    }

    /// A healthy ensemble: member 0 leads, the rest follow.
    pub fn elect_leader(&self, cluster: &KeeperCluster) {
        let modes: Vec<KeeperMode> = cluster
            .replica_ids()
            .iter()
            .map(|id| {
                if id.0 == 0 {
                    if cluster.replicas() == 1 {
                        KeeperMode::Standalone
                    } else {
                        KeeperMode::Leader
                    }
                } else {
                    KeeperMode::Follower
                }
            })
            .collect();
        self.set_keeper_modes(cluster, &modes);
    }

    pub fn start_servers(&self, cluster: &ClickHouseCluster) {
        for id in cluster.replica_ids() {
            self.clickhouse.start(id);
        }
    }
}
