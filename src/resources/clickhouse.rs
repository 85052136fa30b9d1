//! ClickHouse cluster rendering: server and users configuration, workloads,
//! services and per-shard budgets.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Container, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use serde_json::{Value, json};

use crate::crd::{ClickHouseCluster, ClickHouseReplicaId, KeeperCluster};
use crate::resources::common::{
    LABEL_SHARD_ID, replica_object_name, resource_prefix, selector_labels, standard_labels,
};
use crate::resources::configmap::{
    PROMETHEUS_PORT, apply_overlay, generate_config_map, logger_config, openssl_config,
    prometheus_config, render_yaml,
};
use crate::resources::keeper;
use crate::resources::pdb::{generate_pod_disruption_budget, shard_budget};
use crate::resources::secret::OPERATOR_USER;
use crate::resources::services::{NamedPort, generate_client_service, generate_headless_service};
use crate::resources::statefulset::{
    DATA_VOLUME_NAME, config_volume, container_ports, generate_container_security_context,
    generate_pod_spec, generate_replica_statefulset, generate_resource_requirements, http_probe,
    tls_volume, volume_mount,
};

pub const PORT_NATIVE: i32 = 9000;
pub const PORT_NATIVE_SECURE: i32 = 9440;
pub const PORT_HTTP: i32 = 8123;
pub const PORT_HTTP_SECURE: i32 = 8443;
pub const PORT_INTERSERVER: i32 = 9009;

pub const CONTAINER_NAME: &str = "clickhouse-server";
pub const CONFIG_FILE: &str = "config.yaml";
pub const USERS_FILE: &str = "users.yaml";

const CONFIG_PATH: &str = "/etc/clickhouse-server/config.d/";
const USERS_PATH: &str = "/etc/clickhouse-server/users.d/";
const TLS_PATH: &str = "/etc/clickhouse-server/tls/";
const DATA_PATH: &str = "/var/lib/clickhouse/";
const CONFIG_VOLUME: &str = "clickhouse-config-volume";
const USERS_VOLUME: &str = "clickhouse-users-volume";
const TLS_VOLUME: &str = "clickhouse-server-tls-volume";
const CLICKHOUSE_USER_ID: i64 = 101;

const CERTIFICATE_FILE: &str = "clickhouse-server.crt";
const KEY_FILE: &str = "clickhouse-server.key";
const CA_BUNDLE_FILE: &str = "ca-bundle.crt";

const DEFAULT_CLUSTER_NAME: &str = "default";
const KEEPER_PATH_USERS: &str = "/clickhouse/access";
const KEEPER_PATH_DISCOVERY: &str = "/clickhouse/discovery/default";
const KEEPER_PATH_UDF: &str = "/clickhouse/user_defined";
const KEEPER_PATH_DISTRIBUTED_DDL: &str = "/clickhouse/task_queue/ddl";

fn ports(cluster: &ClickHouseCluster) -> Vec<NamedPort> {
    let mut ports = vec![
        NamedPort::new("native", PORT_NATIVE),
        NamedPort::new("http", PORT_HTTP),
        NamedPort::new("interserver", PORT_INTERSERVER),
        NamedPort::new("prometheus", PROMETHEUS_PORT),
    ];
    if cluster.spec.tls.secret().is_some() {
        ports.push(NamedPort::new("native-secure", PORT_NATIVE_SECURE));
        ports.push(NamedPort::new("https", PORT_HTTP_SECURE));
    }
    ports
}

/// Copy of the cluster reduced to one shard of one replica, used for
/// revision hashing so that scaling never changes either revision.
pub fn canonical(cluster: &ClickHouseCluster) -> ClickHouseCluster {
    let mut canonical = cluster.clone();
    canonical.spec.shards = 1;
    canonical.spec.replicas = 1;
    canonical
}

fn keeper_nodes(keeper: &KeeperCluster) -> Vec<Value> {
    let secure = keeper.spec.tls.secret().is_some();
    keeper
        .replica_ids()
        .into_iter()
        .map(|id| {
            let mut node = json!({
                "host": keeper.hostname(id),
                "port": if secure { keeper::CLIENT_PORT_SECURE } else { keeper::CLIENT_PORT },
            });
            if secure {
                node["secure"] = json!(1);
            }
            node
        })
        .collect()
}

/// Server configuration tree of one replica, overlay applied.
pub fn config_tree(
    cluster: &ClickHouseCluster,
    keeper: &KeeperCluster,
    id: ClickHouseReplicaId,
) -> Value {
    let mut config = json!({
        "path": DATA_PATH,
        "listen_host": "0.0.0.0",
        "logger": logger_config(&cluster.spec.logger),
        "prometheus": prometheus_config(),
        "tcp_port": PORT_NATIVE,
        "http_port": PORT_HTTP,
        "interserver_http_port": PORT_INTERSERVER,
        "interserver_http_host": cluster.hostname(id),
        "macros": {
            "cluster": DEFAULT_CLUSTER_NAME,
            "shard": id.shard_id.to_string(),
            "replica": replica_object_name(cluster, &id),
        },
        "remote_servers": {
            DEFAULT_CLUSTER_NAME: {
                "discovery": {
                    "path": KEEPER_PATH_DISCOVERY,
                    "shard": id.shard_id,
                },
            },
        },
        "allow_experimental_cluster_discovery": true,
        "distributed_ddl": { "path": KEEPER_PATH_DISTRIBUTED_DDL },
        "zookeeper": { "node": keeper_nodes(keeper) },
        "user_directories": {
            "users_xml": { "path": "users.xml" },
            "replicated": { "zookeeper_path": KEEPER_PATH_USERS },
        },
        "user_defined_zookeeper_path": KEEPER_PATH_UDF,
    });

    if cluster.spec.tls.secret().is_some() {
        config["tcp_port_secure"] = json!(PORT_NATIVE_SECURE);
        config["https_port"] = json!(PORT_HTTP_SECURE);
        config["openSSL"] = openssl_config(
            &format!("{TLS_PATH}{CERTIFICATE_FILE}"),
            &format!("{TLS_PATH}{KEY_FILE}"),
            &format!("{TLS_PATH}{CA_BUNDLE_FILE}"),
        );
    }

    apply_overlay(&mut config, &cluster.spec.extra_config);
    config
}

/// Users configuration granting the operator user full access.
pub fn users_tree(password_sha256: &str) -> Value {
    json!({
        "users": {
            OPERATOR_USER: {
                "password_sha256_hex": password_sha256,
                "profile": "default",
                "quota": "default",
                "networks": { "ip": "::/0" },
                "grants": [{ "query": "GRANT ALL ON *.* WITH GRANT OPTION" }],
            },
        },
        "profiles": { "default": {} },
        "quotas": { "default": {} },
    })
}

/// Rendered configuration files of one replica.
pub fn render_config(
    cluster: &ClickHouseCluster,
    keeper: &KeeperCluster,
    id: ClickHouseReplicaId,
    password_sha256: &str,
) -> Result<BTreeMap<String, String>, serde_yaml::Error> {
    Ok(BTreeMap::from([
        (
            CONFIG_FILE.to_string(),
            render_yaml(&config_tree(cluster, keeper, id))?,
        ),
        (
            USERS_FILE.to_string(),
            render_yaml(&users_tree(password_sha256))?,
        ),
    ]))
}

pub fn generate_clickhouse_config_map(
    cluster: &ClickHouseCluster,
    keeper: &KeeperCluster,
    id: ClickHouseReplicaId,
    password_sha256: &str,
) -> Result<ConfigMap, serde_yaml::Error> {
    Ok(generate_config_map(
        cluster,
        &id,
        render_config(cluster, keeper, id, password_sha256)?,
    ))
}

fn generate_clickhouse_container(cluster: &ClickHouseCluster) -> Container {
    let mut mounts = vec![
        volume_mount(DATA_VOLUME_NAME, DATA_PATH, false),
        volume_mount(CONFIG_VOLUME, CONFIG_PATH, true),
        volume_mount(USERS_VOLUME, USERS_PATH, true),
    ];
    if cluster.spec.tls.secret().is_some() {
        mounts.push(volume_mount(TLS_VOLUME, TLS_PATH, true));
    }

    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(cluster.spec.image.reference()),
        image_pull_policy: Some(cluster.spec.image.pull_policy.clone()),
        ports: Some(container_ports(&ports(cluster))),
        resources: Some(generate_resource_requirements(&cluster.spec.resources)),
        volume_mounts: Some(mounts),
        security_context: Some(generate_container_security_context(CLICKHOUSE_USER_ID)),
        readiness_probe: Some(http_probe("/ping", "http", 5, 3)),
        // Large parts can take minutes to load on start.
        liveness_probe: Some(http_probe("/ping", "http", 30, 10)),
        ..Default::default()
    }
}

/// Generate the StatefulSet of one replica.
pub fn generate_clickhouse_statefulset(
    cluster: &ClickHouseCluster,
    id: ClickHouseReplicaId,
) -> StatefulSet {
    let config_map = replica_object_name(cluster, &id);
    let mut volumes = vec![
        config_volume(CONFIG_VOLUME, &config_map, &[CONFIG_FILE]),
        config_volume(USERS_VOLUME, &config_map, &[USERS_FILE]),
    ];
    if let Some(secret) = cluster.spec.tls.secret() {
        volumes.push(tls_volume(
            TLS_VOLUME,
            secret,
            &[
                ("tls.crt", CERTIFICATE_FILE),
                ("tls.key", KEY_FILE),
                ("ca.crt", CA_BUNDLE_FILE),
            ],
        ));
    }

    let pod = generate_pod_spec(
        generate_clickhouse_container(cluster),
        volumes,
        &cluster.spec.image,
        CLICKHOUSE_USER_ID,
    );
    generate_replica_statefulset(cluster, &id, pod, &cluster.spec.storage)
}

/// Headless and client services.
pub fn generate_clickhouse_services(cluster: &ClickHouseCluster) -> [Service; 2] {
    let ports = ports(cluster);
    [
        generate_headless_service(cluster, &ports),
        generate_client_service(cluster, &ports),
    ]
}

/// `<cluster>-clickhouse-<shard>`
pub fn shard_pdb_name(cluster: &ClickHouseCluster, shard_id: i32) -> String {
    format!("{}-{}", resource_prefix(cluster), shard_id)
}

/// Budget of one shard.
pub fn generate_shard_pdb(cluster: &ClickHouseCluster, shard_id: i32) -> PodDisruptionBudget {
    let shard = (LABEL_SHARD_ID.to_string(), shard_id.to_string());

    let mut labels = standard_labels(cluster);
    labels.insert(shard.0.clone(), shard.1.clone());
    let mut selector = selector_labels(cluster);
    selector.insert(shard.0, shard.1);

    generate_pod_disruption_budget(
        cluster,
        shard_pdb_name(cluster, shard_id),
        labels,
        selector,
        &shard_budget(&cluster.spec.pod_disruption_budget, cluster.replicas()),
    )
}
