//! Keeper ensemble rendering: configuration, workloads, services and budget.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Container, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use serde_json::{Value, json};

use crate::crd::{KeeperCluster, KeeperReplicaId};
use crate::resources::common::{
    replica_object_name, resource_prefix, selector_labels, standard_labels,
};
use crate::resources::configmap::{
    PROMETHEUS_PORT, apply_overlay, generate_config_map, logger_config, openssl_config,
    prometheus_config, render_yaml,
};
use crate::resources::pdb::{ensemble_budget, generate_pod_disruption_budget};
use crate::resources::services::{NamedPort, generate_client_service, generate_headless_service};
use crate::resources::statefulset::{
    DATA_VOLUME_NAME, config_volume, container_ports, generate_container_security_context,
    generate_pod_spec, generate_replica_statefulset, generate_resource_requirements, http_probe,
    tls_volume, volume_mount,
};

pub const CLIENT_PORT: i32 = 9181;
pub const CLIENT_PORT_SECURE: i32 = 9281;
pub const RAFT_PORT: i32 = 9234;
pub const HTTP_CONTROL_PORT: i32 = 9182;

pub const CONTAINER_NAME: &str = "clickhouse-keeper";
pub const CONFIG_FILE: &str = "config.yaml";

const CONFIG_PATH: &str = "/etc/clickhouse-keeper/keeper_config.d/";
const DATA_PATH: &str = "/var/lib/clickhouse-keeper/";
const TLS_PATH: &str = "/etc/clickhouse-keeper/tls/";
const CONFIG_VOLUME: &str = "keeper-config";
const TLS_VOLUME: &str = "keeper-tls";
const KEEPER_USER_ID: i64 = 101;

const CERTIFICATE_FILE: &str = "keeper.crt";
const KEY_FILE: &str = "keeper.key";
const CA_BUNDLE_FILE: &str = "ca-bundle.crt";

fn ports(cluster: &KeeperCluster) -> Vec<NamedPort> {
    let mut ports = vec![
        NamedPort::new("client", CLIENT_PORT),
        NamedPort::new("raft", RAFT_PORT),
        NamedPort::new("http-control", HTTP_CONTROL_PORT),
        NamedPort::new("prometheus", PROMETHEUS_PORT),
    ];
    if cluster.spec.tls.secret().is_some() {
        ports.push(NamedPort::new("client-secure", CLIENT_PORT_SECURE));
    }
    ports
}

/// Copy of the cluster reduced to one member, used for revision hashing so
/// that scaling never changes either revision.
pub fn canonical(cluster: &KeeperCluster) -> KeeperCluster {
    let mut canonical = cluster.clone();
    canonical.spec.replicas = 1;
    canonical
}

fn raft_configuration(cluster: &KeeperCluster, secure: bool) -> Value {
    let servers: Vec<Value> = cluster
        .replica_ids()
        .into_iter()
        .map(|id| {
            json!({
                "id": id.server_id(),
                "hostname": cluster.hostname(id),
                "port": RAFT_PORT,
            })
        })
        .collect();

    let mut raft = json!({ "server": servers });
    if secure {
        raft["secure"] = json!(true);
    }
    raft
}

/// Server configuration tree of one member, overlay applied.
pub fn config_tree(cluster: &KeeperCluster, id: KeeperReplicaId) -> Value {
    let secure = cluster.spec.tls.secret().is_some();

    let mut keeper_server = json!({
        "tcp_port": CLIENT_PORT,
        "server_id": id.server_id(),
        "log_storage_path": format!("{DATA_PATH}coordination/log"),
        "snapshot_storage_path": format!("{DATA_PATH}coordination/snapshots"),
        "http_control": {
            "port": HTTP_CONTROL_PORT,
            "readiness": { "endpoint": "/ready" },
        },
        "coordination_settings": {
            "operation_timeout_ms": 10000,
            "session_timeout_ms": 30000,
            "raft_logs_level": "warning",
        },
        "raft_configuration": raft_configuration(cluster, secure),
    });

    let mut config = json!({
        "listen_host": "0.0.0.0",
        "logger": logger_config(&cluster.spec.logger),
        "prometheus": prometheus_config(),
    });

    if secure {
        keeper_server["tcp_port_secure"] = json!(CLIENT_PORT_SECURE);
        config["openSSL"] = openssl_config(
            &format!("{TLS_PATH}{CERTIFICATE_FILE}"),
            &format!("{TLS_PATH}{KEY_FILE}"),
            &format!("{TLS_PATH}{CA_BUNDLE_FILE}"),
        );
    }
    config["keeper_server"] = keeper_server;

    apply_overlay(&mut config, &cluster.spec.extra_config);
    config
}

/// Rendered configuration files of one member.
pub fn render_config(
    cluster: &KeeperCluster,
    id: KeeperReplicaId,
) -> Result<BTreeMap<String, String>, serde_yaml::Error> {
    Ok(BTreeMap::from([(
        CONFIG_FILE.to_string(),
        render_yaml(&config_tree(cluster, id))?,
    )]))
}

pub fn generate_keeper_config_map(
    cluster: &KeeperCluster,
    id: KeeperReplicaId,
) -> Result<ConfigMap, serde_yaml::Error> {
    Ok(generate_config_map(cluster, &id, render_config(cluster, id)?))
}

fn generate_keeper_container(cluster: &KeeperCluster) -> Container {
    let mut mounts = vec![
        volume_mount(DATA_VOLUME_NAME, DATA_PATH, false),
        volume_mount(CONFIG_VOLUME, CONFIG_PATH, true),
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
        security_context: Some(generate_container_security_context(KEEPER_USER_ID)),
        // Ready only once the member has joined a quorum.
        readiness_probe: Some(http_probe("/ready", "http-control", 5, 3)),
        ..Default::default()
    }
}

/// Generate the StatefulSet of one member.
pub fn generate_keeper_statefulset(cluster: &KeeperCluster, id: KeeperReplicaId) -> StatefulSet {
    let config_map = replica_object_name(cluster, &id);
    let mut volumes = vec![config_volume(CONFIG_VOLUME, &config_map, &[CONFIG_FILE])];
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
        generate_keeper_container(cluster),
        volumes,
        &cluster.spec.image,
        KEEPER_USER_ID,
    );
    generate_replica_statefulset(cluster, &id, pod, &cluster.spec.storage)
}

/// Headless and client services.
pub fn generate_keeper_services(cluster: &KeeperCluster) -> [Service; 2] {
    let ports = ports(cluster);
    [
        generate_headless_service(cluster, &ports),
        generate_client_service(cluster, &ports),
    ]
}

/// Ensemble-wide budget `<cluster>-keeper`.
pub fn generate_keeper_pdb(cluster: &KeeperCluster) -> PodDisruptionBudget {
    generate_pod_disruption_budget(
        cluster,
        resource_prefix(cluster),
        standard_labels(cluster),
        selector_labels(cluster),
        &ensemble_budget(&cluster.spec.pod_disruption_budget, cluster.replicas()),
    )
}
