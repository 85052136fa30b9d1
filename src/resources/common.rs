//! Common resource generation utilities.
//!
//! Label keys, annotation keys, naming rules and owner references shared by
//! every object the operator manages.

use std::collections::BTreeMap;
use std::fmt::Display;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::crd::ClusterObject;

pub const LABEL_APP: &str = "app";
pub const LABEL_KIND: &str = "kind";
pub const LABEL_ROLE: &str = "role";
pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_KEEPER_REPLICA_ID: &str = "clickhouse.com/keeper-replica-id";
pub const LABEL_SHARD_ID: &str = "clickhouse.com/shard-id";
pub const LABEL_REPLICA_ID: &str = "clickhouse.com/replica-id";

pub const KEEPER_KIND_LABEL: &str = "clickhouse-keeper";
pub const CLICKHOUSE_KIND_LABEL: &str = "clickhouse-server";
pub const MANAGED_BY: &str = "clickhouse-operator";

/// Hash of the fields applied through the resource reconciler.
pub const ANNOTATION_SPEC_HASH: &str = "clickhouse.com/spec-hash";
/// Configuration revision a workload was last rendered with.
pub const ANNOTATION_CONFIG_REVISION: &str = "clickhouse.com/config-revision";
/// Workload revision a workload was last rendered with.
pub const ANNOTATION_STATEFULSET_REVISION: &str = "clickhouse.com/statefulset-revision";
/// Pod template marker forcing a process restart.
pub const ANNOTATION_RESTARTED_AT: &str = "clickhouse.com/restarted-at";

/// `<cluster>-<role>`, the prefix of every object name.
pub fn resource_prefix<C: ClusterObject>(cluster: &C) -> String {
    format!("{}-{}", cluster.name_any(), C::ROLE)
}

/// `<cluster>-<role>-headless`
pub fn headless_service_name<C: ClusterObject>(cluster: &C) -> String {
    format!("{}-headless", resource_prefix(cluster))
}

/// `<cluster>-<role>-<replica-path>`, shared by a replica's StatefulSet and ConfigMap.
pub fn replica_object_name<C: ClusterObject>(cluster: &C, replica: &impl Display) -> String {
    format!("{}-{}", resource_prefix(cluster), replica)
}

/// Name of the single pod of a replica's StatefulSet.
pub fn replica_pod_name(statefulset_name: &str) -> String {
    format!("{statefulset_name}-0")
}

/// Fully qualified DNS name of a replica's pod.
pub fn replica_hostname<C: ClusterObject>(cluster: &C, replica: &impl Display) -> String {
    format!(
        "{}.{}.{}.svc.{}",
        replica_pod_name(&replica_object_name(cluster, replica)),
        headless_service_name(cluster),
        cluster.namespace().unwrap_or_default(),
        cluster.cluster_domain()
    )
}

/// Labels selecting every pod of a cluster.
pub fn selector_labels<C: ClusterObject>(cluster: &C) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), resource_prefix(cluster)),
        (LABEL_KIND.to_string(), C::KIND_LABEL.to_string()),
    ])
}

/// Standard labels applied to all managed resources
pub fn standard_labels<C: ClusterObject>(cluster: &C) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cluster);
    labels.insert(LABEL_ROLE.to_string(), C::ROLE.to_string());
    labels.insert(LABEL_APP_NAME.to_string(), C::KIND_LABEL.to_string());
    labels.insert(LABEL_INSTANCE.to_string(), cluster.name_any());
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());

    for (key, value) in cluster.extra_labels() {
        labels.entry(key.clone()).or_insert_with(|| value.clone());
    }
    labels
}

/// Label selector string (`k=v,k=v`) for list calls.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Controller owner reference pointing at the cluster object.
pub fn owner_reference<C: ClusterObject>(cluster: &C) -> OwnerReference {
    cluster.controller_owner_ref(&()).unwrap_or_else(|| OwnerReference {
        api_version: C::api_version(&()).to_string(),
        kind: C::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Object metadata for a managed object with the given name and labels.
pub fn object_meta<C: ClusterObject>(
    cluster: &C,
    name: String,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    let annotations = cluster.extra_annotations();
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(labels),
        annotations: if annotations.is_empty() {
            None
        } else {
            Some(annotations.clone())
        },
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}
