//! StatefulSet building blocks shared by both cluster kinds.
//!
//! Every replica runs in its own single-pod StatefulSet:
//! - Stable network identity via the headless service
//! - Persistent storage via a PVC template
//! - Configuration mounted from the replica's ConfigMap
//! - Optional TLS material mounted from a user supplied Secret
//!
//! With one pod per StatefulSet the default `RollingUpdate` strategy replaces
//! exactly that pod; the controller decides which StatefulSets to touch.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, KeyToPath,
    LocalObjectReference, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSecurityContext,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SeccompProfile, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{ClusterObject, ImageSpec, ReplicaId, ResourceRequirementsSpec, StorageSpec};
use crate::resources::common::{
    headless_service_name, object_meta, replica_object_name, selector_labels, standard_labels,
};
use crate::resources::services::NamedPort;

/// Default termination grace period in seconds.
const TERMINATION_GRACE_PERIOD: i64 = 60;

/// Name of the data PVC template.
pub const DATA_VOLUME_NAME: &str = "data";

/// Labels of one replica's objects: the cluster's standard labels plus the
/// replica identity.
pub fn replica_labels<C: ClusterObject, Id: ReplicaId>(
    cluster: &C,
    id: &Id,
) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster);
    labels.extend(id.labels());
    labels
}

/// Selector matching exactly one replica's pod.
pub fn replica_selector<C: ClusterObject, Id: ReplicaId>(
    cluster: &C,
    id: &Id,
) -> BTreeMap<String, String> {
    let mut labels = selector_labels(cluster);
    labels.extend(id.labels());
    labels
}

/// Generate the single-pod StatefulSet of one replica around `pod_spec`.
pub fn generate_replica_statefulset<C: ClusterObject, Id: ReplicaId>(
    cluster: &C,
    id: &Id,
    pod_spec: PodSpec,
    storage: &StorageSpec,
) -> StatefulSet {
    let labels = replica_labels(cluster, id);
    let annotations = cluster.extra_annotations();

    StatefulSet {
        metadata: object_meta(cluster, replica_object_name(cluster, id), labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: Some(headless_service_name(cluster)),
            selector: LabelSelector {
                match_labels: Some(replica_selector(cluster, id)),
                ..Default::default()
            },
            pod_management_policy: Some("Parallel".to_string()),
            revision_history_limit: Some(10),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: if annotations.is_empty() {
                        None
                    } else {
                        Some(annotations.clone())
                    },
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            volume_claim_templates: Some(vec![generate_pvc_template(storage)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod spec around one server container.
pub fn generate_pod_spec(
    container: Container,
    volumes: Vec<Volume>,
    image: &ImageSpec,
    user_id: i64,
) -> PodSpec {
    PodSpec {
        termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
        security_context: Some(generate_pod_security_context(user_id)),
        containers: vec![container],
        volumes: Some(volumes),
        image_pull_secrets: convert_pull_secrets(&image.pull_secrets),
        ..Default::default()
    }
}

/// Convert pull_secrets list to LocalObjectReference list.
fn convert_pull_secrets(pull_secrets: &[String]) -> Option<Vec<LocalObjectReference>> {
    if pull_secrets.is_empty() {
        return None;
    }

    Some(
        pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect(),
    )
}

fn generate_pod_security_context(user_id: i64) -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(user_id),
        run_as_group: Some(user_id),
        fs_group: Some(user_id),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container security context.
pub fn generate_container_security_context(user_id: i64) -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(false),
        run_as_non_root: Some(true),
        run_as_user: Some(user_id),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            // Lets the server raise its own thread priorities.
            add: Some(vec!["SYS_NICE".to_string()]),
        }),
        ..Default::default()
    }
}

pub fn container_ports(ports: &[NamedPort]) -> Vec<ContainerPort> {
    ports
        .iter()
        .map(|p| ContainerPort {
            container_port: p.port,
            name: Some(p.name.to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect()
}

/// Limits are only rendered when set.
pub fn generate_resource_requirements(spec: &ResourceRequirementsSpec) -> ResourceRequirements {
    let quantities = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };

    ResourceRequirements {
        requests: Some(quantities(&spec.requests.cpu, &spec.requests.memory)),
        limits: spec
            .limits
            .as_ref()
            .map(|limits| quantities(&limits.cpu, &limits.memory)),
        ..Default::default()
    }
}

/// HTTP GET probe against a named container port.
pub fn http_probe(path: &str, port: &str, initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String(port.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(5),
        timeout_seconds: Some(5),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// Volume projecting selected ConfigMap keys.
pub fn config_volume(volume_name: &str, config_map: &str, keys: &[&str]) -> Volume {
    Volume {
        name: volume_name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            items: Some(
                keys.iter()
                    .map(|key| KeyToPath {
                        key: key.to_string(),
                        path: key.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Read-only volume over the TLS secret, exposing the files under `files`
/// as `(secret key, file name)` pairs.
pub fn tls_volume(volume_name: &str, secret: &str, files: &[(&str, &str)]) -> Volume {
    Volume {
        name: volume_name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            default_mode: Some(0o444),
            items: Some(
                files
                    .iter()
                    .map(|(key, path)| KeyToPath {
                        key: key.to_string(),
                        path: path.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn volume_mount(volume_name: &str, mount_path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: volume_name.to_string(),
        mount_path: mount_path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

/// Generate PVC template for the StatefulSet.
fn generate_pvc_template(storage: &StorageSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(DATA_VOLUME_NAME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
