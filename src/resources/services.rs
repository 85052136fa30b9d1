//! Service generation for both cluster kinds.
//!
//! Creates two services per cluster:
//! - **Headless Service**: stable per-replica DNS names
//! - **Client Service**: load-balanced access to ready servers

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::ClusterObject;
use crate::resources::common::{
    headless_service_name, object_meta, resource_prefix, selector_labels, standard_labels,
};

/// A named container port exposed through the services.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamedPort {
    pub name: &'static str,
    pub port: i32,
}

impl NamedPort {
    pub const fn new(name: &'static str, port: i32) -> Self {
        Self { name, port }
    }
}

fn service_ports(ports: &[NamedPort]) -> Vec<ServicePort> {
    ports
        .iter()
        .map(|p| ServicePort {
            port: p.port,
            target_port: Some(IntOrString::String(p.name.to_string())),
            name: Some(p.name.to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect()
}

/// Generate the headless Service `<cluster>-<role>-headless`.
///
/// Not-ready addresses are published so members can resolve each other
/// while the ensemble is still forming.
pub fn generate_headless_service<C: ClusterObject>(cluster: &C, ports: &[NamedPort]) -> Service {
    let mut labels = standard_labels(cluster);
    labels.insert(
        "app.kubernetes.io/service-type".to_string(),
        "headless".to_string(),
    );

    Service {
        metadata: object_meta(cluster, headless_service_name(cluster), labels),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector_labels(cluster)),
            ports: Some(service_ports(ports)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the client Service `<cluster>-<role>`.
pub fn generate_client_service<C: ClusterObject>(cluster: &C, ports: &[NamedPort]) -> Service {
    let mut labels = standard_labels(cluster);
    labels.insert(
        "app.kubernetes.io/service-type".to_string(),
        "client".to_string(),
    );

    Service {
        metadata: object_meta(cluster, resource_prefix(cluster), labels),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector_labels(cluster)),
            ports: Some(service_ports(ports)),
            ..Default::default()
        }),
        ..Default::default()
    }
}
