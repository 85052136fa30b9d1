//! Server configuration rendering.
//!
//! Configuration is built as a JSON value tree, merged with the user's
//! `extraConfig` overlay and written as YAML into one ConfigMap per replica.
//! Object keys are kept sorted so identical input always renders identical
//! bytes, which the configuration revision relies on.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::{Map, Value, json};

use crate::crd::{ClusterObject, LoggerSpec, ReplicaId};
use crate::resources::common::{object_meta, replica_object_name};
use crate::resources::statefulset::replica_labels;

/// Prometheus endpoint port on both server kinds.
pub const PROMETHEUS_PORT: i32 = 9363;

/// Logger section. Always logs to the console, optionally as JSON.
pub fn logger_config(spec: &LoggerSpec) -> Value {
    let mut logger = json!({
        "console": true,
        "level": spec.level,
    });
    if spec.json_logs {
        logger["formatting"] = json!({ "type": "json" });
    }
    logger
}

/// Prometheus section exposing metrics, events and asynchronous metrics.
pub fn prometheus_config() -> Value {
    json!({
        "endpoint": "/metrics",
        "port": PROMETHEUS_PORT,
        "metrics": true,
        "events": true,
        "asynchronous_metrics": true,
    })
}

/// OpenSSL section for servers that terminate TLS with mounted material.
pub fn openssl_config(certificate: &str, private_key: &str, ca_bundle: &str) -> Value {
    let params = json!({
        "certificateFile": certificate,
        "privateKeyFile": private_key,
        "caConfig": ca_bundle,
        "verificationMode": "relaxed",
        "disableProtocols": "sslv2,sslv3",
        "preferServerCiphers": true,
    });
    json!({
        "server": params,
        "client": params,
    })
}

/// Deep merge: objects merge key by key, anything else is replaced.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Overlay values are parsed as YAML so `"true"` and `"30000"` keep their
/// types. Anything unparseable stays a string.
fn overlay_value(raw: &str) -> Value {
    serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Expand one dotted path into a nested object.
fn nest(path: &str, value: Value) -> Value {
    path.rsplit('.')
        .filter(|segment| !segment.is_empty())
        .fold(value, |inner, segment| {
            let mut map = Map::new();
            map.insert(segment.to_string(), inner);
            Value::Object(map)
        })
}

/// Merge the dotted-path overlay over `config`. Overlay wins on collision.
pub fn apply_overlay(config: &mut Value, overlay: &BTreeMap<String, String>) {
    for (path, raw) in overlay {
        merge(config, nest(path, overlay_value(raw)));
    }
}

/// Render a configuration tree as YAML.
pub fn render_yaml(config: &Value) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(config)
}

/// Generate the ConfigMap holding one replica's configuration files.
pub fn generate_config_map<C: ClusterObject, Id: ReplicaId>(
    cluster: &C,
    id: &Id,
    files: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(
            cluster,
            replica_object_name(cluster, id),
            replica_labels(cluster, id),
        ),
        data: Some(files),
        ..Default::default()
    }
}
