//! Operator management credentials.
//!
//! The Secret is created once with a random password and never rewritten, so
//! a password changed by hand survives reconciliation.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::crd::ClickHouseCluster;
use crate::resources::common::{object_meta, resource_prefix, standard_labels};

/// User the operator authenticates as.
pub const OPERATOR_USER: &str = "operator";
/// Secret key holding the operator password.
pub const PASSWORD_KEY: &str = "password";

const PASSWORD_LENGTH: usize = 32;

/// `<cluster>-clickhouse-credentials`
pub fn credentials_secret_name(cluster: &ClickHouseCluster) -> String {
    format!("{}-credentials", resource_prefix(cluster))
}

pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Generate the credentials Secret holding `password`.
pub fn generate_credentials_secret(cluster: &ClickHouseCluster, password: &str) -> Secret {
    Secret {
        metadata: object_meta(
            cluster,
            credentials_secret_name(cluster),
            standard_labels(cluster),
        ),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            PASSWORD_KEY.to_string(),
            ByteString(password.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Password stored in a credentials Secret, if present and valid UTF-8.
pub fn password_from_secret(secret: &Secret) -> Option<String> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(PASSWORD_KEY)) {
        return String::from_utf8(value.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(PASSWORD_KEY))
        .cloned()
}
