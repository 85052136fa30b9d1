//! Content fingerprints that drive rollout decisions.
//!
//! Two revisions are tracked per cluster. The configuration revision covers
//! the rendered server configuration and changes force a restart. The
//! workload revision covers the StatefulSet template and changes only update
//! the workload spec. Both are computed from a canonical single-replica
//! rendering so that scaling never moves either value.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::controller::error::Result;
use crate::resources::common::{ANNOTATION_CONFIG_REVISION, ANNOTATION_STATEFULSET_REVISION};

/// The pair of revisions a workload is (or should be) running.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Revisions {
    pub configuration: String,
    pub statefulset: String,
}

impl Revisions {
    /// Revisions recorded on a live StatefulSet, if both annotations are present.
    pub fn recorded_on(sts: &StatefulSet) -> Option<Self> {
        let annotations = sts.metadata.annotations.as_ref()?;
        Some(Self {
            configuration: annotations.get(ANNOTATION_CONFIG_REVISION)?.clone(),
            statefulset: annotations.get(ANNOTATION_STATEFULSET_REVISION)?.clone(),
        })
    }

    /// Annotations to stamp on a rendered StatefulSet.
    pub fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                ANNOTATION_CONFIG_REVISION.to_string(),
                self.configuration.clone(),
            ),
            (
                ANNOTATION_STATEFULSET_REVISION.to_string(),
                self.statefulset.clone(),
            ),
        ])
    }
}

/// SHA-256 of `bytes` rendered as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Fingerprint of any serializable value via its JSON form.
///
/// Maps must be ordered (`BTreeMap`, `serde_json::Value` objects) for the
/// result to be stable; every type rendered here satisfies that.
pub fn hash_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(&serde_json::to_vec(value)?))
}

/// Configuration revision over every rendered configuration file.
pub fn configuration_revision(files: &BTreeMap<String, String>) -> Result<String> {
    hash_json(files)
}

/// Workload revision over the full StatefulSet spec (template, volumes,
/// replica count). Revision annotations are stamped after hashing, so they
/// never feed back into the value.
pub fn statefulset_revision(sts: &StatefulSet) -> Result<String> {
    hash_json(&sts.spec)
}
