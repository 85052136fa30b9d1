//! Hash-gated apply of owned objects.
//!
//! [`apply`] renders nothing itself: it takes a desired object, fingerprints
//! the declared spec fields together with labels and annotations, and writes
//! only when the fingerprint recorded on the live object differs. Updates
//! copy the declared fields onto the live object so platform-managed fields
//! (status, uid, resource version) survive.

use std::fmt::Debug;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::controller::retry::{RetryConfig, RetryError, retry_on_conflict};
use crate::controller::store::ObjectStore;
use crate::resources::common::ANNOTATION_SPEC_HASH;

/// An object the operator owns and applies field by field.
pub trait ManagedResource:
    Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static
{
    /// Kind name for logs and errors.
    const KIND: &'static str;

    /// Fields applied when the caller names none.
    const DEFAULT_FIELDS: &'static [&'static str];

    /// Feed one named field into the hasher.
    fn hash_field(&self, field: &str, hasher: &mut Sha256) -> Result<()>;

    /// Copy one named field from `other`.
    fn copy_field(&mut self, other: &Self, field: &str) -> Result<()>;

    /// Fingerprint of the named fields plus labels and annotations, ignoring
    /// the spec-hash annotation itself.
    fn compute_hash(&self, fields: &[&str]) -> Result<String> {
        let mut hasher = Sha256::new();
        for field in fields {
            hasher.update(field.as_bytes());
            self.hash_field(field, &mut hasher)?;
        }

        hasher.update(serde_json::to_vec(self.labels())?);
        let annotations: std::collections::BTreeMap<_, _> = self
            .annotations()
            .iter()
            .filter(|(k, _)| k.as_str() != ANNOTATION_SPEC_HASH)
            .collect();
        hasher.update(serde_json::to_vec(&annotations)?);

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Copy labels, annotations and the named fields from `desired`.
    fn copy_spec_from(&mut self, desired: &Self, fields: &[&str]) -> Result<()> {
        self.meta_mut().labels = desired.meta().labels.clone();
        self.meta_mut().annotations = desired.meta().annotations.clone();
        self.meta_mut().owner_references = desired.meta().owner_references.clone();
        for field in fields {
            self.copy_field(desired, field)?;
        }
        Ok(())
    }
}

macro_rules! managed_resource {
    ($ty:ty, $kind:literal, [$($name:literal => $field:ident),+ $(,)?]) => {
        impl ManagedResource for $ty {
            const KIND: &'static str = $kind;
            const DEFAULT_FIELDS: &'static [&'static str] = &[$($name),+];

            fn hash_field(&self, field: &str, hasher: &mut Sha256) -> Result<()> {
                match field {
                    $($name => hasher.update(serde_json::to_vec(&self.$field)?),)+
                    other => {
                        return Err(Error::InvalidSpecField {
                            kind: $kind,
                            field: other.to_string(),
                        })
                    }
                }
                Ok(())
            }

            fn copy_field(&mut self, other: &Self, field: &str) -> Result<()> {
                match field {
                    $($name => self.$field = other.$field.clone(),)+
                    other => {
                        return Err(Error::InvalidSpecField {
                            kind: $kind,
                            field: other.to_string(),
                        })
                    }
                }
                Ok(())
            }
        }
    };
}

managed_resource!(StatefulSet, "StatefulSet", ["spec" => spec]);
managed_resource!(Service, "Service", ["spec" => spec]);
managed_resource!(PodDisruptionBudget, "PodDisruptionBudget", ["spec" => spec]);
managed_resource!(ConfigMap, "ConfigMap", ["data" => data, "binaryData" => binary_data]);
managed_resource!(Secret, "Secret", ["data" => data, "type" => type_]);

/// Ensure `desired` exists with the given spec fields. Returns whether a write happened.
///
/// The owner reference is set before anything is read so a failed apply
/// still leaves a correctly owned object behind once a later pass succeeds.
/// An empty `fields` slice applies [`ManagedResource::DEFAULT_FIELDS`].
pub async fn apply<K: ManagedResource>(
    store: &dyn ObjectStore<K>,
    owner: &OwnerReference,
    mut desired: K,
    fields: &[&str],
    retry: &RetryConfig,
) -> Result<bool> {
    let fields = if fields.is_empty() {
        K::DEFAULT_FIELDS
    } else {
        fields
    };
    let name = desired.name_any();

    desired.meta_mut().owner_references = Some(vec![owner.clone()]);
    let hash = desired.compute_hash(fields)?;
    desired
        .annotations_mut()
        .insert(ANNOTATION_SPEC_HASH.to_string(), hash.clone());

    let existing = store.get(&name).await.map_err(|source| Error::Store {
        action: "get",
        kind: K::KIND,
        name: name.clone(),
        source,
    })?;

    let Some(existing) = existing else {
        info!(kind = K::KIND, name = %name, "Resource not found, creating");
        retry_on_conflict(retry, "create", || store.create(&desired))
            .await
            .map_err(|e| write_error(e, "create", K::KIND, &name))?;
        return Ok(true);
    };

    if recorded_hash(&existing) == Some(hash.as_str()) {
        debug!(kind = K::KIND, name = %name, "Resource is up to date");
        return Ok(false);
    }

    debug!(kind = K::KIND, name = %name, "Resource changed, updating");
    let mut current = Some(existing);
    retry_on_conflict(retry, "update", || {
        let seed = current.take();
        let desired = &desired;
        let name = name.as_str();
        async move {
            let mut live = match seed {
                Some(obj) => obj,
                None => match store.get(name).await? {
                    Some(obj) => obj,
                    None => return Ok::<K, Error>(store.create(desired).await?),
                },
            };
            live.copy_spec_from(desired, fields)?;
            Ok::<K, Error>(store.replace(name, &live).await?)
        }
    })
    .await
    .map_err(|e| write_error(e, "update", K::KIND, &name))?;

    Ok(true)
}

fn recorded_hash<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_SPEC_HASH))
        .map(String::as_str)
}

fn write_error<E: Into<Error>>(
    e: RetryError<E>,
    action: &'static str,
    kind: &'static str,
    name: &str,
) -> Error {
    match e {
        RetryError::Exhausted { attempts, .. } => Error::ConflictRetriesExhausted {
            kind,
            name: name.to_string(),
            attempts,
        },
        RetryError::Failed(e) => match e.into() {
            Error::Kube(source) => Error::Store {
                action,
                kind,
                name: name.to_string(),
                source,
            },
            other => other,
        },
    }
}

/// Delete an owned object, treating absence as success.
pub async fn delete<K: ManagedResource>(store: &dyn ObjectStore<K>, name: &str) -> Result<()> {
    store.delete(name).await.map_err(|source| Error::Store {
        action: "delete",
        kind: K::KIND,
        name: name.to_string(),
        source,
    })
}
