//! Narrow interface to the Kubernetes object store.
//!
//! Reconciliation only needs get, list-by-label, create, replace and delete
//! of versioned objects in one namespace. [`KubeStore`] implements that over
//! [`kube::Api`]; tests substitute an in-memory implementation.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::context::FIELD_MANAGER;
use crate::crd::KeeperCluster;

/// Versioned object access scoped to one namespace.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Fetch by name; `None` when the object does not exist.
    async fn get(&self, name: &str) -> Result<Option<K>, kube::Error>;

    async fn create(&self, obj: &K) -> Result<K, kube::Error>;

    /// Replace the object. Fails with 409 when `obj` carries a stale resource version.
    async fn replace(&self, name: &str, obj: &K) -> Result<K, kube::Error>;

    /// Delete by name. Deleting a missing object succeeds.
    async fn delete(&self, name: &str) -> Result<(), kube::Error>;

    async fn list(&self, label_selector: &str) -> Result<Vec<K>, kube::Error>;
}

/// [`ObjectStore`] backed by the Kubernetes API.
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    async fn get(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.api.get_opt(name).await
    }

    async fn create(&self, obj: &K) -> Result<K, kube::Error> {
        self.api.create(&post_params(), obj).await
    }

    async fn replace(&self, name: &str, obj: &K) -> Result<K, kube::Error> {
        self.api.replace(name, &post_params(), obj).await
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, label_selector: &str) -> Result<Vec<K>, kube::Error> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api.list(&params).await?.items)
    }
}

/// Every store one reconciliation pass touches.
#[derive(Clone)]
pub struct Stores {
    pub statefulsets: Arc<dyn ObjectStore<StatefulSet>>,
    pub config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    pub services: Arc<dyn ObjectStore<Service>>,
    pub pod_disruption_budgets: Arc<dyn ObjectStore<PodDisruptionBudget>>,
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    pub pods: Arc<dyn ObjectStore<Pod>>,
    pub keeper_clusters: Arc<dyn ObjectStore<KeeperCluster>>,
}

impl Stores {
    pub fn namespaced(client: Client, namespace: &str) -> Self {
        Self {
            statefulsets: Arc::new(KubeStore::namespaced(client.clone(), namespace)),
            config_maps: Arc::new(KubeStore::namespaced(client.clone(), namespace)),
            services: Arc::new(KubeStore::namespaced(client.clone(), namespace)),
            pod_disruption_budgets: Arc::new(KubeStore::namespaced(client.clone(), namespace)),
            secrets: Arc::new(KubeStore::namespaced(client.clone(), namespace)),
            pods: Arc::new(KubeStore::namespaced(client.clone(), namespace)),
            keeper_clusters: Arc::new(KubeStore::namespaced(client, namespace)),
        }
    }
}
