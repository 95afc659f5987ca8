use crate::workload::{PodTemplated, Workload, WorkloadKey, WorkloadKind};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use kube::api::PostParams;
use kube::{Api, Client};
use std::future::Future;
use thiserror::Error;
use tracing::debug;

static FIELD_MANAGER: &str = "image-clone-controller";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{key} was modified concurrently, resourceVersion {resource_version} is stale")]
    Conflict {
        key: WorkloadKey,
        resource_version: String,
    },
    #[error("Kubernetes API request for {key} failed")]
    Api {
        key: WorkloadKey,
        #[source]
        source: kube::Error,
    },
}

/// Read and write access to workload objects in the cluster.
///
/// `get` returns `Ok(None)` when the object does not exist. `update` must use the
/// resourceVersion carried by the workload and fail with [`StoreError::Conflict`]
/// when it is stale.
pub trait ObjectStore: Send + Sync {
    fn get(
        &self,
        key: &WorkloadKey,
    ) -> impl Future<Output = Result<Option<Workload>, StoreError>> + Send;

    fn update(&self, workload: &Workload) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_typed<K: PodTemplated>(
        &self,
        key: &WorkloadKey,
    ) -> Result<Option<Workload>, StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let object = api.get_opt(&key.name).await.map_err(|source| StoreError::Api {
            key: key.clone(),
            source,
        })?;
        Ok(object.map(PodTemplated::into_workload))
    }

    async fn replace_typed<K: PodTemplated>(
        &self,
        key: &WorkloadKey,
        object: &K,
    ) -> Result<(), StoreError> {
        let api: Api<K> = Api::namespaced(self.client.clone(), &key.namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        debug!("Replacing {} at resourceVersion {:?}", key, object.meta().resource_version);
        match api.replace(&key.name, &params, object).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 409 => Err(StoreError::Conflict {
                key: key.clone(),
                resource_version: object.meta().resource_version.clone().unwrap_or_default(),
            }),
            Err(source) => Err(StoreError::Api {
                key: key.clone(),
                source,
            }),
        }
    }
}

impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &WorkloadKey) -> Result<Option<Workload>, StoreError> {
        match key.kind {
            WorkloadKind::Deployment => self.get_typed::<Deployment>(key).await,
            WorkloadKind::DaemonSet => self.get_typed::<DaemonSet>(key).await,
        }
    }

    async fn update(&self, workload: &Workload) -> Result<(), StoreError> {
        let key = workload.key();
        match workload {
            Workload::Deployment(d) => self.replace_typed(&key, d).await,
            Workload::DaemonSet(ds) => self.replace_typed(&key, ds).await,
        }
    }
}
