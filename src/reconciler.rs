use crate::mirror::{MirrorConfig, MirrorError, mirror_image};
use crate::registry::RegistryClient;
use crate::scope::{Interrupted, OperationScope};
use crate::store::{ObjectStore, StoreError};
use crate::workload::{Workload, WorkloadKey};
use k8s_openapi::api::core::v1::Container;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// How a successful reconcile ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The workload no longer exists.
    Skipped,
    /// Every image already points at the backup registry.
    UpToDate,
    /// Images were mirrored and the workload was updated.
    Updated,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to mirror image {image:?} of container {container} in {key}")]
    Mirror {
        key: WorkloadKey,
        container: String,
        image: String,
        #[source]
        source: MirrorError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("request for {key} was interrupted")]
    Interrupted {
        key: WorkloadKey,
        #[source]
        source: Interrupted,
    },
}

impl ReconcileError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ReconcileError::Store(StoreError::Conflict { .. }))
    }
}

/// Brings one workload's container images into the backup registry.
///
/// Holds no per-workload state, so reconciles of different keys may run concurrently.
pub struct Reconciler<S, R> {
    store: S,
    registry: R,
    config: Arc<MirrorConfig>,
}

impl<S: ObjectStore, R: RegistryClient> Reconciler<S, R> {
    pub fn new(store: S, registry: R, config: Arc<MirrorConfig>) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn reconcile(
        &self,
        key: &WorkloadKey,
        scope: &OperationScope,
    ) -> Result<Outcome, ReconcileError> {
        let Some(mut workload) = self.fetch(key, scope).await? else {
            info!("{} no longer exists, nothing to reconcile", key);
            return Ok(Outcome::Skipped);
        };
        let key = workload.key();

        // All or nothing: the first failing container aborts the whole reconcile
        let mut containers = Vec::with_capacity(workload.containers().len());
        let mut changed = false;
        for container in workload.containers() {
            let mirrored = self.mirror_container(&key, container, scope).await?;
            changed |= mirrored.image != container.image;
            containers.push(mirrored);
        }

        if !changed {
            debug!("All images of {} are already mirrored", key);
            return Ok(Outcome::UpToDate);
        }

        workload.set_containers(containers);
        debug!(
            "Updating {} at resourceVersion {:?}",
            key,
            workload.resource_version()
        );
        scope
            .run(self.store.update(&workload))
            .await
            .map_err(|source| ReconcileError::Interrupted {
                key: key.clone(),
                source,
            })??;

        info!("Updated {} to use mirrored images", key);
        Ok(Outcome::Updated)
    }

    /// Loads the workload under its own kind, falling back to the other kinds.
    async fn fetch(
        &self,
        key: &WorkloadKey,
        scope: &OperationScope,
    ) -> Result<Option<Workload>, ReconcileError> {
        for kind in key.kind.lookup_order() {
            let candidate = key.with_kind(kind);
            let found = scope
                .run(self.store.get(&candidate))
                .await
                .map_err(|source| ReconcileError::Interrupted {
                    key: candidate.clone(),
                    source,
                })??;
            match found {
                Some(workload) => return Ok(Some(workload)),
                None => debug!("{} not found", candidate),
            }
        }
        Ok(None)
    }

    async fn mirror_container(
        &self,
        key: &WorkloadKey,
        container: &Container,
        scope: &OperationScope,
    ) -> Result<Container, ReconcileError> {
        let Some(image) = container.image.as_deref() else {
            debug!("Container {} in {} has no image", container.name, key);
            return Ok(container.clone());
        };

        let mirrored = mirror_image(image, &self.config, &self.registry, scope)
            .await
            .map_err(|source| ReconcileError::Mirror {
                key: key.clone(),
                container: container.name.clone(),
                image: image.to_string(),
                source,
            })?;

        Ok(Container {
            image: Some(mirrored),
            ..container.clone()
        })
    }
}
