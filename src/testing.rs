//! In-memory fakes of the cluster and registry used by unit tests.

use crate::filter::NamespaceFilter;
use crate::image_reference::ImageReference;
use crate::mirror::MirrorConfig;
use crate::registry::{Credentials, RegistryClient, RegistryError};
use crate::scope::OperationScope;
use crate::secret_string::SecretString;
use crate::store::{ObjectStore, StoreError};
use crate::workload::{Workload, WorkloadKey};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub fn mirror_config(target_registry: &str) -> MirrorConfig {
    MirrorConfig {
        target_registry: target_registry.to_string(),
        credentials: Credentials {
            username: "mirror-bot".to_string(),
            password: SecretString::new("secret"),
        },
        namespaces: NamespaceFilter::default(),
    }
}

pub fn scope() -> OperationScope {
    scope_with_timeout(Duration::from_secs(5))
}

pub fn scope_with_timeout(timeout: Duration) -> OperationScope {
    OperationScope::new(CancellationToken::new(), timeout)
}

fn pod_template(images: &[&str]) -> serde_json::Value {
    let containers: Vec<_> = images
        .iter()
        .enumerate()
        .map(|(i, image)| {
            json!({
                "name": format!("c{}", i),
                "image": image,
                "imagePullPolicy": "IfNotPresent",
                "ports": [{ "containerPort": 8080 }],
            })
        })
        .collect();
    json!({
        "metadata": { "labels": { "app": "test" } },
        "spec": { "containers": containers },
    })
}

pub fn deployment(namespace: &str, name: &str, images: &[&str]) -> Deployment {
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": namespace, "resourceVersion": "1" },
        "spec": {
            "replicas": 2,
            "selector": { "matchLabels": { "app": "test" } },
            "template": pod_template(images),
        },
    }))
    .expect("valid Deployment fixture")
}

pub fn daemon_set(namespace: &str, name: &str, images: &[&str]) -> DaemonSet {
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": { "name": name, "namespace": namespace, "resourceVersion": "1" },
        "spec": {
            "selector": { "matchLabels": { "app": "test" } },
            "template": pod_template(images),
        },
    }))
    .expect("valid DaemonSet fixture")
}

pub fn images_of(workload: &Workload) -> Vec<String> {
    workload
        .containers()
        .iter()
        .filter_map(|c| c.image.clone())
        .collect()
}

#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<HashMap<WorkloadKey, Workload>>,
    gets: Mutex<Vec<WorkloadKey>>,
    updates: Mutex<Vec<Workload>>,
    conflict: bool,
    apply_updates: bool,
}

impl FakeStore {
    pub fn with(workload: Workload) -> Self {
        Self::with_all([workload])
    }

    pub fn with_all(workloads: impl IntoIterator<Item = Workload>) -> Self {
        let store = Self::default();
        store
            .objects
            .lock()
            .unwrap()
            .extend(workloads.into_iter().map(|w| (w.key(), w)));
        store
    }

    /// Every update fails with a conflict.
    pub fn conflicting(mut self) -> Self {
        self.conflict = true;
        self
    }

    /// Successful updates replace the stored object.
    pub fn applying_updates(mut self) -> Self {
        self.apply_updates = true;
        self
    }

    pub fn stored(&self, key: &WorkloadKey) -> Option<Workload> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn gets(&self) -> Vec<WorkloadKey> {
        self.gets.lock().unwrap().clone()
    }

    pub fn updates(&self) -> Vec<Workload> {
        self.updates.lock().unwrap().clone()
    }
}

impl ObjectStore for FakeStore {
    async fn get(&self, key: &WorkloadKey) -> Result<Option<Workload>, StoreError> {
        self.gets.lock().unwrap().push(key.clone());
        Ok(self.stored(key))
    }

    async fn update(&self, workload: &Workload) -> Result<(), StoreError> {
        self.updates.lock().unwrap().push(workload.clone());
        if self.conflict {
            return Err(StoreError::Conflict {
                key: workload.key(),
                resource_version: workload.resource_version().unwrap_or_default(),
            });
        }
        if self.apply_updates {
            self.objects
                .lock()
                .unwrap()
                .insert(workload.key(), workload.clone());
        }
        Ok(())
    }
}

#[derive(Default, Clone, Copy)]
enum Behaviour {
    #[default]
    Succeed,
    FailPull,
    FailPush,
    HangPull,
}

/// Registry whose "image" is the source reference text.
#[derive(Default)]
pub struct FakeRegistry {
    pulls: Mutex<Vec<String>>,
    pushes: Mutex<Vec<(String, String)>>,
    behaviour: Behaviour,
}

impl FakeRegistry {
    fn behaving(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            ..Default::default()
        }
    }

    pub fn failing_pull() -> Self {
        Self::behaving(Behaviour::FailPull)
    }

    pub fn failing_push() -> Self {
        Self::behaving(Behaviour::FailPush)
    }

    pub fn hanging_pull() -> Self {
        Self::behaving(Behaviour::HangPull)
    }

    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }

    /// Successful pushes as `(source, target)` pairs.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.pushes.lock().unwrap().clone()
    }
}

impl RegistryClient for FakeRegistry {
    type Image = String;

    async fn pull(&self, reference: &ImageReference) -> Result<String, RegistryError> {
        self.pulls.lock().unwrap().push(reference.to_string());
        match self.behaviour {
            Behaviour::FailPull => Err(RegistryError::Pull {
                reference: reference.to_string(),
                message: "manifest unknown".to_string(),
            }),
            Behaviour::HangPull => std::future::pending().await,
            _ => Ok(reference.to_string()),
        }
    }

    async fn push(
        &self,
        image: String,
        target: &ImageReference,
        credentials: &Credentials,
    ) -> Result<(), RegistryError> {
        assert_eq!(credentials.username, "mirror-bot");
        if let Behaviour::FailPush = self.behaviour {
            return Err(RegistryError::Push {
                reference: target.to_string(),
                message: "connection reset by peer".to_string(),
            });
        }
        self.pushes.lock().unwrap().push((image, target.to_string()));
        Ok(())
    }
}
