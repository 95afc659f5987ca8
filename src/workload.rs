use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Container, PodSpec};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
}

impl WorkloadKind {
    pub const ALL: [WorkloadKind; 2] = [WorkloadKind::Deployment, WorkloadKind::DaemonSet];

    /// `self` first, then every other kind in declaration order.
    pub fn lookup_order(self) -> impl Iterator<Item = WorkloadKind> {
        std::iter::once(self).chain(Self::ALL.into_iter().filter(move |kind| *kind != self))
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::DaemonSet => write!(f, "DaemonSet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadKey {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(kind: WorkloadKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn for_object<K: PodTemplated>(object: &K) -> Self {
        Self::new(K::KIND, object.namespace().unwrap_or_default(), object.name_any())
    }

    pub fn with_kind(&self, kind: WorkloadKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A namespaced workload whose containers live in a pod template.
pub trait PodTemplated
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + Serialize
        + DeserializeOwned
        + 'static,
{
    const KIND: WorkloadKind;

    fn pod_spec(&self) -> Option<&PodSpec>;

    /// Creates an empty pod spec if the object has none.
    fn pod_spec_mut(&mut self) -> &mut PodSpec;

    fn into_workload(self) -> Workload;
}

impl PodTemplated for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> &mut PodSpec {
        self.spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default)
    }

    fn into_workload(self) -> Workload {
        Workload::Deployment(self)
    }
}

impl PodTemplated for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }

    fn pod_spec_mut(&mut self) -> &mut PodSpec {
        self.spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default)
    }

    fn into_workload(self) -> Workload {
        Workload::DaemonSet(self)
    }
}

/// A workload as read from the cluster, owned by a single reconcile.
#[derive(Debug, Clone)]
pub enum Workload {
    Deployment(Deployment),
    DaemonSet(DaemonSet),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::DaemonSet(_) => WorkloadKind::DaemonSet,
        }
    }

    pub fn key(&self) -> WorkloadKey {
        match self {
            Workload::Deployment(d) => WorkloadKey::for_object(d),
            Workload::DaemonSet(ds) => WorkloadKey::for_object(ds),
        }
    }

    pub fn resource_version(&self) -> Option<String> {
        match self {
            Workload::Deployment(d) => d.resource_version(),
            Workload::DaemonSet(ds) => ds.resource_version(),
        }
    }

    pub fn containers(&self) -> &[Container] {
        let pod_spec = match self {
            Workload::Deployment(d) => d.pod_spec(),
            Workload::DaemonSet(ds) => ds.pod_spec(),
        };
        pod_spec.map(|ps| ps.containers.as_slice()).unwrap_or_default()
    }

    pub fn set_containers(&mut self, containers: Vec<Container>) {
        let pod_spec = match self {
            Workload::Deployment(d) => d.pod_spec_mut(),
            Workload::DaemonSet(ds) => ds.pod_spec_mut(),
        };
        pod_spec.containers = containers;
    }
}
