//! Pod discovery and pod → cgroup target resolution.
//!
//! Discovery itself (kubelet API, watch streams) is an outside concern. The
//! agent consumes a [`PodProvider`] snapshot and joins it against the cgroup
//! filesystem to produce [`PodCgroupTarget`]s.

pub mod cgroup_path;
pub mod kubelet;
pub mod mapper;
pub mod sync;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::DiscoveryError;

pub use cgroup_path::{CgroupPathResolver, CgroupfsPathResolver, ContainerPath};
pub use kubelet::{FilePodProvider, StaticPodProvider};
pub use mapper::{PodCgroupMapper, TargetSource};
pub use sync::{IdentitySync, SyncReport};

/// Kubernetes pod QoS tier; selects the cgroup parent directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

impl QosClass {
    /// Directory/slice fragment used by the kubelet (`burstable`, `besteffort`).
    pub fn slice_name(&self) -> &'static str {
        match self {
            QosClass::Guaranteed => "guaranteed",
            QosClass::Burstable => "burstable",
            QosClass::BestEffort => "besteffort",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub name: String,
    pub container_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPod {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub qos_class: QosClass,
    pub containers: Vec<ContainerInfo>,
}

/// One container resolved to its cgroup directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodCgroupTarget {
    pub pod_uid: String,
    pub container_id: String,
    pub pod_name: String,
    pub namespace: String,
    pub container_name: String,
    pub cgroup_path: PathBuf,
    pub node_name: String,
}

/// Source of the current running pod set on this node.
pub trait PodProvider: Send + Sync {
    fn discovered_pods(&self) -> Result<Vec<DiscoveredPod>, DiscoveryError>;
}

/// Namespace include/exclude filter. An empty include list admits all.
#[derive(Debug, Clone, Default)]
pub struct NamespaceFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
}

impl NamespaceFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        Self {
            include: include.iter().cloned().collect(),
            exclude: exclude.iter().cloned().collect(),
        }
    }

    pub fn allows(&self, namespace: &str) -> bool {
        if self.exclude.contains(namespace) {
            return false;
        }
        self.include.is_empty() || self.include.contains(namespace)
    }
}
