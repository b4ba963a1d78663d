use std::sync::Arc;
use tracing::{debug, trace};

use super::{CgroupPathResolver, PodCgroupTarget, PodProvider};
use crate::error::DiscoveryError;

/// Something that yields the current container targets for one cycle.
pub trait TargetSource: Send + Sync {
    fn resolve_targets(&self) -> Result<Vec<PodCgroupTarget>, DiscoveryError>;
}

/// Joins discovered pods with their container cgroup directories.
pub struct PodCgroupMapper {
    provider: Arc<dyn PodProvider>,
    paths: Arc<dyn CgroupPathResolver>,
    node_name: String,
}

impl PodCgroupMapper {
    pub fn new(
        provider: Arc<dyn PodProvider>,
        paths: Arc<dyn CgroupPathResolver>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            paths,
            node_name: node_name.into(),
        }
    }

    pub fn resolve(&self) -> Result<Vec<PodCgroupTarget>, DiscoveryError> {
        let pods = self.provider.discovered_pods()?;
        let mut targets = Vec::new();

        for pod in &pods {
            let Some(pod_path) = self.paths.resolve_pod_path(&pod.uid, pod.qos_class) else {
                trace!("Pod {}/{} has no cgroup yet", pod.namespace, pod.name);
                continue;
            };
            let dirs = self.paths.list_container_paths(&pod_path);

            for container in &pod.containers {
                let Some(dir) = dirs
                    .iter()
                    .find(|d| ids_match(&container.container_id, &d.container_id))
                else {
                    continue;
                };
                targets.push(PodCgroupTarget {
                    pod_uid: pod.uid.clone(),
                    container_id: container.container_id.clone(),
                    pod_name: pod.name.clone(),
                    namespace: pod.namespace.clone(),
                    container_name: container.name.clone(),
                    cgroup_path: dir.path.clone(),
                    node_name: self.node_name.clone(),
                });
            }
        }

        debug!(
            "Resolved {} container targets from {} pods",
            targets.len(),
            pods.len()
        );
        Ok(targets)
    }
}

/// Runtimes may truncate ids in directory names, so either may be a prefix
/// of the other. An empty id matches nothing.
fn ids_match(container_id: &str, dir_id: &str) -> bool {
    if container_id.is_empty() || dir_id.is_empty() {
        return false;
    }
    container_id.starts_with(dir_id) || dir_id.starts_with(container_id)
}

impl TargetSource for PodCgroupMapper {
    fn resolve_targets(&self) -> Result<Vec<PodCgroupTarget>, DiscoveryError> {
        self.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{
        CgroupfsPathResolver, ContainerInfo, DiscoveredPod, QosClass, StaticPodProvider,
    };
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_mapper_joins_pods_and_dirs() {
        let root = TempDir::new().unwrap();
        let pod_dir = root.path().join("kubepods/burstable/podp1");
        fs::create_dir_all(pod_dir.join("abc123")).unwrap();

        let pods = vec![DiscoveredPod {
            uid: "p1".into(),
            name: "web-0".into(),
            namespace: "shop".into(),
            qos_class: QosClass::Burstable,
            containers: vec![
                ContainerInfo {
                    name: "app".into(),
                    container_id: "abc123".into(),
                },
                ContainerInfo {
                    name: "gone".into(),
                    container_id: "fff".into(),
                },
            ],
        }];

        let mapper = PodCgroupMapper::new(
            Arc::new(StaticPodProvider::new(pods)),
            Arc::new(CgroupfsPathResolver::new(root.path())),
            "node-a",
        );
        let targets = mapper.resolve().unwrap();

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].container_name, "app");
        assert_eq!(targets[0].cgroup_path, pod_dir.join("abc123"));
        assert_eq!(targets[0].node_name, "node-a");
    }

    #[test]
    fn test_empty_container_id_is_not_joined() {
        let root = TempDir::new().unwrap();
        let pod_dir = root.path().join("kubepods/burstable/podp1");
        fs::create_dir_all(pod_dir.join("abc123")).unwrap();

        let pods = vec![DiscoveredPod {
            uid: "p1".into(),
            name: "web-0".into(),
            namespace: "shop".into(),
            qos_class: QosClass::Burstable,
            containers: vec![
                ContainerInfo {
                    name: "app".into(),
                    container_id: "abc123".into(),
                },
                ContainerInfo {
                    name: "sidecar".into(),
                    container_id: String::new(),
                },
            ],
        }];

        let mapper = PodCgroupMapper::new(
            Arc::new(StaticPodProvider::new(pods)),
            Arc::new(CgroupfsPathResolver::new(root.path())),
            "node-a",
        );
        let targets = mapper.resolve().unwrap();

        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].container_name, "app");
    }

    #[test]
    fn test_ids_match_prefixes() {
        assert!(ids_match("abc123", "abc"));
        assert!(ids_match("abc", "abc123"));
        assert!(!ids_match("abc123", "def"));
        assert!(!ids_match("", "abc123"));
        assert!(!ids_match("abc123", ""));
    }
}
