//! Locating pod and container cgroup directories.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

use super::QosClass;

const CONTAINER_PREFIXES: &[&str] = &["cri-containerd-", "docker-", "crio-"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPath {
    pub container_id: String,
    pub path: PathBuf,
}

pub trait CgroupPathResolver: Send + Sync {
    /// Directory of the pod's cgroup, if it exists.
    fn resolve_pod_path(&self, pod_uid: &str, qos: QosClass) -> Option<PathBuf>;

    /// Container directories directly below a pod directory.
    fn list_container_paths(&self, pod_path: &Path) -> Vec<ContainerPath>;
}

/// Resolver over a mounted cgroup v2 hierarchy supporting both the systemd
/// and cgroupfs kubelet drivers.
#[derive(Debug, Clone)]
pub struct CgroupfsPathResolver {
    root: PathBuf,
}

impl CgroupfsPathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, pod_uid: &str, qos: QosClass) -> [PathBuf; 2] {
        let systemd = {
            let uid = pod_uid.replace('-', "_");
            let base = self.root.join("kubepods.slice");
            match qos {
                QosClass::Guaranteed => base.join(format!("kubepods-pod{uid}.slice")),
                _ => {
                    let q = qos.slice_name();
                    base.join(format!("kubepods-{q}.slice"))
                        .join(format!("kubepods-{q}-pod{uid}.slice"))
                }
            }
        };
        let cgroupfs = {
            let base = self.root.join("kubepods");
            match qos {
                QosClass::Guaranteed => base.join(format!("pod{pod_uid}")),
                _ => base.join(qos.slice_name()).join(format!("pod{pod_uid}")),
            }
        };
        [systemd, cgroupfs]
    }
}

/// Container id from a container directory name, or `None` for entries that
/// are not container scopes.
pub fn container_id_from_dir(name: &str) -> Option<String> {
    let trimmed = name.strip_suffix(".scope").unwrap_or(name);
    let id = CONTAINER_PREFIXES
        .iter()
        .find_map(|p| trimmed.strip_prefix(p))
        .unwrap_or(trimmed);

    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(id.to_string())
}

impl CgroupPathResolver for CgroupfsPathResolver {
    fn resolve_pod_path(&self, pod_uid: &str, qos: QosClass) -> Option<PathBuf> {
        let found = self.candidates(pod_uid, qos).into_iter().find(|p| p.is_dir());
        if found.is_none() {
            trace!("No cgroup directory for pod {} ({:?})", pod_uid, qos);
        }
        found
    }

    fn list_container_paths(&self, pod_path: &Path) -> Vec<ContainerPath> {
        let Ok(entries) = fs::read_dir(pod_path) else {
            return Vec::new();
        };

        let mut out: Vec<ContainerPath> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| {
                let name = e.file_name();
                let id = container_id_from_dir(name.to_str()?)?;
                Some(ContainerPath {
                    container_id: id,
                    path: e.path(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_container_dir_names() {
        assert_eq!(
            container_id_from_dir("cri-containerd-deadbeef.scope").as_deref(),
            Some("deadbeef")
        );
        assert_eq!(container_id_from_dir("docker-abc.scope").as_deref(), Some("abc"));
        assert_eq!(container_id_from_dir("crio-0f0f.scope").as_deref(), Some("0f0f"));
        assert_eq!(container_id_from_dir("abc123").as_deref(), Some("abc123"));
        assert_eq!(container_id_from_dir("init.scope.d"), None);
    }

    #[test]
    fn test_resolve_systemd_layout() {
        let root = TempDir::new().unwrap();
        let pod = root
            .path()
            .join("kubepods.slice/kubepods-burstable.slice/kubepods-burstable-pod11_22.slice");
        fs::create_dir_all(pod.join("cri-containerd-aaa.scope")).unwrap();
        fs::create_dir_all(pod.join("cri-containerd-bbb.scope")).unwrap();
        fs::write(pod.join("cgroup.procs"), "").unwrap();

        let resolver = CgroupfsPathResolver::new(root.path());
        let found = resolver.resolve_pod_path("11-22", QosClass::Burstable).unwrap();
        assert_eq!(found, pod);

        let containers = resolver.list_container_paths(&found);
        let ids: Vec<&str> = containers.iter().map(|c| c.container_id.as_str()).collect();
        assert_eq!(ids, vec!["aaa", "bbb"]);
    }

    #[test]
    fn test_resolve_guaranteed_and_cgroupfs() {
        let root = TempDir::new().unwrap();
        let guaranteed = root.path().join("kubepods.slice/kubepods-pod99.slice");
        let cgroupfs = root.path().join("kubepods/besteffort/pod77");
        fs::create_dir_all(&guaranteed).unwrap();
        fs::create_dir_all(&cgroupfs).unwrap();

        let resolver = CgroupfsPathResolver::new(root.path());
        assert_eq!(
            resolver.resolve_pod_path("99", QosClass::Guaranteed),
            Some(guaranteed)
        );
        assert_eq!(
            resolver.resolve_pod_path("77", QosClass::BestEffort),
            Some(cgroupfs)
        );
        assert_eq!(resolver.resolve_pod_path("00", QosClass::Burstable), None);
    }
}
