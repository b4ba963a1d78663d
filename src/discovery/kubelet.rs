//! Pod lists in the kubelet `/pods` document format.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ContainerInfo, DiscoveredPod, NamespaceFilter, PodProvider, QosClass};
use crate::error::DiscoveryError;

const RUNTIME_PREFIXES: &[&str] = &["containerd://", "docker://", "cri-o://"];

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
struct PodMetadata {
    uid: String,
    name: String,
    #[serde(default = "default_namespace")]
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: String,
    qos_class: Option<QosClass>,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerStatus {
    name: String,
    #[serde(rename = "containerID")]
    container_id: Option<String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn strip_runtime_prefix(id: &str) -> &str {
    RUNTIME_PREFIXES
        .iter()
        .find_map(|p| id.strip_prefix(p))
        .unwrap_or(id)
}

/// Parses a kubelet pod list, keeping running pods admitted by `filter`.
/// Containers without an id (not started yet) are skipped, including ids
/// the kubelet reports as an empty string.
pub fn parse_pod_list(json: &str, filter: &NamespaceFilter) -> Result<Vec<DiscoveredPod>, DiscoveryError> {
    let list: PodList = serde_json::from_str(json)?;

    let pods = list
        .items
        .into_iter()
        .filter(|p| p.status.phase == "Running")
        .filter(|p| filter.allows(&p.metadata.namespace))
        .map(|p| DiscoveredPod {
            uid: p.metadata.uid,
            name: p.metadata.name,
            namespace: p.metadata.namespace,
            qos_class: p.status.qos_class.unwrap_or(QosClass::BestEffort),
            containers: p
                .status
                .container_statuses
                .into_iter()
                .filter_map(|c| {
                    let id = c.container_id?;
                    let id = strip_runtime_prefix(&id);
                    if id.is_empty() {
                        return None;
                    }
                    Some(ContainerInfo {
                        name: c.name,
                        container_id: id.to_string(),
                    })
                })
                .collect(),
        })
        .collect();
    Ok(pods)
}

/// Reads the pod list from a file on every call (e.g. a kubelet `/pods`
/// dump refreshed by a sidecar).
pub struct FilePodProvider {
    path: PathBuf,
    filter: NamespaceFilter,
}

impl FilePodProvider {
    pub fn new(path: impl Into<PathBuf>, filter: NamespaceFilter) -> Self {
        Self {
            path: path.into(),
            filter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PodProvider for FilePodProvider {
    fn discovered_pods(&self) -> Result<Vec<DiscoveredPod>, DiscoveryError> {
        let json = fs::read_to_string(&self.path).map_err(|source| DiscoveryError::Read {
            path: self.path.clone(),
            source,
        })?;
        let pods = parse_pod_list(&json, &self.filter)?;
        debug!("Discovered {} running pods from {}", pods.len(), self.path.display());
        Ok(pods)
    }
}

/// Fixed pod set; used when no pod list source is configured.
#[derive(Debug, Default, Clone)]
pub struct StaticPodProvider {
    pods: Vec<DiscoveredPod>,
}

impl StaticPodProvider {
    pub fn new(pods: Vec<DiscoveredPod>) -> Self {
        Self { pods }
    }
}

impl PodProvider for StaticPodProvider {
    fn discovered_pods(&self) -> Result<Vec<DiscoveredPod>, DiscoveryError> {
        Ok(self.pods.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const POD_LIST: &str = r#"{
      "kind": "PodList",
      "items": [
        {
          "metadata": {"uid": "1111-2222", "name": "web-0", "namespace": "shop"},
          "status": {
            "phase": "Running",
            "qosClass": "Burstable",
            "containerStatuses": [
              {"name": "nginx", "containerID": "containerd://abc123"},
              {"name": "init", "containerID": null},
              {"name": "sidecar", "containerID": ""},
              {"name": "waiting", "containerID": "containerd://"}
            ]
          }
        },
        {
          "metadata": {"uid": "3333", "name": "job-1", "namespace": "shop"},
          "status": {"phase": "Succeeded", "qosClass": "BestEffort"}
        },
        {
          "metadata": {"uid": "4444", "name": "coredns", "namespace": "kube-system"},
          "status": {"phase": "Running", "qosClass": "Guaranteed"}
        }
      ]
    }"#;

    #[test]
    fn test_parse_keeps_running_pods() {
        let filter = NamespaceFilter::new(&[], &["kube-system".into()]);
        let pods = parse_pod_list(POD_LIST, &filter).unwrap();

        assert_eq!(pods.len(), 1);
        let pod = &pods[0];
        assert_eq!(pod.name, "web-0");
        assert_eq!(pod.qos_class, QosClass::Burstable);
        assert_eq!(
            pod.containers,
            vec![ContainerInfo {
                name: "nginx".into(),
                container_id: "abc123".into()
            }]
        );
    }

    #[test]
    fn test_parse_invalid_json() {
        let err = parse_pod_list("not json", &NamespaceFilter::default()).unwrap_err();
        assert!(matches!(err, DiscoveryError::Parse(_)));
    }

    #[test]
    fn test_file_provider() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(POD_LIST.as_bytes()).unwrap();

        let provider = FilePodProvider::new(file.path(), NamespaceFilter::default());
        assert_eq!(provider.discovered_pods().unwrap().len(), 2);

        let missing = FilePodProvider::new("/nonexistent/pods.json", NamespaceFilter::default());
        assert!(matches!(
            missing.discovered_pods(),
            Err(DiscoveryError::Read { .. })
        ));
    }
}
