//! Reconciles discovery snapshots into the identity resolver.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::PodCgroupTarget;
use crate::identity::{CgroupIdentityResolver, ContainerIdentity};

#[derive(Debug, Default)]
pub struct SyncReport {
    pub registered: usize,
    /// Cgroup ids that disappeared since the previous snapshot.
    pub deleted: Vec<(u64, ContainerIdentity)>,
}

/// Cgroup id of a directory: its inode number.
pub fn cgroup_id_of(path: &Path) -> std::io::Result<u64> {
    Ok(fs::metadata(path)?.ino())
}

/// Tracks which cgroup ids the previous snapshot registered so vanished
/// containers can be moved to the grace cache.
pub struct IdentitySync {
    resolver: Arc<CgroupIdentityResolver>,
    known: Mutex<HashSet<u64>>,
}

impl IdentitySync {
    pub fn new(resolver: Arc<CgroupIdentityResolver>) -> Self {
        Self {
            resolver,
            known: Mutex::new(HashSet::new()),
        }
    }

    pub fn resolver(&self) -> &Arc<CgroupIdentityResolver> {
        &self.resolver
    }

    /// Registers every target and marks ids missing from `targets` deleted.
    ///
    /// Only call with a successful discovery snapshot; an empty list from a
    /// failed discovery would mark every container deleted.
    pub fn reconcile(&self, targets: &[PodCgroupTarget]) -> SyncReport {
        let mut report = SyncReport::default();
        let mut current = HashSet::with_capacity(targets.len());

        for target in targets {
            let cgroup_id = match cgroup_id_of(&target.cgroup_path) {
                Ok(id) => id,
                Err(e) => {
                    // Container exited between listing and stat.
                    debug!("Skipping {}: {}", target.cgroup_path.display(), e);
                    continue;
                }
            };
            self.resolver.register(
                cgroup_id,
                ContainerIdentity {
                    pod_uid: target.pod_uid.clone(),
                    container_id: target.container_id.clone(),
                    namespace: target.namespace.clone(),
                    pod_name: target.pod_name.clone(),
                    container_name: target.container_name.clone(),
                },
            );
            current.insert(cgroup_id);
            report.registered += 1;
        }

        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        for gone in known.difference(&current) {
            match self.resolver.on_deleted(*gone) {
                Some(identity) => report.deleted.push((*gone, identity)),
                None => warn!("Cgroup {} vanished but was not registered", gone),
            }
        }
        *known = current;

        if !report.deleted.is_empty() {
            info!("{} containers removed since last discovery", report.deleted.len());
        }
        report
    }
}
