//! Cgroup id to pod/container identity join.
//!
//! Deleted containers are kept in a grace cache for [`GRACE_PERIOD`] so kernel
//! samples that race with pod teardown still resolve. The grace cache is
//! pruned once per collection cycle, never on lookup.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a deleted container stays resolvable.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerIdentity {
    pub pod_uid: String,
    pub container_id: String,
    pub namespace: String,
    pub pod_name: String,
    pub container_name: String,
}

#[derive(Debug, Clone)]
struct GraceEntry {
    identity: ContainerIdentity,
    deleted_at: Instant,
}

/// Concurrent cgroup id → identity map with a deletion grace cache.
#[derive(Debug, Default)]
pub struct CgroupIdentityResolver {
    live: DashMap<u64, ContainerIdentity>,
    grace: DashMap<u64, GraceEntry>,
}

impl CgroupIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert. A re-registered id leaves the grace cache.
    pub fn register(&self, cgroup_id: u64, identity: ContainerIdentity) {
        self.grace.remove(&cgroup_id);
        self.live.insert(cgroup_id, identity);
    }

    /// Live map first, then the grace cache.
    pub fn resolve(&self, cgroup_id: u64) -> Option<ContainerIdentity> {
        if let Some(identity) = self.live.get(&cgroup_id) {
            return Some(identity.clone());
        }
        self.grace.get(&cgroup_id).map(|e| e.identity.clone())
    }

    /// Moves a live entry into the grace cache. Returns the moved identity.
    pub fn on_deleted(&self, cgroup_id: u64) -> Option<ContainerIdentity> {
        self.on_deleted_at(cgroup_id, Instant::now())
    }

    pub fn on_deleted_at(&self, cgroup_id: u64, deleted_at: Instant) -> Option<ContainerIdentity> {
        let (_, identity) = self.live.remove(&cgroup_id)?;
        debug!(
            "Cgroup {} ({}/{}) deleted, entering grace period",
            cgroup_id, identity.namespace, identity.pod_name
        );
        self.grace.insert(
            cgroup_id,
            GraceEntry {
                identity: identity.clone(),
                deleted_at,
            },
        );
        Some(identity)
    }

    /// Removes grace entries older than [`GRACE_PERIOD`].
    pub fn prune_grace_cache(&self) -> usize {
        self.prune_grace_cache_at(Instant::now())
    }

    pub fn prune_grace_cache_at(&self, now: Instant) -> usize {
        self.take_expired_at(now).len()
    }

    /// Prunes like [`prune_grace_cache`](Self::prune_grace_cache) and returns
    /// the removed entries so their per-container state can be cleaned up.
    pub fn take_expired(&self) -> Vec<(u64, ContainerIdentity)> {
        self.take_expired_at(Instant::now())
    }

    pub fn take_expired_at(&self, now: Instant) -> Vec<(u64, ContainerIdentity)> {
        let expired: Vec<u64> = self
            .grace
            .iter()
            .filter(|e| now.saturating_duration_since(e.deleted_at) > GRACE_PERIOD)
            .map(|e| *e.key())
            .collect();

        // The id may have been re-registered since the scan.
        let removed: Vec<(u64, ContainerIdentity)> = expired
            .into_iter()
            .filter_map(|id| {
                self.grace
                    .remove_if(&id, |_, e| {
                        now.saturating_duration_since(e.deleted_at) > GRACE_PERIOD
                    })
                    .map(|(id, e)| (id, e.identity))
            })
            .collect();

        if !removed.is_empty() {
            debug!("Pruned {} expired cgroup identities", removed.len());
        }
        removed
    }

    /// Drops an id from both maps without a grace period.
    pub fn evict(&self, cgroup_id: u64) {
        self.live.remove(&cgroup_id);
        self.grace.remove(&cgroup_id);
    }

    pub fn live_ids(&self) -> Vec<u64> {
        self.live.iter().map(|e| *e.key()).collect()
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    pub fn grace_len(&self) -> usize {
        self.grace.len()
    }
}

/// Pod uid and container id recovered from a cgroup path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupPathIds {
    pub pod_uid: String,
    pub container_id: String,
}

// kubepods-burstable.slice/kubepods-burstable-pod<uid>.slice/cri-containerd-<id>.scope
static SYSTEMD_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"kubepods(?:-(?:burstable|besteffort|guaranteed))?-pod([a-f0-9_]+)\.slice/(?:cri-containerd|docker|crio)-([a-f0-9]+)\.scope$",
    )
    .expect("static regex")
});

// kubepods/burstable/pod<uid>/<id>
static CGROUPFS_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"kubepods/(?:burstable/|besteffort/)?pod([a-z0-9-]+)/([a-z0-9]+)$")
        .expect("static regex")
});

/// Extracts (pod uid, container id) from a systemd-driver or cgroupfs-driver
/// path. The first grammar that matches wins.
pub fn parse_cgroup_path(path: &str) -> Option<CgroupPathIds> {
    if let Some(caps) = SYSTEMD_PATH.captures(path) {
        return Some(CgroupPathIds {
            pod_uid: caps[1].replace('_', "-"),
            container_id: caps[2].to_string(),
        });
    }
    CGROUPFS_PATH.captures(path).map(|caps| CgroupPathIds {
        pod_uid: caps[1].to_string(),
        container_id: caps[2].to_string(),
    })
}
