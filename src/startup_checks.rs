//! Startup requirement validation for kpod-metrics.
//!
//! Validates privileges and kernel facilities before any probe is loaded.

use nix::unistd::geteuid;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::ebpf::BTF_PATH;

pub const BPF_FS_PATH: &str = "/sys/fs/bpf";

/// Facts discovered while validating.
#[derive(Debug, Clone, Default)]
pub struct Requirements {
    pub root: bool,
    pub btf_present: bool,
    pub kernel_version: Option<String>,
}

/// Validate all runtime requirements
pub fn validate_requirements(
    bpf_enabled: bool,
    cgroup_root: &Path,
) -> Result<Requirements, ValidationError> {
    info!("🔍 Validating runtime requirements...");

    let mut found = Requirements {
        root: check_user_privileges(),
        kernel_version: kernel_version(),
        ..Requirements::default()
    };
    check_cgroup_root(cgroup_root)?;

    if bpf_enabled {
        check_bpf_fs(Path::new(BPF_FS_PATH))?;
        found.btf_present = check_btf(Path::new(BTF_PATH));
    }

    info!("✅ All runtime requirements validated");
    Ok(found)
}

/// Check if running with sufficient privileges
fn check_user_privileges() -> bool {
    let root = geteuid().is_root();
    if !root {
        warn!("⚠️  Not running as root - probe loading will likely fail");
        warn!("   Recommendation: run privileged or grant CAP_BPF and CAP_PERFMON");
    } else {
        info!("✅ Running as root (uid=0)");
    }
    root
}

/// The cgroup hierarchy must be mounted to resolve container cgroup ids.
pub fn check_cgroup_root(root: &Path) -> Result<(), ValidationError> {
    if !root.is_dir() {
        error!("❌ cgroup root {} not found", root.display());
        error!("   Solution: mount the host cgroup filesystem into the container");
        return Err(ValidationError::CgroupRootMissing(
            root.display().to_string(),
        ));
    }
    debug!("cgroup root {} present", root.display());
    Ok(())
}

/// Check BPF filesystem
pub fn check_bpf_fs(path: &Path) -> Result<(), ValidationError> {
    if !path.exists() {
        error!("❌ {} not found - BPF filesystem not mounted", path.display());
        error!("   Solution: mount -t bpf bpf /sys/fs/bpf");
        return Err(ValidationError::BpfFsNotMounted);
    }
    info!("✅ {} is mounted", path.display());
    Ok(())
}

/// BTF presence selects the CO-RE probe variant. Missing BTF is not fatal.
pub fn check_btf(path: &Path) -> bool {
    if path.exists() {
        info!("✅ BTF support available");
        true
    } else {
        warn!("⚠️  {} not found - BTF support missing", path.display());
        warn!("   Falling back to legacy probe objects");
        false
    }
}

fn kernel_version() -> Option<String> {
    let version = fs::read_to_string("/proc/version").ok()?;
    let first = version.lines().next()?.to_string();
    debug!("Kernel version: {}", first);
    Some(first)
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("BPF filesystem not mounted at /sys/fs/bpf")]
    BpfFsNotMounted,

    #[error("cgroup root not found: {0}")]
    CgroupRootMissing(String),
}
