//! Per-container latency and error counts of a tracked syscall set.
//!
//! The kernel side only records syscalls present in `tracked_syscalls`, which
//! is populated once after the program loads.

use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{CollectionUnit, CollectorContext};
use crate::error::{CollectorError, MapError};
use crate::snapshot::decode::{Record, SyscallKey, SyscallStatsRecord};
use crate::snapshot::TableSource;

pub const PROGRAM: &str = "syscall";
pub const STATS_TABLE: &str = "syscall_stats_map";
pub const TRACKED_TABLE: &str = "tracked_syscalls";

/// x86_64 syscall numbers with stable names.
pub const KNOWN_SYSCALLS: &[(u32, &str)] = &[
    (0, "read"),
    (1, "write"),
    (2, "open"),
    (3, "close"),
    (42, "connect"),
    (43, "accept"),
    (44, "sendto"),
    (45, "recvfrom"),
    (46, "sendmsg"),
    (47, "recvmsg"),
    (202, "futex"),
    (232, "epoll_wait"),
    (257, "openat"),
    (288, "accept4"),
];

/// Set tracked by the comprehensive profile.
pub const DEFAULT_TRACKED_SYSCALLS: &[&str] = &[
    "read", "write", "openat", "close", "connect", "accept4", "sendto", "recvfrom", "futex",
    "epoll_wait",
];

pub fn syscall_name(nr: u32) -> Cow<'static, str> {
    KNOWN_SYSCALLS
        .iter()
        .find(|(n, _)| *n == nr)
        .map(|(_, name)| Cow::Borrowed(*name))
        .unwrap_or_else(|| Cow::Owned(format!("syscall_{nr}")))
}

pub fn syscall_number(name: &str) -> Option<u32> {
    KNOWN_SYSCALLS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(nr, _)| *nr)
}

/// Writes the configured syscall numbers into the kernel filter table.
/// Unknown names are skipped with a warning. Returns the number written.
pub fn populate_tracked_syscalls(
    tables: &dyn TableSource,
    names: &[String],
) -> Result<usize, MapError> {
    let table = tables.table(PROGRAM, TRACKED_TABLE)?;
    let mut written = 0;
    for name in names {
        let Some(nr) = syscall_number(name) else {
            warn!("Unknown syscall '{}' not tracked", name);
            continue;
        };
        table.update(&nr.to_le_bytes(), &[1u8])?;
        written += 1;
    }
    debug!("Tracking {} syscalls", written);
    Ok(written)
}

pub struct SyscallCollector {
    ctx: Arc<CollectorContext>,
}

impl SyscallCollector {
    pub fn new(ctx: Arc<CollectorContext>) -> Self {
        Self { ctx }
    }
}

impl CollectionUnit for SyscallCollector {
    fn name(&self) -> &str {
        "syscall"
    }

    fn collect(&self) -> Result<(), CollectorError> {
        let Some(entries) = self.ctx.drain_table(PROGRAM, STATS_TABLE)? else {
            return Ok(());
        };
        let m = &self.ctx.metrics;

        for (key, value) in entries {
            let key = SyscallKey::decode(&key)?;
            let Some(identity) = self.ctx.identities.resolve(key.cgroup_id) else {
                continue;
            };
            let stats = SyscallStatsRecord::decode(&value)?;
            let name = syscall_name(key.syscall_nr);
            let [ns, pod, container, node] = self.ctx.labels(&identity);
            let labels = [ns, pod, container, node, name.as_ref()];

            m.syscall_count_total
                .with_label_values(&labels)
                .inc_by(stats.count);
            m.syscall_errors_total
                .with_label_values(&labels)
                .inc_by(stats.error_count);
            if let Some(avg) = stats.average_latency_seconds() {
                m.syscall_latency_seconds
                    .with_label_values(&labels)
                    .observe(avg);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::snapshot::decode::MAX_SLOTS;

    #[test]
    fn test_syscall_names() {
        assert_eq!(syscall_name(257), "openat");
        assert_eq!(syscall_name(999), "syscall_999");
        assert_eq!(syscall_number("futex"), Some(202));
        assert_eq!(syscall_number("frobnicate"), None);
        for name in DEFAULT_TRACKED_SYSCALLS {
            assert!(syscall_number(name).is_some(), "{name}");
        }
    }

    #[test]
    fn test_populate_tracked_syscalls() {
        let f = fixture();
        let tracked = f.tables.add(PROGRAM, TRACKED_TABLE, 4, 1);
        f.tables.add(PROGRAM, STATS_TABLE, 16, SyscallStatsRecord::SIZE);

        let written = populate_tracked_syscalls(
            f.tables.as_ref(),
            &["read".into(), "bogus".into(), "openat".into()],
        )
        .unwrap();

        assert_eq!(written, 2);
        assert!(tracked.contains(&0u32.to_le_bytes()));
        assert!(tracked.contains(&257u32.to_le_bytes()));
    }

    #[test]
    fn test_syscall_collect_labels_by_name() {
        let f = fixture();
        f.identities.register(4, identity("web"));
        let stats = f.tables.add(PROGRAM, STATS_TABLE, 16, SyscallStatsRecord::SIZE);

        let record = SyscallStatsRecord {
            count: 10,
            error_count: 3,
            latency_sum_ns: 10_000,
            latency_slots: [0; MAX_SLOTS],
        };
        for nr in [0u32, 257] {
            let key = SyscallKey {
                cgroup_id: 4,
                syscall_nr: nr,
            };
            stats.insert(&key.encode(), &record.encode());
        }

        SyscallCollector::new(Arc::clone(&f.ctx)).collect().unwrap();

        let m = &f.ctx.metrics;
        let read = m
            .syscall_errors_total
            .with_label_values(&["default", "web", "app", "node-a", "read"])
            .get();
        let openat = m
            .syscall_count_total
            .with_label_values(&["default", "web", "app", "node-a", "openat"])
            .get();
        assert_eq!((read, openat), (3, 10));
        assert!(stats.is_empty());
    }
}
