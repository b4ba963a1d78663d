//! Startup estimate of the number of exported series.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery::DiscoveredPod;
use crate::metrics::{LATENCY_BUCKETS, RTT_BUCKETS, SYSCALL_BUCKETS};

/// Estimates above this many series are logged as a warning.
pub const SERIES_WARN_THRESHOLD: usize = 100_000;

/// Series of one histogram label set: buckets, +Inf, sum and count.
fn histogram_series(buckets: &[f64]) -> usize {
    buckets.len() + 3
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitEstimate {
    pub unit: &'static str,
    pub per_container: usize,
    pub series: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardinalityEstimate {
    pub containers: usize,
    pub units: Vec<UnitEstimate>,
    pub total: usize,
}

impl CardinalityEstimate {
    pub fn exceeds_threshold(&self) -> bool {
        self.total > SERIES_WARN_THRESHOLD
    }

    pub fn log(&self) {
        for unit in &self.units {
            info!(
                "Cardinality {}: {} series ({} per container)",
                unit.unit, unit.series, unit.per_container
            );
        }
        if self.exceeds_threshold() {
            warn!(
                "⚠️  Estimated {} series for {} containers exceeds {}",
                self.total, self.containers, SERIES_WARN_THRESHOLD
            );
            warn!("   Consider the minimal profile or a namespace filter");
        } else {
            info!(
                "Estimated {} series for {} containers",
                self.total, self.containers
            );
        }
    }
}

/// Per-unit series estimate for the enabled programs and the given pods.
pub fn estimate_cardinality(config: &Config, pods: &[DiscoveredPod]) -> CardinalityEstimate {
    let containers: usize = pods.iter().map(|p| p.containers.len()).sum();
    let programs = config.enabled_programs();
    let tracked_syscalls = config.syscall.tracked_syscalls.len();

    let candidates: [(&'static str, &str, usize); 10] = [
        ("cpu", "cpu_sched", histogram_series(LATENCY_BUCKETS) + 1),
        ("network", "net", 5 + histogram_series(RTT_BUCKETS)),
        ("memory", "mem", 2),
        (
            "syscall",
            "syscall",
            tracked_syscalls * (2 + histogram_series(SYSCALL_BUCKETS)),
        ),
        ("biolatency", "biolatency", histogram_series(LATENCY_BUCKETS) + 1),
        ("cachestat", "cachestat", 4),
        ("tcpdrop", "tcpdrop", 1),
        ("hardirqs", "hardirqs", histogram_series(LATENCY_BUCKETS) + 1),
        ("softirqs", "softirqs", histogram_series(LATENCY_BUCKETS)),
        ("execsnoop", "execsnoop", 3),
    ];

    let units: Vec<UnitEstimate> = candidates
        .into_iter()
        .filter(|(unit, program, _)| programs.contains(program) && config.collector_enabled(unit))
        .map(|(unit, _, per_container)| UnitEstimate {
            unit,
            per_container,
            series: per_container * containers,
        })
        .collect();

    let total = units.iter().map(|u| u.series).sum();
    CardinalityEstimate {
        containers,
        units,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ContainerInfo, QosClass};

    fn pods(n: usize, containers: usize) -> Vec<DiscoveredPod> {
        (0..n)
            .map(|i| DiscoveredPod {
                uid: format!("uid-{i}"),
                name: format!("pod-{i}"),
                namespace: "default".into(),
                qos_class: QosClass::Burstable,
                containers: (0..containers)
                    .map(|c| ContainerInfo {
                        name: format!("c{c}"),
                        container_id: format!("{i:04x}{c:04x}"),
                    })
                    .collect(),
            })
            .collect()
    }

    #[test]
    fn test_minimal_profile_estimate() {
        let mut config = Config::default();
        config.profile = "minimal".into();
        config.apply_profile().unwrap();

        let estimate = estimate_cardinality(&config, &pods(10, 2));
        let units: Vec<&str> = estimate.units.iter().map(|u| u.unit).collect();
        assert_eq!(units, vec!["cpu", "memory"]);
        assert_eq!(estimate.containers, 20);
        // cpu: 7 buckets + 3 + 1 counter; memory: 2 counters
        assert_eq!(estimate.total, 20 * (11 + 2));
        assert!(!estimate.exceeds_threshold());
    }

    #[test]
    fn test_syscall_tracking_dominates() {
        let mut config = Config::default();
        config.profile = "comprehensive".into();
        config.apply_profile().unwrap();

        let estimate = estimate_cardinality(&config, &pods(500, 3));
        let syscall = estimate.units.iter().find(|u| u.unit == "syscall").unwrap();
        assert_eq!(syscall.per_container, 10 * (2 + 12));
        assert!(estimate.exceeds_threshold());
    }

    #[test]
    fn test_disabled_collector_is_not_counted() {
        let mut config = Config::default();
        config.collectors.insert("cpu".into(), false);
        let estimate = estimate_cardinality(&config, &pods(1, 1));
        assert!(estimate.units.iter().all(|u| u.unit != "cpu"));
    }
}
