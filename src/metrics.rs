//! Prometheus metrics definitions for kpod-metrics.
//!
//! Per-container series carry `namespace, pod, container, node`. Agent
//! self-metrics (cycle timing, program loading) carry no pod labels.

use prometheus::core::Collector;
use prometheus::{
    Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry,
};

use crate::identity::ContainerIdentity;

pub const POD_LABELS: &[&str] = &["namespace", "pod", "container", "node"];
pub const SYSCALL_LABELS: &[&str] = &["namespace", "pod", "container", "node", "syscall"];

/// Sub-millisecond to one-second buckets for averaged kernel latencies.
pub const LATENCY_BUCKETS: &[f64] = &[1e-6, 1e-5, 1e-4, 1e-3, 1e-2, 0.1, 1.0];
pub const RTT_BUCKETS: &[f64] = &[0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5];
pub const SYSCALL_BUCKETS: &[f64] = &[1e-6, 5e-6, 1e-5, 5e-5, 1e-4, 5e-4, 1e-3, 1e-2, 0.1];

/// Label values for a per-container series.
pub fn pod_labels<'a>(identity: &'a ContainerIdentity, node: &'a str) -> [&'a str; 4] {
    [
        identity.namespace.as_str(),
        identity.pod_name.as_str(),
        identity.container_name.as_str(),
        node,
    ]
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), labels)
}

fn histogram_vec(
    name: &str,
    help: &str,
    buckets: &[f64],
    labels: &[&str],
) -> prometheus::Result<HistogramVec> {
    HistogramVec::new(
        HistogramOpts::new(name, help).buckets(buckets.to_vec()),
        labels,
    )
}

/// Per-container metrics emitted by the collection units.
#[derive(Clone)]
pub struct AgentMetrics {
    // ========== CPU ==========
    pub cpu_runqueue_latency_seconds: HistogramVec,
    pub cpu_context_switches_total: IntCounterVec,

    // ========== Network ==========
    pub net_tcp_bytes_sent_total: IntCounterVec,
    pub net_tcp_bytes_received_total: IntCounterVec,
    pub net_tcp_retransmits_total: IntCounterVec,
    pub net_tcp_connections_total: IntCounterVec,
    pub net_tcp_rtt_seconds: HistogramVec,
    pub net_tcp_rtt_samples_total: IntCounterVec,
    pub net_tcp_drops_total: IntCounterVec,

    // ========== Memory ==========
    pub mem_oom_kills_total: IntCounterVec,
    pub mem_major_page_faults_total: IntCounterVec,

    // ========== Syscalls ==========
    pub syscall_count_total: IntCounterVec,
    pub syscall_errors_total: IntCounterVec,
    pub syscall_latency_seconds: HistogramVec,

    // ========== Block I/O ==========
    pub disk_io_latency_seconds: HistogramVec,
    pub disk_io_total: IntCounterVec,

    // ========== Page cache ==========
    pub cache_accesses_total: IntCounterVec,
    pub cache_additions_total: IntCounterVec,
    pub cache_dirtied_total: IntCounterVec,
    pub cache_buf_dirtied_total: IntCounterVec,

    // ========== Interrupts ==========
    pub irq_latency_seconds: HistogramVec,
    pub irq_total: IntCounterVec,
    pub softirq_latency_seconds: HistogramVec,

    // ========== Processes ==========
    pub proc_execs_total: IntCounterVec,
    pub proc_exits_total: IntCounterVec,
    pub proc_forks_total: IntCounterVec,

    // ========== Kernel tables ==========
    pub bpf_map_entries: IntGaugeVec,       // labels: map
    pub bpf_map_update_errors: IntGaugeVec, // labels: map
    pub bpf_map_capacity: IntGaugeVec,      // labels: map
}

impl AgentMetrics {
    /// Creates and registers all per-container metrics with the registry.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self {
            cpu_runqueue_latency_seconds: histogram_vec(
                "kpod_cpu_runqueue_latency_seconds",
                "Average run-queue wait per scheduling interval",
                LATENCY_BUCKETS,
                POD_LABELS,
            )?,
            cpu_context_switches_total: counter_vec(
                "kpod_cpu_context_switches_total",
                "Context switches observed for the container",
                POD_LABELS,
            )?,

            net_tcp_bytes_sent_total: counter_vec(
                "kpod_net_tcp_bytes_sent_total",
                "TCP payload bytes sent",
                POD_LABELS,
            )?,
            net_tcp_bytes_received_total: counter_vec(
                "kpod_net_tcp_bytes_received_total",
                "TCP payload bytes received",
                POD_LABELS,
            )?,
            net_tcp_retransmits_total: counter_vec(
                "kpod_net_tcp_retransmits_total",
                "TCP segment retransmissions",
                POD_LABELS,
            )?,
            net_tcp_connections_total: counter_vec(
                "kpod_net_tcp_connections_total",
                "TCP connections established",
                POD_LABELS,
            )?,
            net_tcp_rtt_seconds: histogram_vec(
                "kpod_net_tcp_rtt_seconds",
                "Average smoothed TCP round-trip time",
                RTT_BUCKETS,
                POD_LABELS,
            )?,
            net_tcp_rtt_samples_total: counter_vec(
                "kpod_net_tcp_rtt_samples_total",
                "RTT samples recorded in the kernel histogram",
                POD_LABELS,
            )?,
            net_tcp_drops_total: counter_vec(
                "kpod_net_tcp_drops_total",
                "TCP packets dropped by the kernel",
                POD_LABELS,
            )?,

            mem_oom_kills_total: counter_vec(
                "kpod_mem_oom_kills_total",
                "Processes killed by the OOM killer",
                POD_LABELS,
            )?,
            mem_major_page_faults_total: counter_vec(
                "kpod_mem_major_page_faults_total",
                "Major page faults",
                POD_LABELS,
            )?,

            syscall_count_total: counter_vec(
                "kpod_syscall_count_total",
                "Tracked syscall invocations",
                SYSCALL_LABELS,
            )?,
            syscall_errors_total: counter_vec(
                "kpod_syscall_errors_total",
                "Tracked syscalls returning an error",
                SYSCALL_LABELS,
            )?,
            syscall_latency_seconds: histogram_vec(
                "kpod_syscall_latency_seconds",
                "Average tracked syscall latency",
                SYSCALL_BUCKETS,
                SYSCALL_LABELS,
            )?,

            disk_io_latency_seconds: histogram_vec(
                "kpod_disk_io_latency_seconds",
                "Average block I/O completion latency",
                LATENCY_BUCKETS,
                POD_LABELS,
            )?,
            disk_io_total: counter_vec(
                "kpod_disk_io_total",
                "Completed block I/O requests",
                POD_LABELS,
            )?,

            cache_accesses_total: counter_vec(
                "kpod_cache_accesses_total",
                "Page cache accesses",
                POD_LABELS,
            )?,
            cache_additions_total: counter_vec(
                "kpod_cache_additions_total",
                "Pages added to the page cache",
                POD_LABELS,
            )?,
            cache_dirtied_total: counter_vec(
                "kpod_cache_dirtied_total",
                "Page cache pages dirtied",
                POD_LABELS,
            )?,
            cache_buf_dirtied_total: counter_vec(
                "kpod_cache_buf_dirtied_total",
                "Buffer pages dirtied",
                POD_LABELS,
            )?,

            irq_latency_seconds: histogram_vec(
                "kpod_irq_latency_seconds",
                "Average hard IRQ handler time",
                LATENCY_BUCKETS,
                POD_LABELS,
            )?,
            irq_total: counter_vec(
                "kpod_irq_total",
                "Hard IRQs handled while the container was running",
                POD_LABELS,
            )?,
            softirq_latency_seconds: histogram_vec(
                "kpod_softirq_latency_seconds",
                "Average softirq handler time",
                LATENCY_BUCKETS,
                POD_LABELS,
            )?,

            proc_execs_total: counter_vec("kpod_proc_execs_total", "exec() calls", POD_LABELS)?,
            proc_exits_total: counter_vec("kpod_proc_exits_total", "Process exits", POD_LABELS)?,
            proc_forks_total: counter_vec("kpod_proc_forks_total", "Process forks", POD_LABELS)?,

            bpf_map_entries: IntGaugeVec::new(
                Opts::new("kpod_bpf_map_entries", "Live entries in a kernel table"),
                &["map"],
            )?,
            bpf_map_update_errors: IntGaugeVec::new(
                Opts::new(
                    "kpod_bpf_map_update_errors",
                    "Failed kernel-side updates (table full) since load",
                ),
                &["map"],
            )?,
            bpf_map_capacity: IntGaugeVec::new(
                Opts::new("kpod_bpf_map_capacity", "Maximum entries of a kernel table"),
                &["map"],
            )?,
        };

        for c in metrics.pod_counters() {
            registry.register(Box::new(c.clone()))?;
        }
        for h in metrics.pod_histograms() {
            registry.register(Box::new(h.clone()))?;
        }
        registry.register(Box::new(metrics.syscall_count_total.clone()))?;
        registry.register(Box::new(metrics.syscall_errors_total.clone()))?;
        registry.register(Box::new(metrics.syscall_latency_seconds.clone()))?;
        registry.register(Box::new(metrics.bpf_map_entries.clone()))?;
        registry.register(Box::new(metrics.bpf_map_update_errors.clone()))?;
        registry.register(Box::new(metrics.bpf_map_capacity.clone()))?;

        Ok(metrics)
    }

    fn pod_counters(&self) -> [&IntCounterVec; 18] {
        [
            &self.cpu_context_switches_total,
            &self.net_tcp_bytes_sent_total,
            &self.net_tcp_bytes_received_total,
            &self.net_tcp_retransmits_total,
            &self.net_tcp_connections_total,
            &self.net_tcp_rtt_samples_total,
            &self.net_tcp_drops_total,
            &self.mem_oom_kills_total,
            &self.mem_major_page_faults_total,
            &self.disk_io_total,
            &self.cache_accesses_total,
            &self.cache_additions_total,
            &self.cache_dirtied_total,
            &self.cache_buf_dirtied_total,
            &self.irq_total,
            &self.proc_execs_total,
            &self.proc_exits_total,
            &self.proc_forks_total,
        ]
    }

    fn pod_histograms(&self) -> [&HistogramVec; 5] {
        [
            &self.cpu_runqueue_latency_seconds,
            &self.net_tcp_rtt_seconds,
            &self.disk_io_latency_seconds,
            &self.irq_latency_seconds,
            &self.softirq_latency_seconds,
        ]
    }

    /// `syscall` label values exported for one container, including
    /// `syscall_<nr>` names for unknown numbers.
    fn syscall_names_of(&self, labels: &[&str; 4]) -> Vec<String> {
        let mut names = Vec::new();
        let families = self
            .syscall_count_total
            .collect()
            .into_iter()
            .chain(self.syscall_latency_seconds.collect());

        for family in families {
            for metric in family.get_metric() {
                let mut syscall = None;
                let owned = metric.get_label().iter().all(|pair| {
                    match POD_LABELS.iter().position(|l| *l == pair.get_name()) {
                        Some(i) => labels[i] == pair.get_value(),
                        None => {
                            if pair.get_name() == "syscall" {
                                syscall = Some(pair.get_value().to_string());
                            }
                            true
                        }
                    }
                });
                if let (true, Some(name)) = (owned, syscall) {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names
    }

    /// Drops every series of a deleted container. Returns the number removed.
    pub fn remove_container(&self, identity: &ContainerIdentity, node: &str) -> usize {
        let labels = pod_labels(identity, node);
        let mut removed = 0;

        for c in self.pod_counters() {
            removed += usize::from(c.remove_label_values(&labels).is_ok());
        }
        for h in self.pod_histograms() {
            removed += usize::from(h.remove_label_values(&labels).is_ok());
        }

        for syscall in self.syscall_names_of(&labels) {
            let with_syscall = [labels[0], labels[1], labels[2], labels[3], syscall.as_str()];
            removed += usize::from(self.syscall_count_total.remove_label_values(&with_syscall).is_ok());
            removed += usize::from(self.syscall_errors_total.remove_label_values(&with_syscall).is_ok());
            removed += usize::from(
                self.syscall_latency_seconds
                    .remove_label_values(&with_syscall)
                    .is_ok(),
            );
        }
        removed
    }
}

/// Orchestrator self-metrics.
#[derive(Clone)]
pub struct CollectionMetrics {
    pub cycle_duration: Histogram,
    pub timeouts: IntCounter,
    pub skipped: IntCounter,
    pub collector_duration: HistogramVec, // labels: collector
    pub collector_errors: IntCounterVec,  // labels: collector
    pub discovery_pods: IntGauge,
    pub last_success: Gauge,
}

impl CollectionMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "kpod_collection_cycle_duration_seconds",
                "Wall time of one collection cycle",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        )?;
        let timeouts = IntCounter::new(
            "kpod_collection_timeouts_total",
            "Collection cycles that exceeded the deadline",
        )?;
        let skipped = IntCounter::new(
            "kpod_collection_skipped_total",
            "Triggers skipped because a cycle was still in flight",
        )?;
        let collector_duration = histogram_vec(
            "kpod_collector_duration_seconds",
            "Wall time of one collection unit",
            &[0.001, 0.01, 0.1, 0.5, 1.0, 5.0],
            &["collector"],
        )?;
        let collector_errors = counter_vec(
            "kpod_collector_errors_total",
            "Collection unit failures",
            &["collector"],
        )?;
        let discovery_pods = IntGauge::new(
            "kpod_discovery_pods_total",
            "Container targets resolved in the last cycle",
        )?;
        let last_success = Gauge::new(
            "kpod_last_successful_cycle_timestamp_seconds",
            "Unix time of the last completed collection cycle",
        )?;

        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(timeouts.clone()))?;
        registry.register(Box::new(skipped.clone()))?;
        registry.register(Box::new(collector_duration.clone()))?;
        registry.register(Box::new(collector_errors.clone()))?;
        registry.register(Box::new(discovery_pods.clone()))?;
        registry.register(Box::new(last_success.clone()))?;

        Ok(Self {
            cycle_duration,
            timeouts,
            skipped,
            collector_duration,
            collector_errors,
            discovery_pods,
            last_success,
        })
    }
}

/// Program manager metrics.
#[derive(Clone)]
pub struct ProgramMetrics {
    pub load_duration: HistogramVec, // labels: program
    pub loaded: IntGauge,
    pub failed: IntGauge,
}

impl ProgramMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let load_duration = histogram_vec(
            "kpod_program_load_duration_seconds",
            "Open, load and attach time per probe program",
            &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            &["program"],
        )?;
        let loaded = IntGauge::new("kpod_programs_loaded", "Probe programs loaded and attached")?;
        let failed = IntGauge::new("kpod_programs_failed", "Probe programs that failed to load")?;

        registry.register(Box::new(load_duration.clone()))?;
        registry.register(Box::new(loaded.clone()))?;
        registry.register(Box::new(failed.clone()))?;

        Ok(Self {
            load_duration,
            loaded,
            failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ContainerIdentity {
        ContainerIdentity {
            pod_uid: "uid-1".into(),
            container_id: "abc".into(),
            namespace: "default".into(),
            pod_name: "web-0".into(),
            container_name: "nginx".into(),
        }
    }

    #[test]
    fn test_all_families_register() {
        let registry = Registry::new();
        AgentMetrics::new(&registry).unwrap();
        CollectionMetrics::new(&registry).unwrap();
        ProgramMetrics::new(&registry).unwrap();

        // Registering twice on the same registry is rejected.
        assert!(ProgramMetrics::new(&registry).is_err());
    }

    #[test]
    fn test_remove_container_drops_series() {
        let registry = Registry::new();
        let metrics = AgentMetrics::new(&registry).unwrap();
        let id = identity();
        let labels = pod_labels(&id, "node-a");

        metrics.cpu_context_switches_total.with_label_values(&labels).inc_by(5);
        metrics.net_tcp_rtt_seconds.with_label_values(&labels).observe(0.001);
        metrics
            .syscall_count_total
            .with_label_values(&["default", "web-0", "nginx", "node-a", "read"])
            .inc();
        metrics
            .syscall_count_total
            .with_label_values(&["default", "web-0", "nginx", "node-a", "syscall_999"])
            .inc();
        metrics
            .syscall_count_total
            .with_label_values(&["default", "web-1", "nginx", "node-a", "read"])
            .inc();

        assert_eq!(metrics.remove_container(&id, "node-a"), 4);
        let series: usize = registry.gather().iter().map(|f| f.get_metric().len()).sum();
        assert_eq!(series, 1);
    }
}
