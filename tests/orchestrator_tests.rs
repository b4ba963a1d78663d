//! Integration tests for collection cycle orchestration.
//!
//! Units are plain closures run on the blocking pool; timing-based tests keep
//! a wide margin between the unit sleep and the cycle deadline.

use prometheus::Registry;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kpod_metrics::collectors::{CollectionUnit, CollectorDescriptor};
use kpod_metrics::discovery::{IdentitySync, PodCgroupTarget, TargetSource};
use kpod_metrics::error::{CollectorError, DiscoveryError, MapError};
use kpod_metrics::identity::{CgroupIdentityResolver, ContainerIdentity};
use kpod_metrics::metrics::{pod_labels, AgentMetrics, CollectionMetrics};
use kpod_metrics::orchestrator::{CycleOutcome, Orchestrator};
use kpod_metrics::snapshot::decode::{encode_cgroup_key, Record, SyscallKey, SyscallStatsRecord};
use kpod_metrics::snapshot::{MemTableSource, TableSource};

type UnitFn = Box<dyn Fn() -> Result<(), CollectorError> + Send + Sync>;

/// Collection unit backed by a closure that counts its runs.
struct FnUnit {
    name: String,
    runs: Arc<AtomicUsize>,
    f: UnitFn,
}

impl CollectionUnit for FnUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect(&self) -> Result<(), CollectorError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        (self.f)()
    }
}

fn unit<F>(name: &str, f: F) -> (CollectorDescriptor, Arc<AtomicUsize>)
where
    F: Fn() -> Result<(), CollectorError> + Send + Sync + 'static,
{
    let runs = Arc::new(AtomicUsize::new(0));
    let unit = FnUnit {
        name: name.to_string(),
        runs: Arc::clone(&runs),
        f: Box::new(f),
    };
    (CollectorDescriptor::new(Arc::new(unit)), runs)
}

fn sleeping(name: &str, ms: u64) -> (CollectorDescriptor, Arc<AtomicUsize>) {
    unit(name, move || {
        std::thread::sleep(Duration::from_millis(ms));
        Ok(())
    })
}

fn orchestrator(units: Vec<CollectorDescriptor>, timeout: Duration) -> Orchestrator {
    Orchestrator::new(
        units,
        Arc::new(MemTableSource::new()),
        Arc::new(CgroupIdentityResolver::new()),
        timeout,
    )
}

fn identity(pod: &str) -> ContainerIdentity {
    ContainerIdentity {
        pod_uid: format!("{pod}-uid"),
        container_id: format!("{pod}-c"),
        namespace: "default".into(),
        pod_name: pod.into(),
        container_name: "app".into(),
    }
}

async fn wait_until_collecting(orchestrator: &Orchestrator) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !orchestrator.is_collecting() {
        assert!(Instant::now() < deadline, "cycle never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_trigger_is_skipped() {
    let registry = Registry::new();
    let metrics = CollectionMetrics::new(&registry).unwrap();
    let (slow, runs) = sleeping("slow", 300);
    let orchestrator = Arc::new(
        orchestrator(vec![slow], Duration::from_secs(5)).with_metrics(metrics.clone()),
    );

    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.trigger().await })
    };
    wait_until_collecting(&orchestrator).await;

    assert_eq!(orchestrator.trigger().await, CycleOutcome::SkippedInFlight);
    assert_eq!(
        first.await.unwrap(),
        CycleOutcome::Completed {
            succeeded: 1,
            failed: 0
        }
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.skipped.get(), 1);
    assert!(!orchestrator.is_collecting());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_units_do_not_affect_siblings() {
    let registry = Registry::new();
    let metrics = CollectionMetrics::new(&registry).unwrap();
    let (ok, ok_runs) = unit("ok", || Ok(()));
    let (failing, _) = unit("failing", || {
        Err(MapError::ProgramNotLoaded("net".into()).into())
    });
    let (panicking, _) = unit("panicking", || panic!("layout drift"));

    let orchestrator = orchestrator(vec![failing, ok, panicking], Duration::from_secs(5))
        .with_metrics(metrics.clone());

    assert_eq!(
        orchestrator.trigger().await,
        CycleOutcome::Completed {
            succeeded: 1,
            failed: 2
        }
    );
    assert_eq!(ok_runs.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.collector_errors.with_label_values(&["failing"]).get(), 1);
    assert_eq!(metrics.collector_errors.with_label_values(&["panicking"]).get(), 1);
    assert_eq!(metrics.collector_errors.with_label_values(&["ok"]).get(), 0);
    assert!(orchestrator.last_success().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deadline_keeps_completed_results() {
    let registry = Registry::new();
    let metrics = CollectionMetrics::new(&registry).unwrap();
    let (fast, fast_runs) = unit("fast", || Ok(()));
    let (stuck, stuck_runs) = sleeping("stuck", 1_000);

    let orchestrator = orchestrator(vec![fast, stuck], Duration::from_millis(100))
        .with_metrics(metrics.clone());

    assert_eq!(
        orchestrator.trigger().await,
        CycleOutcome::TimedOut {
            completed: 1,
            scheduled: 2
        }
    );
    assert_eq!(metrics.timeouts.get(), 1);
    assert_eq!(fast_runs.load(Ordering::SeqCst), 1);
    assert!(orchestrator.last_success().is_some());

    // The abandoned unit is still running, so the next cycle leaves it out.
    assert_eq!(
        orchestrator.trigger().await,
        CycleOutcome::Completed {
            succeeded: 1,
            failed: 0
        }
    );
    assert_eq!(fast_runs.load(Ordering::SeqCst), 2);
    assert_eq!(stuck_runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_waits_for_in_flight_cycle() {
    let finished = Arc::new(AtomicBool::new(false));
    let (slow, _) = {
        let finished = Arc::clone(&finished);
        unit("slow", move || {
            std::thread::sleep(Duration::from_millis(300));
            finished.store(true, Ordering::SeqCst);
            Ok(())
        })
    };
    let orchestrator = Arc::new(orchestrator(vec![slow], Duration::from_secs(5)));

    let cycle = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.trigger().await })
    };
    wait_until_collecting(&orchestrator).await;

    assert!(orchestrator.close().await);
    assert!(finished.load(Ordering::SeqCst));
    assert!(orchestrator.is_shutting_down());
    assert!(matches!(cycle.await.unwrap(), CycleOutcome::Completed { .. }));

    assert_eq!(orchestrator.trigger().await, CycleOutcome::ShuttingDown);
}

#[tokio::test]
async fn test_close_when_idle_returns_immediately() {
    let orchestrator = orchestrator(Vec::new(), Duration::from_secs(5));
    assert!(orchestrator.close().await);
    assert_eq!(orchestrator.trigger().await, CycleOutcome::ShuttingDown);
}

#[tokio::test]
async fn test_unit_intervals_and_enable_flags() {
    let (every, every_runs) = unit("every", || Ok(()));
    let (hourly, hourly_runs) = unit("hourly", || Ok(()));
    let (disabled, disabled_runs) = unit("disabled", || Ok(()));

    let orchestrator = orchestrator(
        vec![
            every,
            hourly.with_interval(Some(Duration::from_secs(3600))),
            disabled.with_enabled(false),
        ],
        Duration::from_secs(5),
    );
    assert_eq!(orchestrator.enabled_units(), vec!["every", "hourly"]);

    orchestrator.trigger().await;
    orchestrator.trigger().await;

    assert_eq!(every_runs.load(Ordering::SeqCst), 2);
    assert_eq!(hourly_runs.load(Ordering::SeqCst), 1);
    assert_eq!(disabled_runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_unit_is_retried_before_its_interval() {
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&failed_once);
    let (hourly, runs) = unit("hourly", move || {
        if flag.swap(true, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CollectorError::Map(MapError::ProgramNotLoaded("mem".into())))
        }
    });
    let orchestrator = orchestrator(
        vec![hourly.with_interval(Some(Duration::from_secs(3600)))],
        Duration::from_secs(5),
    );

    assert_eq!(
        orchestrator.trigger().await,
        CycleOutcome::Completed {
            succeeded: 0,
            failed: 1
        }
    );
    assert_eq!(
        orchestrator.trigger().await,
        CycleOutcome::Completed {
            succeeded: 1,
            failed: 0
        }
    );
    orchestrator.trigger().await;

    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_expired_containers_are_cleaned_up() {
    let tables = Arc::new(MemTableSource::new());
    let oom = tables.add("mem", "oom_kills", 8, 8);
    let syscalls = tables.add(
        "syscall",
        "syscall_stats_map",
        SyscallKey::SIZE,
        SyscallStatsRecord::SIZE,
    );
    for id in [7u64, 8] {
        oom.insert(&encode_cgroup_key(id), &[0u8; 8]);
        for nr in [0u32, 1, 257] {
            let key = SyscallKey {
                cgroup_id: id,
                syscall_nr: nr,
            };
            syscalls.insert(&key.encode(), &vec![0u8; SyscallStatsRecord::SIZE]);
        }
    }

    let registry = Registry::new();
    let metrics = Arc::new(AgentMetrics::new(&registry).unwrap());
    let gone = identity("gone");
    let labels = pod_labels(&gone, "node-a");
    metrics.mem_oom_kills_total.with_label_values(&labels).inc();

    let identities = Arc::new(CgroupIdentityResolver::new());
    identities.register(7, gone.clone());
    identities.register(8, identity("kept"));
    identities.on_deleted_at(7, std::time::Instant::now() - Duration::from_secs(10));

    let orchestrator = Orchestrator::new(
        Vec::new(),
        Arc::clone(&tables) as Arc<dyn TableSource>,
        Arc::clone(&identities),
        Duration::from_secs(5),
    )
    .with_agent_metrics(Arc::clone(&metrics), "node-a");

    orchestrator.trigger().await;

    assert_eq!(identities.grace_len(), 0);
    assert!(identities.resolve(7).is_none());
    assert!(!oom.contains(&encode_cgroup_key(7)));
    assert!(oom.contains(&encode_cgroup_key(8)));
    assert_eq!(syscalls.len(), 3);
    assert!(metrics.mem_oom_kills_total.remove_label_values(&labels).is_err());
}

#[test]
fn test_cleanup_skips_unloaded_programs() {
    let tables = Arc::new(MemTableSource::new());
    let oom = tables.add("mem", "oom_kills", 8, 8);
    oom.insert(&encode_cgroup_key(3), &[0u8; 8]);

    let orchestrator = Orchestrator::new(
        Vec::new(),
        tables,
        Arc::new(CgroupIdentityResolver::new()),
        Duration::from_secs(1),
    );
    assert_eq!(orchestrator.cleanup_cgroup_entries(3), 1);
    assert_eq!(orchestrator.cleanup_cgroup_entries(3), 0);
}

struct FailingTargets;

impl TargetSource for FailingTargets {
    fn resolve_targets(&self) -> Result<Vec<PodCgroupTarget>, DiscoveryError> {
        Err(DiscoveryError::Unavailable("kubelet unreachable".into()))
    }
}

struct FixedTargets(Vec<PodCgroupTarget>);

impl TargetSource for FixedTargets {
    fn resolve_targets(&self) -> Result<Vec<PodCgroupTarget>, DiscoveryError> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn test_discovery_failure_degrades_to_empty_targets() {
    let identities = Arc::new(CgroupIdentityResolver::new());
    let sync = Arc::new(IdentitySync::new(Arc::clone(&identities)));
    let (probe, runs) = unit("probe", || Ok(()));

    let orchestrator = Orchestrator::new(
        vec![probe],
        Arc::new(MemTableSource::new()),
        Arc::clone(&identities),
        Duration::from_secs(5),
    )
    .with_targets(Arc::new(FailingTargets), sync);

    assert_eq!(
        orchestrator.trigger().await,
        CycleOutcome::Completed {
            succeeded: 1,
            failed: 0
        }
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_discovery_registers_container_identities() {
    let dir = tempfile::tempdir().unwrap();
    let cgroup = dir.path().join("cri-containerd-abc.scope");
    std::fs::create_dir(&cgroup).unwrap();

    let target = PodCgroupTarget {
        pod_uid: "uid-1".into(),
        container_id: "abc".into(),
        pod_name: "web-0".into(),
        namespace: "default".into(),
        container_name: "app".into(),
        cgroup_path: cgroup,
        node_name: "node-a".into(),
    };

    let identities = Arc::new(CgroupIdentityResolver::new());
    let sync = Arc::new(IdentitySync::new(Arc::clone(&identities)));
    let orchestrator = Orchestrator::new(
        Vec::new(),
        Arc::new(MemTableSource::new()),
        Arc::clone(&identities),
        Duration::from_secs(5),
    )
    .with_targets(Arc::new(FixedTargets(vec![target])), sync);

    orchestrator.trigger().await;

    assert_eq!(identities.live_len(), 1);
    let id = identities.live_ids()[0];
    assert_eq!(
        identities.resolve(id).map(|i| i.pod_name),
        Some("web-0".to_string())
    );
}
