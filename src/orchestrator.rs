//! Collection cycle orchestration.
//!
//! One outer timer calls [`Orchestrator::trigger`]. A cycle resolves
//! discovery targets, fans the due collection units out onto the blocking
//! pool, waits for them under one wall-clock deadline, then prunes the
//! identity grace cache and cleans up the kernel state of expired
//! containers. At most one cycle is in flight; overlapping triggers are
//! skipped, never queued.

use ahash::{AHashMap, AHashSet};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::collectors::{CollectorDescriptor, CGROUP_KEYED_TABLES, COMPOSITE_KEYED_TABLES};
use crate::discovery::{IdentitySync, TargetSource};
use crate::error::{CollectorError, CycleTimeoutError, DiscoveryError, MapError};
use crate::identity::{CgroupIdentityResolver, ContainerIdentity};
use crate::metrics::{AgentMetrics, CollectionMetrics};
use crate::snapshot::decode::{encode_cgroup_key, CGROUP_KEY_SIZE};
use crate::snapshot::{delete_where, TableSource};

/// Result of one [`Orchestrator::trigger`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed { succeeded: usize, failed: usize },
    /// The deadline passed; units that finished before it are kept.
    TimedOut { completed: usize, scheduled: usize },
    SkippedInFlight,
    ShuttingDown,
}

/// Names of units whose work is still running, including work abandoned by
/// a timed-out cycle.
#[derive(Default)]
struct RunningUnits {
    names: Mutex<AHashSet<String>>,
}

impl RunningUnits {
    fn try_start(&self, name: &str) -> bool {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        names.insert(name.to_string())
    }

    fn finish(&self, name: &str) {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        names.remove(name);
    }

    fn is_empty(&self) -> bool {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

/// Clears a running-unit marker when the unit's work ends, even by panic.
struct RunningGuard {
    running: Arc<RunningUnits>,
    idle: Arc<Notify>,
    name: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.finish(&self.name);
        self.idle.notify_waiters();
    }
}

pub struct Orchestrator {
    units: Vec<CollectorDescriptor>,
    timeout: Duration,
    tables: Arc<dyn TableSource>,
    identities: Arc<CgroupIdentityResolver>,
    targets: Option<Arc<dyn TargetSource>>,
    sync: Option<Arc<IdentitySync>>,
    metrics: Option<CollectionMetrics>,
    agent_metrics: Option<Arc<AgentMetrics>>,
    node_name: String,
    collecting: AtomicBool,
    shutting_down: AtomicBool,
    idle: Arc<Notify>,
    running: Arc<RunningUnits>,
    last_run: Mutex<AHashMap<String, Instant>>,
    last_success: Mutex<Option<DateTime<Utc>>>,
}

/// Resets the single-flight flag when a cycle ends, however it ends.
struct CycleGuard<'a> {
    orchestrator: &'a Orchestrator,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.collecting.store(false, Ordering::Release);
        self.orchestrator.idle.notify_waiters();
    }
}

impl Orchestrator {
    pub fn new(
        units: Vec<CollectorDescriptor>,
        tables: Arc<dyn TableSource>,
        identities: Arc<CgroupIdentityResolver>,
        timeout: Duration,
    ) -> Self {
        Self {
            units,
            timeout,
            tables,
            identities,
            targets: None,
            sync: None,
            metrics: None,
            agent_metrics: None,
            node_name: String::new(),
            collecting: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            idle: Arc::new(Notify::new()),
            running: Arc::new(RunningUnits::default()),
            last_run: Mutex::new(AHashMap::new()),
            last_success: Mutex::new(None),
        }
    }

    /// Resolves discovery targets at the start of every cycle and reconciles
    /// them into the identity resolver.
    pub fn with_targets(mut self, targets: Arc<dyn TargetSource>, sync: Arc<IdentitySync>) -> Self {
        self.targets = Some(targets);
        self.sync = Some(sync);
        self
    }

    pub fn with_metrics(mut self, metrics: CollectionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Series of expired containers are removed from these families.
    pub fn with_agent_metrics(mut self, metrics: Arc<AgentMetrics>, node_name: impl Into<String>) -> Self {
        self.agent_metrics = Some(metrics);
        self.node_name = node_name.into();
        self
    }

    /// Runs one collection cycle unless one is already in flight or shutdown
    /// has begun.
    #[instrument(skip(self))]
    pub async fn trigger(&self) -> CycleOutcome {
        if self
            .collecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Collection cycle already in flight, skipping trigger");
            if let Some(m) = &self.metrics {
                m.skipped.inc();
            }
            return CycleOutcome::SkippedInFlight;
        }
        let _guard = CycleGuard { orchestrator: self };

        if self.is_shutting_down() {
            trace!("Shutting down, ignoring trigger");
            return CycleOutcome::ShuttingDown;
        }

        let started = Instant::now();
        self.refresh_targets().await;

        let due = self.due_units(started);
        let scheduled = due.len();
        let deadline = tokio::time::Instant::now() + self.timeout;

        let mut set = JoinSet::new();
        for descriptor in due {
            let running = Arc::clone(&self.running);
            let idle = Arc::clone(&self.idle);
            let guard = RunningGuard {
                running,
                idle,
                name: descriptor.name.clone(),
            };
            set.spawn_blocking(move || {
                let _guard = guard;
                let unit_started = Instant::now();
                let result = catch_unwind(AssertUnwindSafe(|| descriptor.unit.collect()))
                    .unwrap_or_else(|payload| Err(CollectorError::Panicked(panic_message(payload))));
                (descriptor.name, unit_started.elapsed(), result)
            });
        }

        let mut succeeded = 0;
        let mut failed = 0;
        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((name, elapsed, result)))) => {
                    if let Some(m) = &self.metrics {
                        m.collector_duration
                            .with_label_values(&[name.as_str()])
                            .observe(elapsed.as_secs_f64());
                    }
                    match result {
                        Ok(()) => {
                            succeeded += 1;
                            self.mark_run(&name, started);
                        }
                        Err(e) => {
                            failed += 1;
                            error!("Collector {} failed: {}", name, e);
                            if let Some(m) = &self.metrics {
                                m.collector_errors.with_label_values(&[name.as_str()]).inc();
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    // Only reachable if the blocking task was cancelled.
                    failed += 1;
                    error!("Collector task did not complete: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let outcome = if timed_out {
            let completed = succeeded + failed;
            // Blocking work cannot be cancelled; it finishes in the background
            // and its results are dropped.
            set.detach_all();
            warn!(
                "{}",
                CycleTimeoutError {
                    timeout: self.timeout,
                    completed,
                    scheduled,
                }
            );
            if let Some(m) = &self.metrics {
                m.timeouts.inc();
            }
            CycleOutcome::TimedOut {
                completed,
                scheduled,
            }
        } else {
            CycleOutcome::Completed { succeeded, failed }
        };

        self.cleanup_expired();

        let now = Utc::now();
        *self.last_success.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        if let Some(m) = &self.metrics {
            m.last_success.set(now.timestamp() as f64);
            m.cycle_duration.observe(started.elapsed().as_secs_f64());
        }
        debug!(
            "Collection cycle finished in {:.3}s: {:?}",
            started.elapsed().as_secs_f64(),
            outcome
        );
        outcome
    }

    /// Stops accepting cycles and waits up to the collection timeout for the
    /// in-flight cycle and any abandoned unit work to finish. Returns whether
    /// everything drained in time.
    pub async fn close(&self) -> bool {
        self.shutting_down.store(true, Ordering::Release);
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_collecting() && self.running.is_empty() {
                info!("Collection drained, orchestrator closed");
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    "In-flight collection did not finish within {:?}, closing anyway",
                    self.timeout
                );
                return false;
            }
        }
    }

    /// Deletes every kernel-table entry owned by `cgroup_id`. Returns the
    /// number of deleted entries.
    pub fn cleanup_cgroup_entries(&self, cgroup_id: u64) -> usize {
        let key = encode_cgroup_key(cgroup_id);
        let mut deleted = 0;

        for &(program, table) in CGROUP_KEYED_TABLES {
            if !self.tables.is_loaded(program) {
                continue;
            }
            let result = self
                .tables
                .table(program, table)
                .and_then(|handle| handle.delete(&key));
            match result {
                Ok(true) => deleted += 1,
                Ok(false) | Err(MapError::UnknownTable { .. }) => {}
                Err(e) => warn!("Failed to delete cgroup {} from {}/{}: {}", cgroup_id, program, table, e),
            }
        }

        // The sub-key space is unknown, so these are scanned and filtered.
        for &(program, table) in COMPOSITE_KEYED_TABLES {
            if !self.tables.is_loaded(program) {
                continue;
            }
            let result = self.tables.table(program, table).and_then(|handle| {
                delete_where(handle.as_ref(), |k| {
                    k.len() >= CGROUP_KEY_SIZE && k[..CGROUP_KEY_SIZE] == key
                })
            });
            match result {
                Ok(n) => deleted += n,
                Err(MapError::UnknownTable { .. }) => {}
                Err(e) => warn!("Failed to scan {}/{} for cgroup {}: {}", program, table, cgroup_id, e),
            }
        }
        deleted
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }

    pub fn enabled_units(&self) -> Vec<&str> {
        self.units
            .iter()
            .filter(|u| u.enabled)
            .map(|u| u.name.as_str())
            .collect()
    }

    pub fn identities(&self) -> &Arc<CgroupIdentityResolver> {
        &self.identities
    }

    async fn refresh_targets(&self) {
        let Some(source) = self.targets.clone() else {
            return;
        };
        let sync = self.sync.clone();

        let resolved = tokio::task::spawn_blocking(move || {
            let targets = source.resolve_targets()?;
            let report = sync.map(|s| s.reconcile(&targets));
            Ok::<_, DiscoveryError>((targets.len(), report))
        })
        .await;

        match resolved {
            Ok(Ok((count, report))) => {
                if let Some(m) = &self.metrics {
                    m.discovery_pods.set(count as i64);
                }
                if let Some(report) = report {
                    trace!(
                        "Discovery: {} targets, {} registered, {} deleted",
                        count,
                        report.registered,
                        report.deleted.len()
                    );
                }
            }
            Ok(Err(e)) => {
                // Reconcile is skipped: an empty snapshot would delete every container.
                warn!("Discovery failed, collecting with no new targets: {}", e);
            }
            Err(e) => error!("Discovery task failed: {}", e),
        }
    }

    /// Only successful runs start a unit's interval; a failed unit is retried
    /// on the next cycle.
    fn mark_run(&self, name: &str, at: Instant) {
        self.last_run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), at);
    }

    /// Enabled units whose interval elapsed. Units still running from a
    /// timed-out cycle are skipped so no table is drained twice at once.
    fn due_units(&self, now: Instant) -> Vec<CollectorDescriptor> {
        let last_run = self.last_run.lock().unwrap_or_else(PoisonError::into_inner);
        let mut due = Vec::new();

        for unit in self.units.iter().filter(|u| u.enabled) {
            if let (Some(interval), Some(last)) = (unit.interval, last_run.get(&unit.name)) {
                if now.saturating_duration_since(*last) < interval {
                    trace!("Collector {} not due yet", unit.name);
                    continue;
                }
            }
            if !self.running.try_start(&unit.name) {
                warn!("Collector {} still running from a previous cycle, skipping", unit.name);
                continue;
            }
            due.push(unit.clone());
        }
        due
    }

    fn cleanup_expired(&self) {
        for (cgroup_id, identity) in self.identities.take_expired() {
            let deleted = self.cleanup_cgroup_entries(cgroup_id);
            let removed = self.remove_series(&identity);
            debug!(
                "Cleaned up cgroup {} ({}/{}): {} table entries, {} series",
                cgroup_id, identity.namespace, identity.pod_name, deleted, removed
            );
        }
    }

    fn remove_series(&self, identity: &ContainerIdentity) -> usize {
        self.agent_metrics
            .as_ref()
            .map(|m| m.remove_container(identity, &self.node_name))
            .unwrap_or(0)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
