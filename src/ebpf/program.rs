//! Open, load, attach and destroy of kernel probe programs.
//!
//! Each program moves through `NotLoaded -> Loading -> Loaded -> Destroyed`, or
//! ends in `Failed` when any of the three phases fails. A failed program is
//! recorded and the rest of the agent keeps running without it.

use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::handle::{HandleRegistry, NativeHandle};
use crate::error::{LoadPhase, MapError, ProgramLoadError};
use crate::metrics::ProgramMetrics;
use crate::snapshot::{KernelTable, TableSource};

/// Kernel type information; its presence selects the CO-RE variant.
pub const BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

/// File name suffix of compiled probe objects.
pub const OBJECT_SUFFIX: &str = ".bpf.o";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramState {
    NotLoaded,
    Loading,
    Loaded,
    Destroyed,
    Failed,
}

/// Which build of the probe objects is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryVariant {
    Core,
    Legacy,
    Base,
}

/// Picks the object directory: `core/` when BTF is present and the directory
/// exists, else `legacy/`, else `program_dir` itself.
pub fn select_variant(program_dir: &Path, btf_present: bool) -> (BinaryVariant, PathBuf) {
    let core = program_dir.join("core");
    let legacy = program_dir.join("legacy");

    if btf_present && core.is_dir() {
        (BinaryVariant::Core, core)
    } else if legacy.is_dir() {
        (BinaryVariant::Legacy, legacy)
    } else {
        (BinaryVariant::Base, program_dir.to_path_buf())
    }
}

pub fn object_path(dir: &Path, program: &str) -> PathBuf {
    dir.join(format!("{program}{OBJECT_SUFFIX}"))
}

/// Native operations behind the program manager.
///
/// Implementations own the foreign objects; the manager only ever reaches them
/// through a [`NativeHandle`].
pub trait ProbeBackend: Send + Sync + 'static {
    type Object: Send + 'static;

    fn open(&self, path: &Path) -> anyhow::Result<Self::Object>;

    /// Verifies and loads the object into the kernel.
    fn load(&self, object: &mut Self::Object) -> anyhow::Result<()>;

    /// Attaches every program in the object, returning the number of links.
    fn attach(&self, object: &mut Self::Object) -> anyhow::Result<usize>;

    fn table_names(&self, object: &Self::Object) -> Vec<String>;

    fn table(&self, object: &Self::Object, name: &str) -> Result<Arc<dyn KernelTable>, MapError>;
}

/// A successfully loaded and attached program.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedProgram {
    pub name: String,
    #[serde(skip)]
    pub handle: NativeHandle,
    pub variant: BinaryVariant,
    pub tables: Vec<String>,
    pub links: usize,
    #[serde(skip)]
    pub load_duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedProgram {
    pub name: String,
    pub error: String,
}

/// Read-only view of program state for diagnostics and health.
pub trait ProgramInventory: Send + Sync {
    fn loaded_programs(&self) -> Vec<LoadedProgram>;

    fn failed_programs(&self) -> Vec<FailedProgram>;
}

#[derive(Debug, Default)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
}

struct ProgramRecord {
    state: ProgramState,
    loaded: Option<LoadedProgram>,
    error: Option<String>,
}

pub struct ProgramManager<B: ProbeBackend> {
    backend: B,
    program_dir: PathBuf,
    btf_present: bool,
    objects: HandleRegistry<Mutex<B::Object>>,
    programs: DashMap<String, ProgramRecord>,
    tables: DashMap<(String, String), Arc<dyn KernelTable>>,
    metrics: Option<ProgramMetrics>,
}

impl<B: ProbeBackend> ProgramManager<B> {
    pub fn new(backend: B, program_dir: impl Into<PathBuf>, btf_present: bool) -> Self {
        Self {
            backend,
            program_dir: program_dir.into(),
            btf_present,
            objects: HandleRegistry::new(),
            programs: DashMap::new(),
            tables: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ProgramMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Loads every named program independently; one failure never blocks the
    /// others.
    pub fn load_all(&self, programs: &[&str]) -> LoadSummary {
        let (variant, dir) = select_variant(&self.program_dir, self.btf_present);
        info!(
            "Loading {} probe programs from {} ({:?} variant)",
            programs.len(),
            dir.display(),
            variant
        );

        let mut summary = LoadSummary::default();
        for name in programs {
            match self.load_program_from(name, variant, &dir) {
                Ok(program) => {
                    info!(
                        "✅ Loaded program {} ({} links, {} tables) in {:?}",
                        program.name,
                        program.links,
                        program.tables.len(),
                        program.load_duration
                    );
                    summary.loaded.push(program.name);
                }
                Err(e) => {
                    warn!("⚠️  {}", e);
                    summary.failed.push((*name).to_string());
                }
            }
        }

        self.update_gauges();
        summary
    }

    /// Loads a single program from the selected variant directory.
    pub fn load_program(&self, name: &str) -> Result<LoadedProgram, ProgramLoadError> {
        let (variant, dir) = select_variant(&self.program_dir, self.btf_present);
        let result = self.load_program_from(name, variant, &dir);
        self.update_gauges();
        result
    }

    fn load_program_from(
        &self,
        name: &str,
        variant: BinaryVariant,
        dir: &Path,
    ) -> Result<LoadedProgram, ProgramLoadError> {
        if self.state(name) == ProgramState::Loaded {
            debug!("Program {} already loaded", name);
            if let Some(loaded) = self.programs.get(name).and_then(|r| r.loaded.clone()) {
                return Ok(loaded);
            }
        }

        self.set_record(name, ProgramState::Loading, None, None);
        let started = Instant::now();

        let result = self.open_load_attach(name, variant, dir, started);
        match &result {
            Ok(program) => {
                self.set_record(name, ProgramState::Loaded, Some(program.clone()), None);
                if let Some(metrics) = &self.metrics {
                    metrics
                        .load_duration
                        .with_label_values(&[name])
                        .observe(program.load_duration.as_secs_f64());
                }
            }
            Err(e) => self.set_record(name, ProgramState::Failed, None, Some(e.to_string())),
        }
        result
    }

    fn open_load_attach(
        &self,
        name: &str,
        variant: BinaryVariant,
        dir: &Path,
        started: Instant,
    ) -> Result<LoadedProgram, ProgramLoadError> {
        let path = object_path(dir, name);
        if !path.is_file() {
            return Err(ProgramLoadError::NotFound {
                program: name.to_string(),
                path,
            });
        }

        let phase_error = |phase: LoadPhase, e: anyhow::Error| ProgramLoadError::Phase {
            program: name.to_string(),
            phase,
            reason: format!("{e:#}"),
        };

        let object = self
            .backend
            .open(&path)
            .map_err(|e| phase_error(LoadPhase::Open, e))?;
        let handle = self.objects.register(Mutex::new(object));
        debug!("Opened {} as handle {}", path.display(), handle);

        let object = self
            .objects
            .resolve(handle)
            .map_err(|source| ProgramLoadError::Handle {
                program: name.to_string(),
                source,
            })?;
        let mut guard = object.lock().unwrap_or_else(PoisonError::into_inner);

        let phases = self
            .backend
            .load(&mut guard)
            .map_err(|e| phase_error(LoadPhase::Load, e))
            .and_then(|()| {
                self.backend
                    .attach(&mut guard)
                    .map_err(|e| phase_error(LoadPhase::Attach, e))
            });

        let links = match phases {
            Ok(links) => links,
            Err(e) => {
                drop(guard);
                drop(object);
                // Destroys the half-initialised object.
                self.objects.invalidate(handle);
                return Err(e);
            }
        };

        let mut tables = self.backend.table_names(&guard);
        tables.sort();

        Ok(LoadedProgram {
            name: name.to_string(),
            handle,
            variant,
            tables,
            links,
            load_duration: started.elapsed(),
        })
    }

    /// Best-effort teardown of every loaded program. Never fails.
    pub fn destroy_all(&self) -> usize {
        self.tables.clear();

        let mut destroyed = 0;
        for mut record in self.programs.iter_mut() {
            if record.state != ProgramState::Loaded {
                continue;
            }
            let name = record.key().clone();
            let Some(program) = record.loaded.take() else {
                warn!("Program {} marked loaded without a handle", name);
                record.state = ProgramState::Destroyed;
                continue;
            };

            match self.objects.invalidate(program.handle) {
                Some(object) => {
                    if Arc::strong_count(&object) > 1 {
                        warn!(
                            "Program {} still referenced during destroy; releasing on last use",
                            name
                        );
                    }
                    drop(object);
                    destroyed += 1;
                    info!("Destroyed program {}", name);
                }
                None => warn!("Program {} handle {} was already invalid", name, program.handle),
            }
            record.state = ProgramState::Destroyed;
        }

        self.update_gauges();
        destroyed
    }

    pub fn state(&self, program: &str) -> ProgramState {
        self.programs
            .get(program)
            .map(|r| r.state)
            .unwrap_or(ProgramState::NotLoaded)
    }

    /// Table handle for `table` in `program`.
    pub fn map_table(&self, program: &str, table: &str) -> Result<Arc<dyn KernelTable>, MapError> {
        let key = (program.to_string(), table.to_string());
        if let Some(cached) = self.tables.get(&key) {
            return Ok(Arc::clone(cached.value()));
        }

        let loaded = self
            .programs
            .get(program)
            .filter(|r| r.state == ProgramState::Loaded)
            .and_then(|r| r.loaded.clone())
            .ok_or_else(|| MapError::ProgramNotLoaded(program.to_string()))?;

        if !loaded.tables.iter().any(|t| t == table) {
            return Err(MapError::UnknownTable {
                program: program.to_string(),
                table: table.to_string(),
            });
        }

        let object = self.objects.resolve(loaded.handle)?;
        let guard = object.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = self.backend.table(&guard, table)?;
        self.tables.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    fn set_record(
        &self,
        name: &str,
        state: ProgramState,
        loaded: Option<LoadedProgram>,
        error: Option<String>,
    ) {
        self.programs.insert(
            name.to_string(),
            ProgramRecord {
                state,
                loaded,
                error,
            },
        );
    }

    fn update_gauges(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let count = |state| self.programs.iter().filter(|r| r.state == state).count() as i64;
        metrics.loaded.set(count(ProgramState::Loaded));
        metrics.failed.set(count(ProgramState::Failed));
    }
}

impl<B: ProbeBackend> TableSource for ProgramManager<B> {
    fn is_loaded(&self, program: &str) -> bool {
        self.state(program) == ProgramState::Loaded
    }

    fn table(&self, program: &str, table: &str) -> Result<Arc<dyn KernelTable>, MapError> {
        self.map_table(program, table)
    }
}

impl<B: ProbeBackend> ProgramInventory for ProgramManager<B> {
    fn loaded_programs(&self) -> Vec<LoadedProgram> {
        let mut out: Vec<LoadedProgram> = self
            .programs
            .iter()
            .filter(|r| r.state == ProgramState::Loaded)
            .filter_map(|r| r.loaded.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn failed_programs(&self) -> Vec<FailedProgram> {
        let mut out: Vec<FailedProgram> = self
            .programs
            .iter()
            .filter(|r| r.state == ProgramState::Failed)
            .map(|r| FailedProgram {
                name: r.key().clone(),
                error: r.error.clone().unwrap_or_default(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
