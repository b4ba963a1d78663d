//! Kernel probe lifecycle.
//!
//! When the `ebpf` feature is disabled the agent still builds and runs; every
//! program load fails with a clear error and collection units become no-ops.

pub mod handle;
#[cfg(feature = "ebpf")]
pub mod libbpf;
pub mod program;

pub use handle::{HandleRegistry, NativeHandle};
pub use program::{
    BinaryVariant, FailedProgram, LoadSummary, LoadedProgram, ProbeBackend, ProgramInventory,
    ProgramManager, ProgramState, BTF_PATH,
};

#[cfg(feature = "ebpf")]
pub use self::libbpf::LibbpfBackend as DefaultBackend;

#[cfg(not(feature = "ebpf"))]
pub use self::unavailable::UnavailableBackend as DefaultBackend;

#[cfg(not(feature = "ebpf"))]
mod unavailable {
    use std::path::Path;
    use std::sync::Arc;

    use super::ProbeBackend;
    use crate::error::MapError;
    use crate::snapshot::KernelTable;

    /// Backend for builds without libbpf.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct UnavailableBackend;

    impl ProbeBackend for UnavailableBackend {
        type Object = ();

        fn open(&self, path: &Path) -> anyhow::Result<()> {
            anyhow::bail!(
                "cannot open {}: built without the ebpf feature",
                path.display()
            )
        }

        fn load(&self, _object: &mut ()) -> anyhow::Result<()> {
            anyhow::bail!("built without the ebpf feature")
        }

        fn attach(&self, _object: &mut ()) -> anyhow::Result<usize> {
            anyhow::bail!("built without the ebpf feature")
        }

        fn table_names(&self, _object: &()) -> Vec<String> {
            Vec::new()
        }

        fn table(&self, _object: &(), name: &str) -> Result<Arc<dyn KernelTable>, MapError> {
            Err(MapError::Io {
                table: name.to_string(),
                op: "open",
                reason: "built without the ebpf feature".into(),
            })
        }
    }
}
