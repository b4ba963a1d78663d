//! libbpf-rs backend for the program manager.
//!
//! Object lifecycle goes through libbpf-rs. The batch and get-next-key table
//! calls go straight to libbpf-sys so the raw errno can tell "unsupported"
//! apart from "end of table".

use anyhow::{bail, Context};
use libbpf_rs::{ErrorKind, Link, MapCore, MapFlags, MapHandle, Object, ObjectBuilder, OpenObject};
use std::os::fd::{AsFd, AsRawFd};
use std::os::raw::c_void;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::program::ProbeBackend;
use crate::error::MapError;
use crate::snapshot::{Entry, KernelTable};

/// Probe objects in their lifecycle stages.
pub enum LibbpfObject {
    Opened(OpenObject),
    Loaded {
        object: Object,
        // Programs detach when their links drop.
        links: Vec<Link>,
    },
    Empty,
}

// SAFETY: a LibbpfObject is only reachable through the handle registry, which
// wraps it in a Mutex. libbpf objects are safe to use from any thread as long
// as access is serialised.
unsafe impl Send for LibbpfObject {}

#[derive(Debug, Default, Clone, Copy)]
pub struct LibbpfBackend;

impl ProbeBackend for LibbpfBackend {
    type Object = LibbpfObject;

    fn open(&self, path: &Path) -> anyhow::Result<LibbpfObject> {
        let mut builder = ObjectBuilder::default();
        builder.debug(cfg!(debug_assertions));
        let open = builder
            .open_file(path)
            .with_context(|| format!("opening {}", path.display()))?;
        Ok(LibbpfObject::Opened(open))
    }

    fn load(&self, object: &mut LibbpfObject) -> anyhow::Result<()> {
        match std::mem::replace(object, LibbpfObject::Empty) {
            LibbpfObject::Opened(open) => {
                let loaded = open.load().context("loading object into the kernel")?;
                *object = LibbpfObject::Loaded {
                    object: loaded,
                    links: Vec::new(),
                };
                Ok(())
            }
            other => {
                *object = other;
                bail!("object is not in the opened state")
            }
        }
    }

    fn attach(&self, object: &mut LibbpfObject) -> anyhow::Result<usize> {
        let LibbpfObject::Loaded { object, links } = object else {
            bail!("object is not loaded");
        };
        for mut prog in object.progs_mut() {
            let name = prog.name().to_string_lossy().into_owned();
            let link = prog
                .attach()
                .with_context(|| format!("attaching {name}"))?;
            debug!("Attached {}", name);
            links.push(link);
        }
        Ok(links.len())
    }

    fn table_names(&self, object: &LibbpfObject) -> Vec<String> {
        match object {
            LibbpfObject::Loaded { object, .. } => object
                .maps()
                .map(|m| m.name().to_string_lossy().into_owned())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn table(&self, object: &LibbpfObject, name: &str) -> Result<Arc<dyn KernelTable>, MapError> {
        let LibbpfObject::Loaded { object, .. } = object else {
            return Err(MapError::Io {
                table: name.to_string(),
                op: "open",
                reason: "object is not loaded".into(),
            });
        };
        let map = object
            .maps()
            .find(|m| m.name().to_str() == Some(name))
            .ok_or_else(|| MapError::Io {
                table: name.to_string(),
                op: "open",
                reason: "map not found in object".into(),
            })?;
        let handle = MapHandle::try_from(&map).map_err(|e| io_error(name, "dup", &e))?;
        Ok(Arc::new(LibbpfTable::new(name, handle)))
    }
}

fn io_error(table: &str, op: &'static str, err: &dyn std::fmt::Display) -> MapError {
    MapError::Io {
        table: table.to_string(),
        op,
        reason: err.to_string(),
    }
}

/// Kernel errno values that mean "this kernel cannot batch this table".
fn is_batch_unsupported(errno: i32) -> bool {
    // ENOTSUPP (524) is kernel-internal and has no libc constant.
    matches!(errno, libc::EINVAL | libc::EOPNOTSUPP | libc::ENOSYS | 524)
}

/// Owned handle to one kernel map.
pub struct LibbpfTable {
    name: String,
    handle: MapHandle,
    key_size: usize,
    value_size: usize,
}

impl LibbpfTable {
    pub fn new(name: &str, handle: MapHandle) -> Self {
        Self {
            name: name.to_string(),
            key_size: handle.key_size() as usize,
            value_size: handle.value_size() as usize,
            handle,
        }
    }

    fn fd(&self) -> i32 {
        self.handle.as_fd().as_raw_fd()
    }
}

impl KernelTable for LibbpfTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn value_size(&self) -> usize {
        self.value_size
    }

    fn lookup_and_delete_batch(&self, max_entries: usize) -> Result<Vec<Entry>, MapError> {
        let token_size = self.key_size.max(8);
        let mut in_batch = vec![0u8; token_size];
        let mut out_batch = vec![0u8; token_size];
        let mut keys = vec![0u8; self.key_size * max_entries];
        let mut values = vec![0u8; self.value_size * max_entries];
        let opts = libbpf_sys::bpf_map_batch_opts {
            sz: std::mem::size_of::<libbpf_sys::bpf_map_batch_opts>() as _,
            elem_flags: 0,
            flags: 0,
            ..Default::default()
        };

        let mut total = 0usize;
        let mut first = true;
        while total < max_entries {
            let mut count = (max_entries - total) as u32;
            let in_ptr = if first {
                std::ptr::null_mut()
            } else {
                in_batch.as_mut_ptr() as *mut c_void
            };
            // SAFETY: keys/values hold max_entries slots of the map's key and
            // value size; count never exceeds the remaining slots; the batch
            // tokens are at least as large as the kernel's hash bucket cursor.
            let ret = unsafe {
                libbpf_sys::bpf_map_lookup_and_delete_batch(
                    self.fd(),
                    in_ptr,
                    out_batch.as_mut_ptr() as *mut c_void,
                    keys[total * self.key_size..].as_mut_ptr() as *mut c_void,
                    values[total * self.value_size..].as_mut_ptr() as *mut c_void,
                    &mut count,
                    &opts,
                )
            };

            total += count as usize;
            if ret == 0 {
                if count == 0 {
                    break;
                }
                first = false;
                in_batch.copy_from_slice(&out_batch);
                continue;
            }

            let errno = -ret;
            if errno == libc::ENOENT {
                break;
            }
            if first && total == 0 && is_batch_unsupported(errno) {
                return Err(MapError::BatchUnsupported(self.name.clone()));
            }
            let err = std::io::Error::from_raw_os_error(errno);
            if total > 0 {
                // Entries already returned are gone from the kernel; keep them.
                warn!("Batch drain of {} stopped after {} entries: {}", self.name, total, err);
                break;
            }
            return Err(io_error(&self.name, "lookup_and_delete_batch", &err));
        }

        Ok(keys
            .chunks_exact(self.key_size)
            .zip(values.chunks_exact(self.value_size))
            .take(total)
            .map(|(k, v)| (k.to_vec(), v.to_vec()))
            .collect())
    }

    fn next_key(&self, prev: Option<&[u8]>) -> Result<Option<Vec<u8>>, MapError> {
        let mut next = vec![0u8; self.key_size];
        let prev_ptr = match prev {
            Some(prev) if prev.len() == self.key_size => prev.as_ptr() as *const c_void,
            Some(prev) => {
                return Err(MapError::Size {
                    table: self.name.clone(),
                    what: "key",
                    expected: self.key_size,
                    actual: prev.len(),
                })
            }
            None => std::ptr::null(),
        };
        // SAFETY: prev is either null or key_size bytes; next is key_size bytes.
        let ret = unsafe {
            libbpf_sys::bpf_map_get_next_key(self.fd(), prev_ptr, next.as_mut_ptr() as *mut c_void)
        };
        match -ret {
            0 => Ok(Some(next)),
            libc::ENOENT => Ok(None),
            errno => Err(io_error(
                &self.name,
                "get_next_key",
                &std::io::Error::from_raw_os_error(errno),
            )),
        }
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        self.handle
            .lookup(key, MapFlags::ANY)
            .map_err(|e| io_error(&self.name, "lookup", &e))
    }

    fn delete(&self, key: &[u8]) -> Result<bool, MapError> {
        match self.handle.delete(key) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&self.name, "delete", &e)),
        }
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), MapError> {
        self.handle
            .update(key, value, MapFlags::ANY)
            .map_err(|e| io_error(&self.name, "update", &e))
    }

    fn lookup_percpu(&self, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>, MapError> {
        self.handle
            .lookup_percpu(key, MapFlags::ANY)
            .map_err(|e| io_error(&self.name, "lookup_percpu", &e))
    }
}
