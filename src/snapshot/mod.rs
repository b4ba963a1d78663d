//! Read-and-clear draining of kernel-resident tables.
//!
//! Every drain first asks the table for an atomic batch lookup-and-delete. When
//! the kernel reports the batch primitive as unsupported the drain falls back to
//! the legacy path: enumerate every key with non-mutating get-next-key calls,
//! then look up and delete each key. Keys are collected before any deletion so
//! that mutating the hash table cannot perturb the walk.

pub mod decode;
pub mod memory;

use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::{DecodeError, MapError};

pub use memory::{MemTable, MemTableSource};

/// Upper bound on entries returned by a single drain.
pub const MAX_ENTRIES: usize = 10240;

/// One raw (key, value) pair read from a kernel table.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Byte-level access to one kernel-resident table.
///
/// Absence and failure are distinct outcomes: lookups return `Ok(None)` for a
/// missing key and `Err` only when the kernel call itself failed.
pub trait KernelTable: Send + Sync {
    fn name(&self) -> &str;

    fn key_size(&self) -> usize;

    fn value_size(&self) -> usize;

    /// Atomically reads and removes up to `max_entries` entries.
    ///
    /// Returns [`MapError::BatchUnsupported`] when the running kernel lacks the
    /// batch primitive for this table.
    fn lookup_and_delete_batch(&self, max_entries: usize) -> Result<Vec<Entry>, MapError>;

    /// Key following `prev` in iteration order, or the first key when `prev` is
    /// `None`. `Ok(None)` marks the end of the table.
    fn next_key(&self, prev: Option<&[u8]>) -> Result<Option<Vec<u8>>, MapError>;

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError>;

    /// Deletes `key`; `Ok(false)` when it was not present.
    fn delete(&self, key: &[u8]) -> Result<bool, MapError>;

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), MapError>;

    /// One value slice per possible CPU for per-CPU tables.
    fn lookup_percpu(&self, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>, MapError>;
}

/// Resolves tables by (program, table) name.
pub trait TableSource: Send + Sync {
    fn is_loaded(&self, program: &str) -> bool;

    fn table(&self, program: &str, table: &str) -> Result<Arc<dyn KernelTable>, MapError>;
}

/// Drains `table` with the default entry bound.
pub fn drain(table: &dyn KernelTable) -> Result<Vec<Entry>, MapError> {
    drain_bounded(table, MAX_ENTRIES)
}

/// Drains up to `max_entries` entries, falling back to the legacy path when
/// batching is unsupported.
pub fn drain_bounded(table: &dyn KernelTable, max_entries: usize) -> Result<Vec<Entry>, MapError> {
    match table.lookup_and_delete_batch(max_entries) {
        Ok(entries) => {
            trace!("Drained {} entries from {} (batch)", entries.len(), table.name());
            Ok(entries)
        }
        Err(MapError::BatchUnsupported(_)) => {
            debug!(
                "Batch lookup-and-delete unsupported on {}, using legacy drain",
                table.name()
            );
            drain_legacy(table, max_entries)
        }
        Err(e) => Err(e),
    }
}

/// Enumerate-then-lookup-then-delete drain.
pub fn drain_legacy(table: &dyn KernelTable, max_entries: usize) -> Result<Vec<Entry>, MapError> {
    let keys = enumerate_keys(table, max_entries)?;
    let mut entries = Vec::with_capacity(keys.len());

    for key in keys {
        // Entry may have been removed concurrently (pod cleanup); skip it.
        let value = match table.lookup(&key).and_then(|value| {
            if value.is_some() {
                table.delete(&key)?;
            }
            Ok(value)
        }) {
            Ok(Some(value)) => value,
            Ok(None) => continue,
            // Entries already deleted are gone from the table; keep them.
            Err(e) if !entries.is_empty() => {
                warn!(
                    "Legacy drain of {} stopped after {} entries: {}",
                    table.name(),
                    entries.len(),
                    e
                );
                return Ok(entries);
            }
            Err(e) => return Err(e),
        };
        entries.push((key, value));
    }

    trace!("Drained {} entries from {} (legacy)", entries.len(), table.name());
    Ok(entries)
}

/// Walks the table with get-next-key without mutating it.
pub fn enumerate_keys(table: &dyn KernelTable, max_entries: usize) -> Result<Vec<Vec<u8>>, MapError> {
    let mut keys: Vec<Vec<u8>> = Vec::new();
    while keys.len() < max_entries {
        match table.next_key(keys.last().map(Vec::as_slice))? {
            Some(key) => keys.push(key),
            None => break,
        }
    }
    Ok(keys)
}

/// Deletes every key for which `matches` returns true. Returns the number of
/// deleted entries.
pub fn delete_where<F>(table: &dyn KernelTable, matches: F) -> Result<usize, MapError>
where
    F: Fn(&[u8]) -> bool,
{
    let mut deleted = 0;
    for key in enumerate_keys(table, MAX_ENTRIES)? {
        if matches(&key) && table.delete(&key)? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Sums signed 64-bit per-CPU slices into one value.
pub fn sum_percpu_i64(slices: &[Vec<u8>]) -> Result<i64, DecodeError> {
    slices.iter().try_fold(0i64, |acc, slice| {
        if slice.len() < 8 {
            return Err(DecodeError::SizeMismatch {
                record: "per-cpu counter",
                expected: 8,
                actual: slice.len(),
            });
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&slice[..8]);
        Ok(acc.wrapping_add(i64::from_le_bytes(buf)))
    })
}
