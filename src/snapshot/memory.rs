//! In-memory kernel table used for dry runs and tests.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Entry, KernelTable, TableSource};
use crate::error::MapError;

/// Ordered byte map behaving like a kernel hash table.
pub struct MemTable {
    name: String,
    key_size: usize,
    value_size: usize,
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    percpu: Mutex<BTreeMap<Vec<u8>, Vec<Vec<u8>>>>,
    batch_supported: AtomicBool,
    batch_attempts: AtomicUsize,
    /// Deletes left before `delete` starts failing; `usize::MAX` never fails.
    delete_budget: AtomicUsize,
}

impl MemTable {
    pub fn new(name: &str, key_size: usize, value_size: usize) -> Self {
        Self {
            name: name.to_string(),
            key_size,
            value_size,
            entries: Mutex::new(BTreeMap::new()),
            percpu: Mutex::new(BTreeMap::new()),
            batch_supported: AtomicBool::new(true),
            batch_attempts: AtomicUsize::new(0),
            delete_budget: AtomicUsize::new(usize::MAX),
        }
    }

    /// Makes the batch primitive report "unsupported", forcing the legacy path.
    pub fn set_batch_supported(&self, supported: bool) {
        self.batch_supported.store(supported, Ordering::Relaxed);
    }

    /// Lets `n` more deletes succeed, then fails every later one.
    pub fn fail_deletes_after(&self, n: usize) {
        self.delete_budget.store(n, Ordering::Relaxed);
    }

    pub fn batch_attempts(&self) -> usize {
        self.batch_attempts.load(Ordering::Relaxed)
    }

    pub fn insert(&self, key: &[u8], value: &[u8]) {
        self.entries().insert(key.to_vec(), value.to_vec());
    }

    pub fn insert_percpu(&self, key: &[u8], slices: Vec<Vec<u8>>) {
        lock(&self.percpu).insert(key.to_vec(), slices);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries().contains_key(key)
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        lock(&self.entries)
    }

    fn check_key(&self, key: &[u8]) -> Result<(), MapError> {
        if key.len() != self.key_size {
            return Err(MapError::Size {
                table: self.name.clone(),
                what: "key",
                expected: self.key_size,
                actual: key.len(),
            });
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl KernelTable for MemTable {
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
        self.batch_attempts.fetch_add(1, Ordering::Relaxed);
        if !self.batch_supported.load(Ordering::Relaxed) {
            return Err(MapError::BatchUnsupported(self.name.clone()));
        }

        let mut entries = self.entries();
        let keys: Vec<Vec<u8>> = entries.keys().take(max_entries).cloned().collect();
        Ok(keys
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|v| (k, v)))
            .collect())
    }

    fn next_key(&self, prev: Option<&[u8]>) -> Result<Option<Vec<u8>>, MapError> {
        let entries = self.entries();
        let next = match prev {
            None => entries.keys().next().cloned(),
            Some(prev) => {
                self.check_key(prev)?;
                entries
                    .range::<[u8], _>((Bound::Excluded(prev), Bound::Unbounded))
                    .next()
                    .map(|(k, _)| k.clone())
            }
        };
        Ok(next)
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MapError> {
        self.check_key(key)?;
        Ok(self.entries().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<bool, MapError> {
        self.check_key(key)?;
        let allowed = self
            .delete_budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| match left {
                usize::MAX => Some(left),
                0 => None,
                _ => Some(left - 1),
            })
            .is_ok();
        if !allowed {
            return Err(MapError::Io {
                table: self.name.clone(),
                op: "delete",
                reason: "operation not permitted".to_string(),
            });
        }
        Ok(self.entries().remove(key).is_some())
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<(), MapError> {
        self.check_key(key)?;
        if value.len() != self.value_size {
            return Err(MapError::Size {
                table: self.name.clone(),
                what: "value",
                expected: self.value_size,
                actual: value.len(),
            });
        }
        self.insert(key, value);
        Ok(())
    }

    fn lookup_percpu(&self, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>, MapError> {
        self.check_key(key)?;
        Ok(lock(&self.percpu).get(key).cloned())
    }
}

/// [`TableSource`] over a fixed set of in-memory tables.
#[derive(Default)]
pub struct MemTableSource {
    tables: DashMap<(String, String), Arc<MemTable>>,
}

impl MemTableSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty table owned by `program` and returns it.
    pub fn add(&self, program: &str, table: &str, key_size: usize, value_size: usize) -> Arc<MemTable> {
        let mem = Arc::new(MemTable::new(table, key_size, value_size));
        self.tables
            .insert((program.to_string(), table.to_string()), Arc::clone(&mem));
        mem
    }
}

impl TableSource for MemTableSource {
    fn is_loaded(&self, program: &str) -> bool {
        self.tables.iter().any(|e| e.key().0 == program)
    }

    fn table(&self, program: &str, table: &str) -> Result<Arc<dyn KernelTable>, MapError> {
        if !self.is_loaded(program) {
            return Err(MapError::ProgramNotLoaded(program.to_string()));
        }
        self.tables
            .get(&(program.to_string(), table.to_string()))
            .map(|t| Arc::clone(t.value()) as Arc<dyn KernelTable>)
            .ok_or_else(|| MapError::UnknownTable {
                program: program.to_string(),
                table: table.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_key_walks_in_order() {
        let table = MemTable::new("t", 8, 8);
        for id in [3u64, 1, 2] {
            table.insert(&id.to_le_bytes(), &[0; 8]);
        }

        let first = table.next_key(None).unwrap().unwrap();
        let second = table.next_key(Some(&first)).unwrap().unwrap();
        let third = table.next_key(Some(&second)).unwrap().unwrap();

        assert_eq!(first, 1u64.to_le_bytes());
        assert_eq!(second, 2u64.to_le_bytes());
        assert_eq!(third, 3u64.to_le_bytes());
        assert!(table.next_key(Some(&third)).unwrap().is_none());
    }

    #[test]
    fn test_wrong_key_size_rejected() {
        let table = MemTable::new("t", 8, 8);
        assert!(matches!(
            table.lookup(&[1, 2, 3]),
            Err(MapError::Size { what: "key", .. })
        ));
        assert!(table.update(&[0; 8], &[0; 4]).is_err());
    }

    #[test]
    fn test_source_reports_unloaded_program() {
        let source = MemTableSource::new();
        source.add("cpu_sched", "runq_latency", 8, 232);

        assert!(source.is_loaded("cpu_sched"));
        assert!(matches!(
            source.table("net", "tcp_stats_map"),
            Err(MapError::ProgramNotLoaded(_))
        ));
        assert!(matches!(
            source.table("cpu_sched", "nope"),
            Err(MapError::UnknownTable { .. })
        ));
        assert!(source.table("cpu_sched", "runq_latency").is_ok());
    }
}
