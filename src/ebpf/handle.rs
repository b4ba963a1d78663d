//! Opaque-id indirection over native probe objects.
//!
//! Native objects never leave this registry as raw references. Callers hold a
//! [`NativeHandle`] and resolve it on each use; once a handle is invalidated it
//! can never resolve again, and ids are never reused.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::HandleError;

/// Monotonically assigned id for a registered native object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(u64);

impl NativeHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Concurrent arena of native objects addressed by [`NativeHandle`].
pub struct HandleRegistry<T> {
    next_id: AtomicU64,
    entries: DashMap<u64, Arc<T>>,
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            // 0 is never handed out so a zeroed id is always Unknown
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
        }
    }

    /// Stores `value` and returns a fresh handle for it.
    pub fn register(&self, value: T) -> NativeHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, Arc::new(value));
        NativeHandle(id)
    }

    /// Returns the object behind `handle`.
    ///
    /// Fails with [`HandleError::Invalidated`] for handles that were issued and
    /// later invalidated, and [`HandleError::Unknown`] for ids never issued.
    pub fn resolve(&self, handle: NativeHandle) -> Result<Arc<T>, HandleError> {
        self.entries
            .get(&handle.0)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| self.missing(handle))
    }

    /// Removes `handle` from the registry, returning the object it referenced.
    ///
    /// The object is dropped once the last outstanding `Arc` from a prior
    /// `resolve` is released.
    pub fn invalidate(&self, handle: NativeHandle) -> Option<Arc<T>> {
        self.entries.remove(&handle.0).map(|(_, value)| value)
    }

    pub fn is_valid(&self, handle: NativeHandle) -> bool {
        self.entries.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn missing(&self, handle: NativeHandle) -> HandleError {
        if handle.0 != 0 && handle.0 < self.next_id.load(Ordering::Relaxed) {
            HandleError::Invalidated(handle.0)
        } else {
            HandleError::Unknown(handle.0)
        }
    }
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_resolve_returns_registered_value() {
        let registry = HandleRegistry::new();
        let handle = registry.register("cpu_sched".to_string());

        assert!(registry.is_valid(handle));
        assert_eq!(*registry.resolve(handle).unwrap(), "cpu_sched");
    }

    #[test]
    fn test_invalidated_handle_fails_loudly() {
        let registry = HandleRegistry::new();
        let handle = registry.register(7u32);

        let removed = registry.invalidate(handle);
        assert_eq!(removed.as_deref(), Some(&7));
        assert!(!registry.is_valid(handle));
        assert_eq!(
            registry.resolve(handle).unwrap_err(),
            HandleError::Invalidated(handle.id())
        );
        assert!(registry.invalidate(handle).is_none());
    }

    #[test]
    fn test_unknown_handle() {
        let registry: HandleRegistry<u32> = HandleRegistry::new();
        assert_eq!(
            registry.resolve(NativeHandle(99)).unwrap_err(),
            HandleError::Unknown(99)
        );
        assert_eq!(
            registry.resolve(NativeHandle(0)).unwrap_err(),
            HandleError::Unknown(0)
        );
    }

    #[test]
    fn test_ids_are_never_reused() {
        let registry = HandleRegistry::new();
        let first = registry.register(1u8);
        registry.invalidate(first);
        let second = registry.register(2u8);

        assert_ne!(first, second);
        assert!(second.id() > first.id());
        assert!(registry.resolve(first).is_err());
        assert_eq!(*registry.resolve(second).unwrap(), 2);
    }

    #[test]
    fn test_concurrent_registration_yields_unique_ids() {
        let registry = HandleRegistry::new();
        let handles: Vec<NativeHandle> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|t| {
                    let registry = &registry;
                    scope.spawn(move || {
                        (0..100)
                            .map(|i| {
                                let h = registry.register(t * 1000 + i);
                                assert_eq!(*registry.resolve(h).unwrap(), t * 1000 + i);
                                h
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = handles.iter().copied().collect();
        assert_eq!(unique.len(), 800);
        assert_eq!(registry.len(), 800);
    }
}
