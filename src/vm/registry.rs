//! VM Registry - the process-wide table of live VMs
//!
//! The map itself sits behind a `std::sync::RwLock` that is never held across
//! an `.await`. Read-then-act sequences on a single identifier (kill, lookup
//! plus validation, association) take a per-identifier async guard from
//! [`VmRegistry::lock_id`] so two structural changes to the same id can never
//! interleave.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::handle::VmHandle;
use crate::error::{Result, VmError};
use crate::metrics::VMS_REGISTERED;

type IdLock = Arc<AsyncMutex<()>>;

/// Mapping from VM identifier to handle
#[derive(Default)]
pub struct VmRegistry {
    vms: RwLock<BTreeMap<String, Arc<VmHandle>>>,
    id_locks: Arc<Mutex<HashMap<String, IdLock>>>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle. Refuses to replace a live handle with the same id.
    pub fn add(&self, handle: Arc<VmHandle>) -> Result<()> {
        let mut vms = self.vms.write().unwrap_or_else(|e| e.into_inner());
        if vms.contains_key(handle.id()) {
            return Err(VmError::AlreadyRegistered(handle.id().to_string()));
        }
        vms.insert(handle.id().to_string(), handle);
        VMS_REGISTERED.set(vms.len() as f64);
        Ok(())
    }

    /// Deregister a VM. Absent ids are ignored.
    pub fn remove(&self, vm_id: &str) -> Option<Arc<VmHandle>> {
        let mut vms = self.vms.write().unwrap_or_else(|e| e.into_inner());
        let removed = vms.remove(vm_id);
        VMS_REGISTERED.set(vms.len() as f64);
        removed
    }

    pub fn lookup(&self, vm_id: &str) -> Option<Arc<VmHandle>> {
        self.vms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(vm_id)
            .cloned()
    }

    pub fn contains(&self, vm_id: &str) -> bool {
        self.vms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(vm_id)
    }

    /// Snapshot of every registered handle, in ascending id order
    pub fn all(&self) -> Vec<Arc<VmHandle>> {
        self.vms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize work on one identifier until the guard is dropped
    pub async fn lock_id(&self, vm_id: &str) -> IdGuard {
        let lock = {
            let mut locks = self.id_locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(vm_id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        IdGuard {
            vm_id: vm_id.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.id_locks),
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.id_locks.lock().unwrap().len()
    }
}

impl std::fmt::Debug for VmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRegistry").field("len", &self.len()).finish()
    }
}

/// Held while a caller owns an identifier
pub struct IdGuard {
    vm_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<Mutex<HashMap<String, IdLock>>>,
}

impl Drop for IdGuard {
    fn drop(&mut self) {
        // Unlock first, then prune the entry if nobody else holds or awaits it.
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(&self.vm_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.vm_id);
            }
        }
    }
}

impl std::fmt::Debug for IdGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGuard").field("vm_id", &self.vm_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::testing::stub_handle;
    use std::time::Duration;

    #[test]
    fn test_add_lookup_remove() {
        let registry = VmRegistry::new();
        registry.add(stub_handle("vm-b", 1, 128)).unwrap();
        registry.add(stub_handle("vm-a", 2, 256)).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup("vm-a").unwrap().cpu(), 2);
        assert!(registry.lookup("vm-zzz").is_none());

        let ids: Vec<String> = registry.all().iter().map(|h| h.id().to_string()).collect();
        assert_eq!(ids, vec!["vm-a", "vm-b"]);

        assert!(registry.remove("vm-a").is_some());
        assert!(registry.remove("vm-a").is_none());
        assert!(!registry.contains("vm-a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_add_refused() {
        let registry = VmRegistry::new();
        registry.add(stub_handle("vm-a", 1, 128)).unwrap();
        let err = registry.add(stub_handle("vm-a", 4, 512)).unwrap_err();
        assert!(matches!(err, VmError::AlreadyRegistered(_)));
        assert_eq!(registry.lookup("vm-a").unwrap().cpu(), 1);
    }

    #[tokio::test]
    async fn test_id_lock_serializes() {
        let registry = Arc::new(VmRegistry::new());
        let guard = registry.lock_id("vm-a").await;

        let other = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            let _g = other.lock_id("vm-a").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(registry.tracked_locks(), 0);
    }

    #[tokio::test]
    async fn test_distinct_ids_do_not_block() {
        let registry = VmRegistry::new();
        let _a = registry.lock_id("vm-a").await;
        let _b = tokio::time::timeout(Duration::from_millis(50), registry.lock_id("vm-b"))
            .await
            .expect("lock on a different id must not wait");
    }
}
