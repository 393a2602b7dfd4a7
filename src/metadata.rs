//! Persisted VM metadata
//!
//! The lifecycle core treats metadata as opaque bytes keyed by VM id. It is
//! written after a VM is confirmed running, read back when a pod has to be
//! re-attached to a VM after a daemon restart, and deleted once the VM is
//! gone. A missing entry is reported as `io::ErrorKind::NotFound`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

/// Key/value store of serialized VM state
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_vm_metadata(&self, vm_id: &str) -> io::Result<Vec<u8>>;

    async fn put_vm_metadata(&self, vm_id: &str, data: &[u8]) -> io::Result<()>;

    /// Remove an entry. Missing entries are not an error.
    async fn delete_vm_metadata(&self, vm_id: &str) -> io::Result<()>;

    async fn list_vms(&self) -> io::Result<Vec<String>>;
}

/// Volatile store, useful for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get_vm_metadata(&self, vm_id: &str) -> io::Result<Vec<u8>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(vm_id)
            .cloned()
            .ok_or_else(|| not_found(vm_id))
    }

    async fn put_vm_metadata(&self, vm_id: &str, data: &[u8]) -> io::Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vm_id.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete_vm_metadata(&self, vm_id: &str) -> io::Result<()> {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(vm_id);
        Ok(())
    }

    async fn list_vms(&self) -> io::Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// One file per VM under a base directory (`{base_dir}/{vm_id}.meta`)
#[derive(Debug, Clone)]
pub struct DirMetadataStore {
    base_dir: PathBuf,
}

const METADATA_EXT: &str = "meta";

impl DirMetadataStore {
    /// Create a store, creating `base_dir` if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn entry_path(&self, vm_id: &str) -> io::Result<PathBuf> {
        if vm_id.is_empty() || vm_id.contains('/') || vm_id.contains('\\') || vm_id.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid VM id {:?}", vm_id),
            ));
        }
        Ok(self.base_dir.join(format!("{}.{}", vm_id, METADATA_EXT)))
    }
}

#[async_trait]
impl MetadataStore for DirMetadataStore {
    async fn get_vm_metadata(&self, vm_id: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.entry_path(vm_id)?).await
    }

    async fn put_vm_metadata(&self, vm_id: &str, data: &[u8]) -> io::Result<()> {
        // Readers never observe a partially written entry.
        let path = self.entry_path(vm_id)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    async fn delete_vm_metadata(&self, vm_id: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.entry_path(vm_id)?).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn list_vms(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == METADATA_EXT).unwrap_or(false) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn not_found(vm_id: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no metadata for {}", vm_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryMetadataStore::new();
        let err = store.get_vm_metadata("vm-1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        store.put_vm_metadata("vm-1", b"state").await.unwrap();
        assert_eq!(store.get_vm_metadata("vm-1").await.unwrap(), b"state");
        assert_eq!(store.list_vms().await.unwrap(), vec!["vm-1"]);

        store.delete_vm_metadata("vm-1").await.unwrap();
        store.delete_vm_metadata("vm-1").await.unwrap();
        assert!(store.list_vms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dir_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirMetadataStore::new(dir.path().join("vms")).unwrap();

        store.put_vm_metadata("vm-b", b"{\"pid\":2}").await.unwrap();
        store.put_vm_metadata("vm-a", b"{\"pid\":1}").await.unwrap();
        assert_eq!(store.list_vms().await.unwrap(), vec!["vm-a", "vm-b"]);
        assert_eq!(store.get_vm_metadata("vm-a").await.unwrap(), b"{\"pid\":1}");

        store.delete_vm_metadata("vm-a").await.unwrap();
        let err = store.get_vm_metadata("vm-a").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        store.delete_vm_metadata("vm-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_dir_store_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirMetadataStore::new(dir.path()).unwrap();
        let err = store.get_vm_metadata("../etc/passwd").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
