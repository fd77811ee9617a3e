use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{validate_blob_key, ObjectStore};
use crate::error::{RecordKind, StoreError};
use crate::types::ProjectId;

/// メモリ上のストア（テスト・一時利用向け）
///
/// レコードはバイト列ごと置き換えるため、読み込み側が途中状態を見ることはない。
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<(RecordKind, ProjectId), Vec<u8>>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryStore {
    fn get_raw(&self, kind: RecordKind, project_id: ProjectId) -> Result<Option<Vec<u8>>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(&(kind, project_id)).cloned())
    }

    fn put_raw(&self, kind: RecordKind, project_id: ProjectId, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.insert((kind, project_id), bytes);
        Ok(())
    }

    fn keys(&self, kind: RecordKind) -> Result<Vec<ProjectId>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
            .collect())
    }

    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_blob_key(key)?;
        let blobs = self.blobs.read().map_err(|_| StoreError::Poisoned)?;
        Ok(blobs.get(key).cloned())
    }

    fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        validate_blob_key(key)?;
        let mut blobs = self.blobs.write().map_err(|_| StoreError::Poisoned)?;
        blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    fn delete_blob(&self, key: &str) -> Result<(), StoreError> {
        validate_blob_key(key)?;
        let mut blobs = self.blobs.write().map_err(|_| StoreError::Poisoned)?;
        blobs.remove(key);
        Ok(())
    }
}
