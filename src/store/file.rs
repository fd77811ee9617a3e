//! ディレクトリベースのストア
//!
//! ファイル構成:
//! - `projects/<id>.json`
//! - `datasets/<id>.json`
//! - `models/<id>.json`
//! - `weights/<key>.bin`  - 重みバンドル（tar.gz）
//!
//! 書き込みは同じディレクトリ内の一時ファイルに書いてからリネームするため、
//! 読み込み側が書きかけのファイルを見ることはありません。

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;

use super::{validate_blob_key, ObjectStore};
use crate::error::{RecordKind, StoreError};
use crate::types::ProjectId;

const WEIGHTS_DIR: &str = "weights";

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// パスごとの書き込みロック
    write_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileStore {
    /// ルートディレクトリを指定してストアを開く（無ければ作成）
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        for dir in [
            RecordKind::Project.as_str(),
            RecordKind::Dataset.as_str(),
            RecordKind::Model.as_str(),
            WEIGHTS_DIR,
        ] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|source| StoreError::Io { path, source })?;
        }
        tracing::debug!(root = %root.display(), "ファイルストアを開きました");
        Ok(Self {
            root,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, kind: RecordKind, project_id: ProjectId) -> PathBuf {
        self.root.join(kind.as_str()).join(format!("{}.json", project_id))
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_blob_key(key)?;
        Ok(self.root.join(WEIGHTS_DIR).join(format!("{}.bin", key)))
    }

    /// パス単位の書き込みロックを保持したまま `work` を実行する
    ///
    /// 使い終わったロックは待機者がいなければ表から取り除く。
    fn with_write_lock<T>(
        &self,
        path: &Path,
        work: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock = {
            let mut locks = self.write_locks.lock().map_err(|_| StoreError::Poisoned)?;
            Arc::clone(
                locks
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };

        let result = {
            let _guard = lock.lock().map_err(|_| StoreError::Poisoned)?;
            work()
        };

        let mut locks = self.write_locks.lock().map_err(|_| StoreError::Poisoned)?;
        // 表と自分以外に参照がなければ誰も待っていない
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
        result
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        self.with_write_lock(path, || {
            let dir = path.parent().unwrap_or(&self.root);
            let io_err = |source: std::io::Error| StoreError::Io {
                path: path.to_path_buf(),
                source,
            };
            let mut temp = NamedTempFile::new_in(dir).map_err(io_err)?;
            temp.write_all(bytes).map_err(io_err)?;
            temp.as_file().sync_all().map_err(io_err)?;
            temp.persist(path).map_err(|e| io_err(e.error))?;
            Ok(())
        })
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

impl ObjectStore for FileStore {
    fn get_raw(&self, kind: RecordKind, project_id: ProjectId) -> Result<Option<Vec<u8>>, StoreError> {
        read_optional(&self.record_path(kind, project_id))
    }

    fn put_raw(&self, kind: RecordKind, project_id: ProjectId, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.write_atomic(&self.record_path(kind, project_id), &bytes)
    }

    fn keys(&self, kind: RecordKind) -> Result<Vec<ProjectId>, StoreError> {
        let dir = self.root.join(kind.as_str());
        let entries = fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;

        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            // 一時ファイルや無関係なファイルは無視
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<ProjectId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        read_optional(&self.blob_path(key)?)
    }

    fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.blob_path(key)?;
        self.write_atomic(&path, &bytes)
    }

    fn delete_blob(&self, key: &str) -> Result<(), StoreError> {
        let path = self.blob_path(key)?;
        self.with_write_lock(&path, || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                path: path.clone(),
                source,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::{contract, RecordStoreExt};
    use super::*;
    use crate::types::Dataset;

    fn open_temp() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_file_store_contract() {
        let (_dir, store) = open_temp();
        contract::find_missing_is_not_found(&store);
        let (_dir, store) = open_temp();
        contract::put_replaces_whole_record(&store);
        let (_dir, store) = open_temp();
        contract::kinds_are_independent(&store);
        let (_dir, store) = open_temp();
        contract::keys_are_sorted(&store);
        let (_dir, store) = open_temp();
        contract::blobs_round_trip(&store);
    }

    #[test]
    fn test_file_store_concurrent_writers() {
        let (_dir, store) = open_temp();
        contract::concurrent_writers_never_tear(Arc::new(store));
    }

    #[test]
    fn test_write_locks_are_released() {
        let (_dir, store) = open_temp();
        for key in ["model-1-a", "model-1-b", "model-2-a"] {
            store.put_blob(key, vec![1, 2, 3]).unwrap();
            store.delete_blob(key).unwrap();
        }
        for project_id in 1..=20 {
            store.put(&Dataset::empty(project_id)).unwrap();
        }
        assert!(store.write_locks.lock().unwrap().is_empty());
        assert_eq!(store.keys(RecordKind::Dataset).unwrap().len(), 20);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.put(&Dataset::empty(11)).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        let dataset: Dataset = store.find(11).unwrap();
        assert_eq!(dataset, Dataset::empty(11));
        assert!(dir.path().join("datasets").join("11.json").exists());
    }

    #[test]
    fn test_keys_ignore_foreign_files() {
        let (dir, store) = open_temp();
        store.put(&Dataset::empty(2)).unwrap();
        fs::write(dir.path().join("datasets").join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("datasets").join("abc.json"), b"{}").unwrap();
        assert_eq!(store.keys(RecordKind::Dataset).unwrap(), vec![2]);
    }
}
