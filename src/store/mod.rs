//! キー付きオブジェクトストア
//!
//! Project / Dataset / Model の3種類のレコードをプロジェクトIDで保存します。
//! 重みなどのバイナリは別のblob領域に文字列キーで保存します。
//!
//! - `put` はレコード全体の置き換え（部分更新はしない）
//! - `find` は存在しない場合 [`StoreError::NotFound`] を返す（初期化は呼び出し側の責務）

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use serde::{de::DeserializeOwned, Serialize};

pub use crate::error::RecordKind;
use crate::error::StoreError;
use crate::model::ModelRecord;
use crate::types::{Dataset, Project, ProjectId};

/// 永続化の抽象インターフェース
///
/// 同一キーへの書き込みは直列化され、読み込み側が書きかけのレコードを
/// 観測することはありません。
pub trait ObjectStore: Send + Sync {
    fn get_raw(&self, kind: RecordKind, project_id: ProjectId) -> Result<Option<Vec<u8>>, StoreError>;
    fn put_raw(&self, kind: RecordKind, project_id: ProjectId, bytes: Vec<u8>) -> Result<(), StoreError>;
    /// 指定種類のキー一覧（昇順）
    fn keys(&self, kind: RecordKind) -> Result<Vec<ProjectId>, StoreError>;

    fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
    fn delete_blob(&self, key: &str) -> Result<(), StoreError>;
}

/// ストアに保存できるレコード
pub trait Record: Serialize + DeserializeOwned {
    const KIND: RecordKind;

    fn project_id(&self) -> ProjectId;
}

impl Record for Project {
    const KIND: RecordKind = RecordKind::Project;

    fn project_id(&self) -> ProjectId {
        self.id
    }
}

impl Record for Dataset {
    const KIND: RecordKind = RecordKind::Dataset;

    fn project_id(&self) -> ProjectId {
        self.project_id
    }
}

impl Record for ModelRecord {
    const KIND: RecordKind = RecordKind::Model;

    fn project_id(&self) -> ProjectId {
        self.project_id
    }
}

/// 型付きの読み書き
pub trait RecordStoreExt {
    fn find<R: Record>(&self, project_id: ProjectId) -> Result<R, StoreError>;
    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError>;
    fn find_all<R: Record>(&self) -> Result<Vec<R>, StoreError>;
}

impl<S: ObjectStore + ?Sized> RecordStoreExt for S {
    fn find<R: Record>(&self, project_id: ProjectId) -> Result<R, StoreError> {
        let bytes = self
            .get_raw(R::KIND, project_id)?
            .ok_or(StoreError::NotFound {
                kind: R::KIND,
                project_id,
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)?;
        self.put_raw(R::KIND, record.project_id(), bytes)
    }

    fn find_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        self.keys(R::KIND)?
            .into_iter()
            .map(|project_id| self.find(project_id))
            .collect()
    }
}

/// blobキーはファイル名としても使うため英数字・`-`・`_` のみ許可
pub(crate) fn validate_blob_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! 両実装に共通する振る舞いのテスト
    use super::*;
    use crate::types::{Image, Label};

    pub fn find_missing_is_not_found(store: &dyn ObjectStore) {
        let err = store.find::<Dataset>(42).unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            err,
            StoreError::NotFound {
                kind: RecordKind::Dataset,
                project_id: 42
            }
        ));
    }

    pub fn put_replaces_whole_record(store: &dyn ObjectStore) {
        let mut dataset = Dataset::empty(7);
        dataset.labels.push(Label {
            name: "cat".to_string(),
            images: vec![Image::new(vec![1, 2, 3])],
        });
        store.put(&dataset).unwrap();

        let replacement = Dataset::empty(7);
        store.put(&replacement).unwrap();

        let loaded: Dataset = store.find(7).unwrap();
        assert_eq!(loaded, replacement);
    }

    pub fn kinds_are_independent(store: &dyn ObjectStore) {
        store.put(&Dataset::empty(3)).unwrap();
        assert!(store.find::<Project>(3).unwrap_err().is_not_found());
        assert_eq!(store.keys(RecordKind::Dataset).unwrap(), vec![3]);
        assert!(store.keys(RecordKind::Model).unwrap().is_empty());
    }

    pub fn keys_are_sorted(store: &dyn ObjectStore) {
        for id in [5, 1, 3] {
            store.put(&Dataset::empty(id)).unwrap();
        }
        assert_eq!(store.keys(RecordKind::Dataset).unwrap(), vec![1, 3, 5]);
        let all: Vec<Dataset> = store.find_all().unwrap();
        assert_eq!(all.iter().map(|d| d.project_id).collect::<Vec<_>>(), vec![1, 3, 5]);
    }

    pub fn blobs_round_trip(store: &dyn ObjectStore) {
        assert!(store.get_blob("model-1-a").unwrap().is_none());
        store.put_blob("model-1-a", vec![9, 8, 7]).unwrap();
        assert_eq!(store.get_blob("model-1-a").unwrap(), Some(vec![9, 8, 7]));
        store.delete_blob("model-1-a").unwrap();
        assert!(store.get_blob("model-1-a").unwrap().is_none());
        // 存在しないblobの削除はエラーにしない
        store.delete_blob("model-1-a").unwrap();

        assert!(matches!(
            store.put_blob("../escape", vec![]),
            Err(StoreError::InvalidKey(_))
        ));
    }

    pub fn concurrent_writers_never_tear(store: std::sync::Arc<dyn ObjectStore>) {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let mut dataset = Dataset::empty(1);
                        dataset.labels.push(Label {
                            name: format!("writer-{}", i),
                            images: vec![Image::new(vec![i as u8; 64])],
                        });
                        store.put(&dataset).unwrap();
                        let loaded: Dataset = store.find(1).unwrap();
                        assert_eq!(loaded.labels.len(), 2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
