//! データセット管理
//!
//! プロジェクトごとのラベル付き画像集合を読み書きします。
//! 同一プロジェクトへの読み込み→変更→書き込みはプロジェクト単位のロックで直列化するため、
//! 別ラベルへの同時追加で画像が失われることはありません。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::error::{EngineError, Result, StoreError};
use crate::ml::codec;
use crate::store::{ObjectStore, RecordStoreExt};
use crate::types::{Dataset, Image, Label, Project, ProjectId, UNLABELED};

/// 学習に必要なラベル数（"Unlabeled" を除く）
pub const MIN_TRAINABLE_LABELS: usize = 2;
/// 各ラベルに必要な画像枚数
pub const MIN_IMAGES_PER_LABEL: usize = 5;

/// "Unlabeled" を除いたラベル（保存順）
pub fn trainable_labels(dataset: &Dataset) -> Vec<&Label> {
    dataset
        .labels
        .iter()
        .filter(|label| !label.is_unlabeled())
        .collect()
}

/// 学習可能か判定し、不可なら理由つきのエラーを返す
pub fn check_trainable(dataset: &Dataset) -> Result<()> {
    let labels = trainable_labels(dataset);
    if labels.len() < MIN_TRAINABLE_LABELS {
        return Err(EngineError::NotTrainable {
            reason: format!(
                "need at least {} labels, found {}",
                MIN_TRAINABLE_LABELS,
                labels.len()
            ),
        });
    }
    if let Some(label) = labels
        .iter()
        .find(|label| label.images.len() < MIN_IMAGES_PER_LABEL)
    {
        return Err(EngineError::NotTrainable {
            reason: format!(
                "label '{}' has {} images, needs at least {}",
                label.name,
                label.images.len(),
                MIN_IMAGES_PER_LABEL
            ),
        });
    }
    Ok(())
}

/// 学習可能か
pub fn is_trainable(dataset: &Dataset) -> bool {
    check_trainable(dataset).is_ok()
}

fn validate_label_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidLabel(name.to_string()));
    }
    Ok(())
}

/// データセット管理
pub struct DatasetManager {
    store: Arc<dyn ObjectStore>,
    project_locks: Mutex<HashMap<ProjectId, Arc<Mutex<()>>>>,
    /// プロジェクトID採番用
    id_lock: Mutex<()>,
}

impl DatasetManager {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            project_locks: Mutex::new(HashMap::new()),
            id_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// プロジェクト単位のロックを保持したまま `work` を実行する
    ///
    /// 使い終わったロックは待機者がいなければ表から取り除く。
    fn with_project_lock<T>(&self, project_id: ProjectId, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = {
            let mut locks = self
                .project_locks
                .lock()
                .map_err(|_| StoreError::Poisoned)?;
            Arc::clone(locks.entry(project_id).or_default())
        };

        let result = {
            let _guard = lock.lock().map_err(|_| StoreError::Poisoned)?;
            work()
        };

        let mut locks = self
            .project_locks
            .lock()
            .map_err(|_| StoreError::Poisoned)?;
        // 表と自分以外に参照がなければ誰も待っていない
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&project_id);
        }
        result
    }

    /// プロジェクトを作成（IDは既存の最大値+1、最初は1）
    pub fn create_project(&self, name: &str) -> Result<Project> {
        let _guard = self.id_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let next_id = self
            .store
            .keys(crate::store::RecordKind::Project)?
            .last()
            .map_or(1, |id| id + 1);

        let project = Project {
            id: next_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.store.put(&project)?;
        tracing::info!(project_id = project.id, "プロジェクトを作成しました: {}", project.name);
        Ok(project)
    }

    pub fn find_project(&self, project_id: ProjectId) -> Result<Project> {
        Ok(self.store.find(project_id)?)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.store.find_all()?)
    }

    /// 保存済みデータセットを取得（存在しなければ NotFound）
    pub fn find_dataset(&self, project_id: ProjectId) -> Result<Dataset> {
        Ok(self.store.find(project_id)?)
    }

    /// データセットを取得し、なければ "Unlabeled" のみで作成する
    pub fn ensure_dataset(&self, project_id: ProjectId) -> Result<Dataset> {
        self.with_project_lock(project_id, || self.load_or_create(project_id))
    }

    fn load_or_create(&self, project_id: ProjectId) -> Result<Dataset> {
        match self.store.find::<Dataset>(project_id) {
            Ok(dataset) => Ok(dataset),
            Err(e) if e.is_not_found() => {
                let dataset = Dataset::empty(project_id);
                self.store.put(&dataset)?;
                tracing::debug!(project_id, "データセットを作成しました");
                Ok(dataset)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 読み込み→変更→書き込みをプロジェクト単位で直列化する
    fn update<F>(&self, project_id: ProjectId, apply: F) -> Result<Dataset>
    where
        F: FnOnce(&mut Dataset) -> Result<()>,
    {
        self.with_project_lock(project_id, || {
            let mut dataset = self.load_or_create(project_id)?;
            apply(&mut dataset)?;
            self.store.put(&dataset)?;
            Ok(dataset)
        })
    }

    /// 画像をラベルに追加する（ラベルがなければ末尾に作成）
    pub fn append_image(&self, project_id: ProjectId, label: &str, image: Image) -> Result<Dataset> {
        validate_label_name(label)?;
        let (width, height) = codec::dimensions(&image.src)?;

        let dataset = self.update(project_id, |dataset| {
            match dataset.labels.iter_mut().find(|l| l.name == label) {
                Some(existing) => existing.images.push(image),
                None => dataset.labels.push(Label {
                    name: label.to_string(),
                    images: vec![image],
                }),
            }
            Ok(())
        })?;

        tracing::debug!(
            project_id,
            label,
            width,
            height,
            total = dataset.total_images(),
            "画像を追加しました"
        );
        Ok(dataset)
    }

    /// ラベル名を変更する
    pub fn rename_label(&self, project_id: ProjectId, from: &str, to: &str) -> Result<Dataset> {
        validate_label_name(to)?;
        if from == UNLABELED || to == UNLABELED {
            return Err(EngineError::ReservedLabel(UNLABELED.to_string()));
        }

        self.update(project_id, |dataset| {
            if from != to && dataset.label(to).is_some() {
                return Err(EngineError::LabelExists(to.to_string()));
            }
            let label = dataset
                .labels
                .iter_mut()
                .find(|l| l.name == from)
                .ok_or_else(|| EngineError::LabelNotFound(from.to_string()))?;
            label.name = to.to_string();
            Ok(())
        })
    }

    /// ラベルを画像ごと削除する
    pub fn delete_label(&self, project_id: ProjectId, name: &str) -> Result<Dataset> {
        if name == UNLABELED {
            return Err(EngineError::ReservedLabel(UNLABELED.to_string()));
        }

        self.update(project_id, |dataset| {
            let before = dataset.labels.len();
            dataset.labels.retain(|l| l.name != name);
            if dataset.labels.len() == before {
                return Err(EngineError::LabelNotFound(name.to_string()));
            }
            Ok(())
        })
    }
}
