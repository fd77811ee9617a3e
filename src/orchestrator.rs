//! 学習オーケストレータ
//!
//! プロジェクトごとのセッションで現在のモデルと学習状態を管理します。
//!
//! - 画像追加のたびに再学習を予約し、待機時間内の追加はまとめて1回の学習にする
//! - 1プロジェクトにつき同時に走る学習は1つだけ（後続は完了を待つ）
//! - 学習・復元・推論は blocking プールで実行する
//! - 失敗時は `Failed` になり、直前のモデルはそのまま使い続ける

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::dataset::{check_trainable, is_trainable, DatasetManager};
use crate::error::{EngineError, Result};
use crate::ml::{BurnClassifierFactory, ClassifierFactory, CpuBackend, ImageClassifier};
use crate::model::config::{EngineConfig, OrchestratorSettings};
use crate::model::ModelRecord;
use crate::store::{FileStore, MemoryStore, ObjectStore, RecordStoreExt};
use crate::summary::{argmax_label, LabelScore};
use crate::types::{Dataset, Image, ImagePrediction, ModelRef, ProjectId, TrainingStatus};

/// 学習結果
pub struct TrainOutcome {
    pub status: TrainingStatus,
    pub model: Arc<dyn ImageClassifier>,
    pub model_info: ModelRecord,
}

#[derive(Default)]
struct SessionState {
    status: TrainingStatus,
    current: Option<Arc<dyn ImageClassifier>>,
    model_info: Option<ModelRecord>,
    last_error: Option<String>,
}

#[derive(Default)]
struct ProjectSession {
    /// 学習・復元の直列化
    train_lock: tokio::sync::Mutex<()>,
    state: RwLock<SessionState>,
}

impl ProjectSession {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: TrainingStatus) {
        self.write().status = status;
    }

    fn fail(&self, error: &EngineError) {
        let mut state = self.write();
        state.status = TrainingStatus::Failed;
        state.last_error = Some(error.to_string());
    }
}

struct PendingRetrain {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Shared {
    datasets: DatasetManager,
    factory: Arc<dyn ClassifierFactory>,
    debounce: Duration,
    sessions: Mutex<HashMap<ProjectId, Arc<ProjectSession>>>,
    pending: Mutex<HashMap<ProjectId, PendingRetrain>>,
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join_error(e: tokio::task::JoinError) -> EngineError {
    EngineError::TrainingFailure(format!("バックグラウンドタスクが異常終了しました: {}", e))
}

/// 学習オーケストレータ
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        factory: Arc<dyn ClassifierFactory>,
        settings: &OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                datasets: DatasetManager::new(store),
                factory,
                debounce: settings.debounce(),
                sessions: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// 設定からストアと CPU バックエンドの分類器を構築する
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn ObjectStore> = match &config.store_dir {
            Some(dir) => {
                tracing::info!("ファイルストアを使用します: {}", dir);
                Arc::new(FileStore::open(dir)?)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let factory = Arc::new(BurnClassifierFactory::<CpuBackend>::from_config(config));
        Ok(Self::new(store, factory, &config.orchestrator))
    }

    pub fn datasets(&self) -> &DatasetManager {
        &self.inner.datasets
    }

    fn store(&self) -> &Arc<dyn ObjectStore> {
        self.inner.datasets.store()
    }

    fn session(&self, project_id: ProjectId) -> Arc<ProjectSession> {
        let mut sessions = lock(&self.inner.sessions);
        Arc::clone(sessions.entry(project_id).or_default())
    }

    /// 画像を追加し、再学習を予約する
    pub async fn append_image(&self, project_id: ProjectId, label: &str, image: Image) -> Result<Dataset> {
        let inner = Arc::clone(&self.inner);
        let label = label.to_string();
        let dataset = tokio::task::spawn_blocking(move || {
            inner.datasets.append_image(project_id, &label, image)
        })
        .await
        .map_err(join_error)??;
        self.schedule_retrain(project_id);
        Ok(dataset)
    }

    pub fn is_trainable(&self, project_id: ProjectId) -> Result<bool> {
        Ok(is_trainable(&self.inner.datasets.ensure_dataset(project_id)?))
    }

    /// データセットを blocking プールで読み込む（なければ作成）
    async fn load_dataset(&self, project_id: ProjectId) -> Result<Dataset> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.datasets.ensure_dataset(project_id))
            .await
            .map_err(join_error)?
    }

    /// 待機時間後の再学習を予約する（予約済みのものは取り消す）
    fn schedule_retrain(&self, project_id: ProjectId) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let debounce = self.inner.debounce;

        // 予約の登録が終わるまでタスク側は予約を確定できない
        let mut pending = lock(&self.inner.pending);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            this.run_pending(project_id, generation).await;
        });

        if let Some(previous) = pending.insert(project_id, PendingRetrain { generation, handle }) {
            previous.handle.abort();
            tracing::debug!(project_id, "予約済みの再学習を取り消しました");
        }
    }

    /// 未確定の予約を取り消す
    fn cancel_pending(&self, project_id: ProjectId) {
        if let Some(previous) = lock(&self.inner.pending).remove(&project_id) {
            previous.handle.abort();
            tracing::debug!(project_id, "明示的な学習のため予約済みの再学習を取り消しました");
        }
    }

    /// 予約を確定し、学習可能なら学習する
    async fn run_pending(&self, project_id: ProjectId, generation: u64) {
        let claimed = {
            let mut pending = lock(&self.inner.pending);
            match pending.get(&project_id) {
                Some(entry) if entry.generation == generation => {
                    pending.remove(&project_id);
                    true
                }
                _ => false,
            }
        };
        if !claimed {
            return;
        }

        let dataset = match self.load_dataset(project_id).await {
            Ok(dataset) => dataset,
            Err(e) => {
                tracing::warn!(project_id, "データセットを読み込めません: {}", e);
                return;
            }
        };
        if let Err(e) = check_trainable(&dataset) {
            tracing::info!(project_id, "再学習をスキップします: {}", e);
            return;
        }

        if let Err(e) = self.train_now(project_id).await {
            tracing::warn!(project_id, "自動再学習に失敗しました: {}", e);
        }
    }

    pub fn has_pending_retrain(&self, project_id: ProjectId) -> bool {
        lock(&self.inner.pending).contains_key(&project_id)
    }

    /// 学習して保存し、成功したら現在のモデルを差し替える
    ///
    /// 未確定の自動再学習は取り消されます。データセットはロック取得後に読むため、
    /// 取り消した予約の画像もこの学習に含まれます。
    pub async fn train_model(&self, project_id: ProjectId) -> Result<TrainOutcome> {
        self.cancel_pending(project_id);
        self.train_now(project_id).await
    }

    async fn train_now(&self, project_id: ProjectId) -> Result<TrainOutcome> {
        let session = self.session(project_id);
        let _guard = session.train_lock.lock().await;
        session.set_status(TrainingStatus::Loading);
        tracing::info!(project_id, "学習を開始します");

        match self.run_training(project_id).await {
            Ok((model, record, superseded)) => {
                let (previous, previous_info) = {
                    let mut state = session.write();
                    state.status = TrainingStatus::Idle;
                    state.last_error = None;
                    (
                        state.current.replace(Arc::clone(&model)),
                        state.model_info.replace(record.clone()),
                    )
                };
                let mut stale: Vec<ModelRef> = superseded.into_iter().collect();
                if let Some(info) = previous_info {
                    if !stale.contains(&info.model_ref) {
                        stale.push(info.model_ref);
                    }
                }
                self.release_previous(previous, stale, &record);
                tracing::info!(
                    project_id,
                    model_ref = %record.model_ref,
                    epochs = record.history.len(),
                    "学習が完了しました"
                );

                Ok(TrainOutcome {
                    status: TrainingStatus::Idle,
                    model,
                    model_info: record,
                })
            }
            Err(e) => {
                tracing::error!(project_id, "学習に失敗しました: {}", e);
                session.fail(&e);
                Err(e)
            }
        }
    }

    /// 学習して保存する
    ///
    /// 戻り値の3番目は置き換えられた保存済みレコードの重み。
    async fn run_training(
        &self,
        project_id: ProjectId,
    ) -> Result<(Arc<dyn ImageClassifier>, ModelRecord, Option<ModelRef>)> {
        let dataset = self.load_dataset(project_id).await?;
        check_trainable(&dataset)?;

        let factory = Arc::clone(&self.inner.factory);
        let store = Arc::clone(self.store());
        let (classifier, record, superseded) = tokio::task::spawn_blocking(move || -> Result<_> {
            let mut classifier = factory.create();
            let (history, prediction) = classifier.train(&dataset)?;
            let model_ref = classifier.save(store.as_ref(), project_id)?;

            // 再起動後はセッションに前のモデルがないため、保存済みレコードから辿る
            let superseded = match store.find::<ModelRecord>(project_id) {
                Ok(previous) => Some(previous.model_ref),
                Err(e) if e.is_not_found() => None,
                Err(e) => {
                    tracing::warn!(project_id, "既存のモデル情報を読み込めません: {}", e);
                    None
                }
            };

            let record = ModelRecord {
                project_id,
                label_names: classifier.label_names().to_vec(),
                history,
                model_ref,
                prediction,
                kind: classifier.kind(),
                trained_at: Utc::now().to_rfc3339(),
            };
            if let Err(e) = store.put(&record) {
                if let Err(cleanup) = store.delete_blob(record.model_ref.as_str()) {
                    tracing::warn!("保存に失敗した重みを削除できません: {}", cleanup);
                }
                return Err(e.into());
            }
            Ok((classifier, record, superseded))
        })
        .await
        .map_err(join_error)??;

        Ok((Arc::from(classifier), record, superseded))
    }

    /// 差し替え前のモデルを解放し、使われなくなった重みを削除する
    fn release_previous(
        &self,
        previous: Option<Arc<dyn ImageClassifier>>,
        stale: Vec<ModelRef>,
        current: &ModelRecord,
    ) {
        if let Some(mut model) = previous {
            // 推論中の参照が残っている場合は最後の参照が落ちた時点で解放される
            if let Some(model) = Arc::get_mut(&mut model) {
                model.dispose();
            }
        }

        for model_ref in stale {
            if model_ref == current.model_ref {
                continue;
            }
            if let Err(e) = self.store().delete_blob(model_ref.as_str()) {
                tracing::warn!("古い重みを削除できません ({}): {}", model_ref, e);
            }
        }
    }

    /// 保存済みのモデルを復元する
    pub async fn load_model(&self, project_id: ProjectId) -> Result<ModelRecord> {
        let session = self.session(project_id);
        let _guard = session.train_lock.lock().await;
        session.set_status(TrainingStatus::Loading);

        let factory = Arc::clone(&self.inner.factory);
        let store = Arc::clone(self.store());
        let loaded = tokio::task::spawn_blocking(move || -> Result<_> {
            let record: ModelRecord = store.find(project_id)?;
            let classifier = factory.load(store.as_ref(), &record)?;
            Ok((classifier, record))
        })
        .await
        .map_err(join_error)
        .and_then(|result| result);

        match loaded {
            Ok((classifier, record)) => {
                let previous = {
                    let mut state = session.write();
                    state.status = TrainingStatus::Idle;
                    state.last_error = None;
                    state.model_info = Some(record.clone());
                    state.current.replace(Arc::from(classifier))
                };
                self.release_previous(previous, Vec::new(), &record);
                tracing::info!(project_id, model_ref = %record.model_ref, "モデルを復元しました");
                Ok(record)
            }
            Err(e) => {
                tracing::error!(project_id, "モデルの復元に失敗しました: {}", e);
                session.fail(&e);
                Err(e)
            }
        }
    }

    /// 現在のモデルでクラス確率を求める
    pub async fn predict(&self, project_id: ProjectId, image: Vec<u8>) -> Result<ImagePrediction> {
        let model = self.current_model(project_id).ok_or(EngineError::ModelNotReady)?;
        tokio::task::spawn_blocking(move || model.predict(&image))
            .await
            .map_err(join_error)?
    }

    /// 最も確率の高いラベルを求める
    pub async fn predict_label(&self, project_id: ProjectId, image: Vec<u8>) -> Result<LabelScore> {
        let model = self.current_model(project_id).ok_or(EngineError::ModelNotReady)?;
        let labels = model.label_names().to_vec();
        let scores = tokio::task::spawn_blocking(move || model.predict(&image))
            .await
            .map_err(join_error)??;
        argmax_label(&scores, &labels)
    }

    pub fn dataset(&self, project_id: ProjectId) -> Result<Dataset> {
        self.inner.datasets.ensure_dataset(project_id)
    }

    pub fn current_model(&self, project_id: ProjectId) -> Option<Arc<dyn ImageClassifier>> {
        self.session(project_id).read().current.clone()
    }

    pub fn model_info(&self, project_id: ProjectId) -> Option<ModelRecord> {
        self.session(project_id).read().model_info.clone()
    }

    pub fn status(&self, project_id: ProjectId) -> TrainingStatus {
        self.session(project_id).read().status
    }

    pub fn last_error(&self, project_id: ProjectId) -> Option<String> {
        self.session(project_id).read().last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::trainable_labels;
    use crate::ml::codec::{self, test_images::solid_png};
    use crate::model::config::ModelKind;
    use crate::store::RecordKind;
    use crate::types::{LabelPrediction, ModelRef, Prediction, TrainingLog};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// 学習回数と破棄回数を数える分類器
    struct FakeClassifier {
        labels: Vec<String>,
        fail: bool,
        disposed: Arc<AtomicUsize>,
        saves: Arc<AtomicUsize>,
    }

    impl ImageClassifier for FakeClassifier {
        fn kind(&self) -> ModelKind {
            ModelKind::FineTuned
        }

        fn is_trained(&self) -> bool {
            !self.labels.is_empty()
        }

        fn label_names(&self) -> &[String] {
            &self.labels
        }

        fn train(&mut self, dataset: &Dataset) -> Result<(Vec<TrainingLog>, Prediction)> {
            check_trainable(dataset)?;
            if self.fail {
                return Err(EngineError::TrainingFailure("boom".to_string()));
            }
            let labels = trainable_labels(dataset);
            self.labels = labels.iter().map(|l| l.name.clone()).collect();
            let n = labels.len();
            let prediction = Prediction {
                project_id: dataset.project_id,
                labels: labels
                    .iter()
                    .enumerate()
                    .map(|(i, label)| LabelPrediction {
                        label: label.name.clone(),
                        images: label
                            .images
                            .iter()
                            .map(|_| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
                            .collect(),
                    })
                    .collect(),
            };
            let history = vec![TrainingLog { epoch: 0, loss: 0.1, accuracy: 1.0 }];
            Ok((history, prediction))
        }

        fn predict(&self, image: &[u8]) -> Result<ImagePrediction> {
            if !self.is_trained() {
                return Err(EngineError::ModelNotReady);
            }
            codec::dimensions(image)?;
            let mut scores = vec![0.0; self.labels.len()];
            scores[0] = 1.0;
            Ok(scores)
        }

        fn save(&self, store: &dyn ObjectStore, project_id: ProjectId) -> Result<ModelRef> {
            let n = self.saves.fetch_add(1, Ordering::SeqCst);
            let key = format!("fake-{}-{}", project_id, n);
            store.put_blob(&key, vec![n as u8])?;
            Ok(ModelRef(key))
        }

        fn dispose(&mut self) {
            if !self.labels.is_empty() {
                self.labels.clear();
                self.disposed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        runs: AtomicUsize,
        fail: AtomicBool,
        disposed: Arc<AtomicUsize>,
        saves: Arc<AtomicUsize>,
    }

    impl FakeFactory {
        fn classifier(&self) -> FakeClassifier {
            FakeClassifier {
                labels: Vec::new(),
                fail: self.fail.load(Ordering::SeqCst),
                disposed: Arc::clone(&self.disposed),
                saves: Arc::clone(&self.saves),
            }
        }
    }

    impl ClassifierFactory for FakeFactory {
        fn create(&self) -> Box<dyn ImageClassifier> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Box::new(self.classifier())
        }

        fn load(&self, store: &dyn ObjectStore, record: &ModelRecord) -> Result<Box<dyn ImageClassifier>> {
            store
                .get_blob(record.model_ref.as_str())?
                .ok_or_else(|| crate::error::StoreError::BlobNotFound(record.model_ref.to_string()))?;
            let mut classifier = self.classifier();
            classifier.labels = record.label_names.clone();
            Ok(Box::new(classifier))
        }
    }

    fn setup(debounce_ms: u64) -> (Orchestrator, Arc<FakeFactory>, Arc<dyn ObjectStore>) {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let factory = Arc::new(FakeFactory::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&store),
            factory.clone(),
            &OrchestratorSettings { debounce_ms },
        );
        (orchestrator, factory, store)
    }

    fn png() -> Image {
        Image::new(solid_png(4, 4, [1, 2, 3]))
    }

    fn fill(orchestrator: &Orchestrator, project_id: ProjectId, counts: &[(&str, usize)]) {
        for (label, count) in counts {
            for _ in 0..*count {
                orchestrator.datasets().append_image(project_id, label, png()).unwrap();
            }
        }
    }

    async fn wait_for_pending(orchestrator: &Orchestrator, project_id: ProjectId) {
        for _ in 0..200 {
            if !orchestrator.has_pending_retrain(project_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_fresh_dataset() {
        let (orchestrator, _, _) = setup(3000);
        let dataset = orchestrator.dataset(1).unwrap();
        assert_eq!(dataset.labels.len(), 1);
        assert!(dataset.labels[0].images.is_empty());
        assert!(!orchestrator.is_trainable(1).unwrap());
        assert_eq!(orchestrator.status(1), TrainingStatus::Idle);
    }

    #[tokio::test]
    async fn test_predict_before_training() {
        let (orchestrator, _, _) = setup(3000);
        let image = solid_png(4, 4, [0, 0, 0]);
        assert!(matches!(
            orchestrator.predict(1, image.clone()).await,
            Err(EngineError::ModelNotReady)
        ));
        assert!(matches!(
            orchestrator.predict_label(1, image).await,
            Err(EngineError::ModelNotReady)
        ));
    }

    #[tokio::test]
    async fn test_not_trainable_writes_no_model() {
        let (orchestrator, factory, store) = setup(3000);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 4)]);

        let err = orchestrator.train_model(1).await.err().unwrap();
        assert!(matches!(err, EngineError::NotTrainable { .. }));
        assert_eq!(orchestrator.status(1), TrainingStatus::Failed);
        assert!(orchestrator.last_error(1).is_some());
        assert!(store.keys(RecordKind::Model).unwrap().is_empty());
        assert_eq!(factory.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_train_and_predict() {
        let (orchestrator, _, store) = setup(3000);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 5)]);

        let outcome = orchestrator.train_model(1).await.unwrap();
        assert_eq!(outcome.status, TrainingStatus::Idle);
        assert_eq!(outcome.model_info.label_names, vec!["cat", "dog"]);
        assert_eq!(outcome.model_info.prediction.labels.len(), 2);
        assert!(outcome.model.is_trained());

        let stored: ModelRecord = store.find(1).unwrap();
        assert_eq!(stored, outcome.model_info);
        assert_eq!(orchestrator.model_info(1), Some(stored));
        assert_eq!(orchestrator.status(1), TrainingStatus::Idle);

        let scores = orchestrator.predict(1, solid_png(4, 4, [9, 9, 9])).await.unwrap();
        assert_eq!(scores.len(), 2);
        let best = orchestrator.predict_label(1, solid_png(4, 4, [9, 9, 9])).await.unwrap();
        assert_eq!(best.label, "cat");

        assert!(matches!(
            orchestrator.predict(1, b"junk".to_vec()).await,
            Err(EngineError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_model() {
        let (orchestrator, factory, _) = setup(3000);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 5)]);
        let first = orchestrator.train_model(1).await.unwrap();

        factory.fail.store(true, Ordering::SeqCst);
        let err = orchestrator.train_model(1).await.err().unwrap();
        assert!(matches!(err, EngineError::TrainingFailure(_)));
        assert_eq!(orchestrator.status(1), TrainingStatus::Failed);
        assert_eq!(orchestrator.model_info(1), Some(first.model_info));
        assert!(orchestrator.predict(1, solid_png(4, 4, [0, 0, 0])).await.is_ok());

        // 再試行で復帰する
        factory.fail.store(false, Ordering::SeqCst);
        orchestrator.train_model(1).await.unwrap();
        assert_eq!(orchestrator.status(1), TrainingStatus::Idle);
        assert!(orchestrator.last_error(1).is_none());
    }

    #[tokio::test]
    async fn test_swap_releases_previous_weights() {
        let (orchestrator, factory, store) = setup(3000);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 5)]);

        let first = orchestrator.train_model(1).await.unwrap();
        let first_ref = first.model_info.model_ref.clone();
        drop(first);
        orchestrator.train_model(1).await.unwrap();

        assert_eq!(factory.disposed.load(Ordering::SeqCst), 1);
        assert!(store.get_blob(first_ref.as_str()).unwrap().is_none());
        let current = orchestrator.model_info(1).unwrap();
        assert!(store.get_blob(current.model_ref.as_str()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_debounce_collapses_bursts() {
        let (orchestrator, factory, _) = setup(100);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 4)]);

        orchestrator.append_image(1, "dog", png()).await.unwrap();
        orchestrator.append_image(1, "dog", png()).await.unwrap();
        assert!(orchestrator.has_pending_retrain(1));

        wait_for_pending(&orchestrator, 1).await;
        for _ in 0..200 {
            if orchestrator.model_info(1).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(factory.runs.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.status(1), TrainingStatus::Idle);
        assert_eq!(orchestrator.model_info(1).unwrap().label_names, vec!["cat", "dog"]);
    }

    #[tokio::test]
    async fn test_debounce_skips_untrainable_dataset() {
        let (orchestrator, factory, _) = setup(20);
        orchestrator.append_image(1, "cat", png()).await.unwrap();

        wait_for_pending(&orchestrator, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!orchestrator.has_pending_retrain(1));
        assert_eq!(factory.runs.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.status(1), TrainingStatus::Idle);
    }

    #[tokio::test]
    async fn test_load_model_after_restart() {
        let (orchestrator, factory, store) = setup(3000);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 5)]);
        let trained = orchestrator.train_model(1).await.unwrap();

        let restarted = Orchestrator::new(store, factory, &OrchestratorSettings::default());
        assert!(restarted.current_model(1).is_none());
        let record = restarted.load_model(1).await.unwrap();
        assert_eq!(record, trained.model_info);
        assert_eq!(restarted.current_model(1).unwrap().label_names(), &["cat", "dog"]);
        assert!(restarted.predict(1, solid_png(4, 4, [0, 0, 0])).await.is_ok());

        let err = restarted.load_model(2).await.err().unwrap();
        assert!(matches!(err, EngineError::Persistence(ref e) if e.is_not_found()));
        assert_eq!(restarted.status(2), TrainingStatus::Failed);
    }

    #[tokio::test]
    async fn test_projects_are_independent() {
        let (orchestrator, _, _) = setup(3000);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 5)]);
        fill(&orchestrator, 2, &[("red", 1)]);

        orchestrator.train_model(1).await.unwrap();
        assert!(orchestrator.train_model(2).await.is_err());

        assert_eq!(orchestrator.status(1), TrainingStatus::Idle);
        assert_eq!(orchestrator.status(2), TrainingStatus::Failed);
        assert!(orchestrator.current_model(2).is_none());
    }

    #[tokio::test]
    async fn test_retrain_after_restart_deletes_old_weights() {
        let (orchestrator, factory, store) = setup(3000);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 5)]);
        let first_ref = orchestrator.train_model(1).await.unwrap().model_info.model_ref;

        // 復元せずに再学習しても、保存済みレコードの重みは削除される
        let restarted = Orchestrator::new(Arc::clone(&store), factory, &OrchestratorSettings::default());
        let second = restarted.train_model(1).await.unwrap();

        assert_ne!(second.model_info.model_ref, first_ref);
        assert!(store.get_blob(first_ref.as_str()).unwrap().is_none());
        assert!(store.get_blob(second.model_info.model_ref.as_str()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_not_trainable_keeps_stored_model() {
        let (orchestrator, factory, store) = setup(3000);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 5)]);
        let trained = orchestrator.train_model(1).await.unwrap();
        let stored = store.get_raw(RecordKind::Model, 1).unwrap().unwrap();

        orchestrator.datasets().delete_label(1, "dog").unwrap();
        let err = orchestrator.train_model(1).await.err().unwrap();
        assert!(matches!(err, EngineError::NotTrainable { .. }));

        assert_eq!(store.get_raw(RecordKind::Model, 1).unwrap().unwrap(), stored);
        assert!(store.get_blob(trained.model_info.model_ref.as_str()).unwrap().is_some());
        assert_eq!(orchestrator.model_info(1), Some(trained.model_info));
        assert_eq!(factory.runs.load(Ordering::SeqCst), 1);
        assert!(orchestrator.predict(1, solid_png(4, 4, [0, 0, 0])).await.is_ok());
    }

    #[tokio::test]
    async fn test_explicit_train_cancels_pending_retrain() {
        let (orchestrator, factory, _) = setup(100);
        fill(&orchestrator, 1, &[("cat", 5), ("dog", 4)]);

        orchestrator.append_image(1, "dog", png()).await.unwrap();
        assert!(orchestrator.has_pending_retrain(1));
        let outcome = orchestrator.train_model(1).await.unwrap();
        assert!(!orchestrator.has_pending_retrain(1));
        assert_eq!(outcome.model_info.prediction.labels[1].images.len(), 5);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(factory.runs.load(Ordering::SeqCst), 1);
    }

    /// 書き込みを行ったスレッドを記録するストア
    struct ThreadRecordingStore {
        inner: MemoryStore,
        writers: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ObjectStore for ThreadRecordingStore {
        fn get_raw(&self, kind: RecordKind, project_id: ProjectId) -> Result<Option<Vec<u8>>, crate::error::StoreError> {
            self.inner.get_raw(kind, project_id)
        }

        fn put_raw(&self, kind: RecordKind, project_id: ProjectId, bytes: Vec<u8>) -> Result<(), crate::error::StoreError> {
            lock(&self.writers).push(std::thread::current().id());
            self.inner.put_raw(kind, project_id, bytes)
        }

        fn keys(&self, kind: RecordKind) -> Result<Vec<ProjectId>, crate::error::StoreError> {
            self.inner.keys(kind)
        }

        fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, crate::error::StoreError> {
            self.inner.get_blob(key)
        }

        fn put_blob(&self, key: &str, bytes: Vec<u8>) -> Result<(), crate::error::StoreError> {
            self.inner.put_blob(key, bytes)
        }

        fn delete_blob(&self, key: &str) -> Result<(), crate::error::StoreError> {
            self.inner.delete_blob(key)
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_append_image_writes_off_the_runtime_thread() {
        let store = Arc::new(ThreadRecordingStore {
            inner: MemoryStore::new(),
            writers: Mutex::new(Vec::new()),
        });
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(FakeFactory::default()),
            &OrchestratorSettings { debounce_ms: 3000 },
        );

        let dataset = orchestrator.append_image(1, "cat", png()).await.unwrap();
        assert_eq!(dataset.label("cat").unwrap().images.len(), 1);
        assert!(orchestrator.has_pending_retrain(1));

        let runtime_thread = std::thread::current().id();
        let writers = lock(&store.writers).clone();
        assert!(!writers.is_empty());
        assert!(writers.iter().all(|id| *id != runtime_thread));
    }
}
