//! 画像分類器
//!
//! [`ImageClassifier`] は学習・推論・保存・破棄の4操作をまとめた能力トレイトです。
//! 実装は Burn による [`BurnClassifier`] で、モデルの種類は [`ModelKind`] で切り替えます。

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Mutex;

use burn::{
    module::{AutodiffModule, Module},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::AutodiffBackend, Tensor},
};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use chrono::Utc;

use crate::dataset::{check_trainable, trainable_labels};
use crate::error::{EngineError, Result, StoreError};
use crate::ml::codec::{self, NUM_CHANNELS};
use crate::ml::network::{ClassifierNet, FeatureExtractor, NetworkConfig};
use crate::ml::training::{evaluate, fit, partition_scores, EncodedDataset};
use crate::model::config::{EngineConfig, ModelKind, ModelSettings, TrainingSettings};
use crate::model::{log_manifest_info, pack_bundle, unpack_bundle, ModelRecord, WeightsManifest};
use crate::store::ObjectStore;
use crate::types::{Dataset, ImagePrediction, ModelRef, Prediction, ProjectId, TrainingLog};

/// CPU 学習用のバックエンド
pub type CpuBackend = Autodiff<NdArray>;

/// 画像分類器の共通インターフェース
pub trait ImageClassifier: Send + Sync {
    fn kind(&self) -> ModelKind;

    fn is_trained(&self) -> bool;

    /// 学習時のラベル順（未学習なら空）
    fn label_names(&self) -> &[String];

    /// データセットで学習し、エポックごとのログと学習データの自己評価を返す
    fn train(&mut self, dataset: &Dataset) -> Result<(Vec<TrainingLog>, Prediction)>;

    /// 1枚の画像のクラス確率を返す
    fn predict(&self, image: &[u8]) -> Result<ImagePrediction>;

    /// 重みをストアに保存し、参照キーを返す
    fn save(&self, store: &dyn ObjectStore, project_id: ProjectId) -> Result<ModelRef>;

    /// 重みを解放する（何度呼んでもよい）
    fn dispose(&mut self);
}

struct TrainedState<B: burn::tensor::backend::Backend> {
    net: Mutex<ClassifierNet<B>>,
    network: NetworkConfig,
    label_names: Vec<String>,
}

/// Burn による分類器
pub struct BurnClassifier<B: AutodiffBackend> {
    model: ModelSettings,
    training: TrainingSettings,
    device: B::Device,
    state: Option<TrainedState<B::InnerBackend>>,
}

impl<B: AutodiffBackend> BurnClassifier<B> {
    pub fn new(model: ModelSettings, training: TrainingSettings, device: B::Device) -> Self {
        Self {
            model,
            training,
            device,
            state: None,
        }
    }

    /// 保存済みの重みから学習済み状態を復元する
    pub fn load(
        model: ModelSettings,
        training: TrainingSettings,
        device: B::Device,
        store: &dyn ObjectStore,
        record: &ModelRecord,
    ) -> Result<Self> {
        let bundle = store
            .get_blob(record.model_ref.as_str())?
            .ok_or_else(|| StoreError::BlobNotFound(record.model_ref.to_string()))?;
        let (manifest, binary) =
            unpack_bundle(&bundle).map_err(|e| StoreError::Bundle(format!("{:#}", e)))?;
        log_manifest_info(&manifest);

        if manifest.project_id != record.project_id || manifest.label_names != record.label_names {
            return Err(StoreError::Bundle(format!(
                "bundle '{}' does not match model record of project {}",
                record.model_ref, record.project_id
            ))
            .into());
        }

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let weights: <ClassifierNet<B::InnerBackend> as Module<B::InnerBackend>>::Record =
            <BinBytesRecorder<FullPrecisionSettings> as Recorder<B::InnerBackend>>::load(
                &recorder, binary, &device,
            )
            .map_err(|e| StoreError::Bundle(format!("モデル重みの読み込みエラー: {:?}", e)))?;
        let net = manifest
            .network
            .init::<B::InnerBackend>(&device)
            .load_record(weights);

        Ok(Self {
            model,
            training,
            device,
            state: Some(TrainedState {
                net: Mutex::new(net),
                network: manifest.network,
                label_names: manifest.label_names,
            }),
        })
    }

    fn build_extractor(&self) -> Result<FeatureExtractor<B>> {
        match (&self.model.extractor_weights, self.model.kind) {
            (_, ModelKind::Cnn) => Ok(FeatureExtractor::init(&self.device)),
            (Some(path), _) => FeatureExtractor::load_pretrained(Path::new(path), &self.device)
                .map_err(|e| {
                    EngineError::TrainingFailure(format!(
                        "特徴抽出器の重みを読み込めません ({}): {:?}",
                        path, e
                    ))
                }),
            (None, kind) => Err(EngineError::TrainingFailure(format!(
                "{} には学習済み特徴抽出器の重み (extractor_weights) が必要です",
                kind
            ))),
        }
    }

    fn state(&self) -> Result<&TrainedState<B::InnerBackend>> {
        self.state.as_ref().ok_or(EngineError::ModelNotReady)
    }
}

/// プロジェクトごとに一意な重みキー
fn weights_key(project_id: ProjectId) -> String {
    format!("model-{}-{}", project_id, Utc::now().format("%Y%m%d%H%M%S%9f"))
}

fn poisoned() -> EngineError {
    EngineError::TrainingFailure("model lock poisoned".to_string())
}

impl<B: AutodiffBackend> ImageClassifier for BurnClassifier<B> {
    fn kind(&self) -> ModelKind {
        self.state
            .as_ref()
            .map_or(self.model.kind, |state| state.network.kind)
    }

    fn is_trained(&self) -> bool {
        self.state.is_some()
    }

    fn label_names(&self) -> &[String] {
        self.state
            .as_ref()
            .map(|state| state.label_names.as_slice())
            .unwrap_or_default()
    }

    fn train(&mut self, dataset: &Dataset) -> Result<(Vec<TrainingLog>, Prediction)> {
        check_trainable(dataset)?;
        let labels = trainable_labels(dataset);
        let data = EncodedDataset::from_labels(&labels, self.model.image_size)?;

        let network = NetworkConfig::from_settings(&self.model, data.num_classes());
        let model = network
            .assemble(self.build_extractor()?, &self.device)
            .freeze(&network);
        tracing::info!(
            "モデル設定: {}, {} クラス, 入力サイズ: {}x{}, 学習対象ブロック: [{}]",
            network.kind,
            network.num_classes,
            network.image_size,
            network.image_size,
            network.trainable_blocks().join(", ")
        );

        let (model, history) = fit(model, &data, &self.training, &self.device)?;

        // 学習データ全体を推論して自己評価
        let trained = model.valid();
        let scores = evaluate(&trained, &data, self.training.batch_size, &self.device)?;
        let prediction = partition_scores(dataset.project_id, data.class_names(), data.counts(), scores);

        self.dispose();
        self.state = Some(TrainedState {
            net: Mutex::new(trained),
            network,
            label_names: data.class_names().to_vec(),
        });

        Ok((history, prediction))
    }

    fn predict(&self, image: &[u8]) -> Result<ImagePrediction> {
        let state = self.state()?;
        let size = state.network.image_size;
        let tensor = codec::encode(image, size)?;

        // Tensorに変換 [1, 3, size, size]
        let input = Tensor::<B::InnerBackend, 1>::from_floats(tensor.values(), &self.device)
            .reshape([1, NUM_CHANNELS, size, size]);

        let net = state.net.lock().map_err(|_| poisoned())?;
        net.predict(input)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| EngineError::TrainingFailure(format!("推論結果の取得エラー: {:?}", e)))
    }

    fn save(&self, store: &dyn ObjectStore, project_id: ProjectId) -> Result<ModelRef> {
        let state = self.state()?;
        let net = state.net.lock().map_err(|_| poisoned())?.clone();

        // f32精度のまま保存
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let binary = <BinBytesRecorder<FullPrecisionSettings> as Recorder<B::InnerBackend>>::record(
            &recorder,
            net.into_record(),
            (),
        )
        .map_err(|e| StoreError::Bundle(format!("モデル重みの書き出しエラー: {:?}", e)))?;

        let manifest = WeightsManifest::new(project_id, state.network.clone(), state.label_names.clone());
        let bundle =
            pack_bundle(&manifest, &binary).map_err(|e| StoreError::Bundle(format!("{:#}", e)))?;

        let key = weights_key(project_id);
        tracing::info!(
            project_id,
            key = %key,
            bytes = bundle.len(),
            "モデルを保存しました"
        );
        store.put_blob(&key, bundle)?;
        Ok(ModelRef(key))
    }

    fn dispose(&mut self) {
        if self.state.take().is_some() {
            tracing::debug!("モデルの重みを解放しました");
        }
    }
}

/// 分類器の生成と復元
pub trait ClassifierFactory: Send + Sync {
    /// 未学習の分類器を作る
    fn create(&self) -> Box<dyn ImageClassifier>;

    /// 保存済みモデルを復元する
    fn load(&self, store: &dyn ObjectStore, record: &ModelRecord) -> Result<Box<dyn ImageClassifier>>;
}

/// [`BurnClassifier`] を作るファクトリ
pub struct BurnClassifierFactory<B: AutodiffBackend = CpuBackend> {
    model: ModelSettings,
    training: TrainingSettings,
    _backend: PhantomData<fn() -> B>,
}

impl<B: AutodiffBackend> BurnClassifierFactory<B> {
    pub fn new(model: ModelSettings, training: TrainingSettings) -> Self {
        Self {
            model,
            training,
            _backend: PhantomData,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.model.clone(), config.training.clone())
    }
}

impl<B: AutodiffBackend> ClassifierFactory for BurnClassifierFactory<B> {
    fn create(&self) -> Box<dyn ImageClassifier> {
        Box::new(BurnClassifier::<B>::new(
            self.model.clone(),
            self.training.clone(),
            Default::default(),
        ))
    }

    fn load(&self, store: &dyn ObjectStore, record: &ModelRecord) -> Result<Box<dyn ImageClassifier>> {
        let classifier = BurnClassifier::<B>::load(
            self.model.clone(),
            self.training.clone(),
            Default::default(),
            store,
            record,
        )?;
        Ok(Box::new(classifier))
    }
}
