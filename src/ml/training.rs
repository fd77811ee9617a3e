//! 学習ループと自己評価
//!
//! データセットの画像を一度だけテンソル用の値列に変換し、
//! エポックごとにシードつきでシャッフルしたミニバッチで Adam を回します。

use std::sync::Arc;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset as BurnDataset},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::error::{EngineError, Result};
use crate::ml::codec::{self, NUM_CHANNELS};
use crate::ml::network::ClassifierNet;
use crate::model::config::TrainingSettings;
use crate::types::{ImagePrediction, Label, LabelPrediction, Prediction, ProjectId, TrainingLog};

/// エンコード済みの学習サンプル
#[derive(Clone, Debug)]
pub struct ImageItem {
    pub pixels: Arc<[f32]>,
    pub label: usize,
}

/// 学習用データセット
///
/// サンプルはラベル順・ラベル内の画像順に並びます。
pub struct EncodedDataset {
    items: Vec<ImageItem>,
    class_names: Vec<String>,
    counts: Vec<usize>,
    image_size: usize,
}

impl EncodedDataset {
    /// ラベルごとの画像をエンコードする
    ///
    /// 1枚でもデコードできない画像があれば学習全体を失敗させます。
    pub fn from_labels(labels: &[&Label], image_size: usize) -> Result<Self> {
        let mut items = Vec::new();
        let mut class_names = Vec::with_capacity(labels.len());
        let mut counts = Vec::with_capacity(labels.len());

        for (class_id, label) in labels.iter().enumerate() {
            for (index, image) in label.images.iter().enumerate() {
                let tensor = codec::encode(&image.src, image_size).map_err(|e| {
                    tracing::error!(
                        label = %label.name,
                        index,
                        "学習画像のデコードに失敗しました: {}",
                        e
                    );
                    EngineError::Decode(e)
                })?;
                items.push(ImageItem {
                    pixels: tensor.into_values().into(),
                    label: class_id,
                });
            }
            class_names.push(label.name.clone());
            counts.push(label.images.len());
        }

        tracing::info!(
            "{} 枚の画像を {} クラスから読み込みました",
            items.len(),
            class_names.len()
        );
        for (name, count) in class_names.iter().zip(&counts) {
            tracing::debug!("  クラス '{}': {} 枚", name, count);
        }

        Ok(Self {
            items,
            class_names,
            counts,
            image_size,
        })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// ラベルごとの画像枚数
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }
}

impl BurnDataset<ImageItem> for EncodedDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチャー
#[derive(Clone)]
pub struct ImageBatcher {
    image_size: usize,
}

impl ImageBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * NUM_CHANNELS * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), device)
            .reshape([batch_size, NUM_CHANNELS, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), device);

        ImageBatch { images, targets }
    }
}

/// 学習精度に基づく早期終了
#[derive(Debug)]
pub struct EarlyStopping {
    patience: Option<usize>,
    best: f64,
    stale_epochs: usize,
}

impl EarlyStopping {
    pub fn new(patience: Option<usize>) -> Self {
        Self {
            patience,
            best: f64::NEG_INFINITY,
            stale_epochs: 0,
        }
    }

    /// エポックの精度を記録し、打ち切るべきなら true を返す
    pub fn should_stop(&mut self, accuracy: f64) -> bool {
        let Some(patience) = self.patience else {
            return false;
        };
        if accuracy > self.best {
            self.best = accuracy;
            self.stale_epochs = 0;
            return false;
        }
        self.stale_epochs += 1;
        self.stale_epochs >= patience
    }
}

/// モデル学習を実行
///
/// 戻り値は学習後のモデルとエポックごとのログです。
pub fn fit<B: AutodiffBackend>(
    model: ClassifierNet<B>,
    data: &EncodedDataset,
    settings: &TrainingSettings,
    device: &B::Device,
) -> Result<(ClassifierNet<B>, Vec<TrainingLog>)> {
    if data.len() == 0 {
        return Err(EngineError::TrainingFailure("学習データがありません".to_string()));
    }

    let batcher = ImageBatcher::new(data.image_size());
    let batch_size = settings.batch_size.max(1);
    let mut optim = AdamConfig::new().init::<B, ClassifierNet<B>>();
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut indices: Vec<usize> = (0..data.len()).collect();
    let mut stopper = EarlyStopping::new(settings.early_stopping_patience);
    let mut history = Vec::with_capacity(settings.num_epochs);
    let mut model = model;

    tracing::info!(
        "学習を開始します (エポック数: {}, バッチサイズ: {}, 学習率: {})",
        settings.num_epochs,
        batch_size,
        settings.learning_rate
    );

    for epoch in 0..settings.num_epochs {
        indices.shuffle(&mut rng);

        let mut loss_sum = 0.0;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for chunk in indices.chunks(batch_size) {
            let items: Vec<ImageItem> = chunk.iter().filter_map(|&i| data.get(i)).collect();
            let batch_len = items.len();
            let batch: ImageBatch<B> = batcher.batch(items, device);

            let output = model.forward_classification(batch.images, batch.targets);
            let batch_loss: f64 = output.loss.clone().into_scalar().elem();
            if !batch_loss.is_finite() {
                return Err(EngineError::TrainingFailure(format!(
                    "損失が発散しました (epoch {}, loss {})",
                    epoch, batch_loss
                )));
            }

            correct += count_correct(output.output.clone(), output.targets.clone());
            loss_sum += batch_loss * batch_len as f64;
            seen += batch_len;

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(settings.learning_rate, model, grads);
        }

        let log = TrainingLog {
            epoch,
            loss: loss_sum / seen as f64,
            accuracy: correct as f64 / seen as f64,
        };
        tracing::info!(
            epoch = log.epoch,
            loss = log.loss,
            accuracy = log.accuracy,
            "エポック完了"
        );
        history.push(log);

        if stopper.should_stop(log.accuracy) {
            tracing::info!("精度が改善しないため学習を打ち切ります (epoch {})", epoch);
            break;
        }
    }

    Ok((model, history))
}

fn count_correct<B: Backend>(output: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let predicted = output.argmax(1).flatten::<1>(0, 1);
    let matches: i64 = predicted.equal(targets).int().sum().into_scalar().elem();
    matches.max(0) as usize
}

/// 学習データ全体を推論し、元の順序でクラス確率を返す
pub fn evaluate<B: Backend>(
    model: &ClassifierNet<B>,
    data: &EncodedDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<Vec<ImagePrediction>> {
    let batcher = ImageBatcher::new(data.image_size());
    let classes = data.num_classes();
    let indices: Vec<usize> = (0..data.len()).collect();
    let mut scores = Vec::with_capacity(data.len());

    for chunk in indices.chunks(batch_size.max(1)) {
        let items: Vec<ImageItem> = chunk.iter().filter_map(|&i| data.get(i)).collect();
        let batch: ImageBatch<B> = batcher.batch(items, device);
        let probs = model
            .predict(batch.images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| EngineError::TrainingFailure(format!("推論結果の取得エラー: {:?}", e)))?;
        scores.extend(probs.chunks(classes).map(|row| row.to_vec()));
    }

    Ok(scores)
}

/// 画像ごとのスコアをラベルごとの画像枚数で区切る
///
/// `scores` はラベル順・ラベル内の画像順に並んでいる必要があります。
pub fn partition_scores(
    project_id: ProjectId,
    class_names: &[String],
    counts: &[usize],
    scores: Vec<ImagePrediction>,
) -> Prediction {
    let mut remaining = scores.into_iter();
    let labels = class_names
        .iter()
        .zip(counts)
        .map(|(name, &count)| LabelPrediction {
            label: name.clone(),
            images: remaining.by_ref().take(count).collect(),
        })
        .collect();

    Prediction { project_id, labels }
}
