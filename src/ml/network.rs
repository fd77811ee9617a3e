//! 転移学習用ネットワークの定義
//!
//! 事前学習済みの特徴抽出器（深さ方向分離畳み込みブロックの積み重ね）を
//! 途中のブロックで切り詰め、その上に新しい分類ヘッドを載せます。
//!
//! # アーキテクチャ
//! - Stem: Conv 3x3 (stride 2, padding 1) 3 -> 16 + ReLU
//! - Block x N: {Depthwise Conv 3x3 + ReLU, Pointwise Conv 1x1 + ReLU}
//! - Global Average Pooling
//! - (FeatureHead のみ) FC: d -> hidden + ReLU
//! - FC: -> num_classes
//! - Softmax (推論時)
//!
//! # 凍結
//! - `Cnn`: 凍結なし（ゼロから学習）
//! - `FeatureHead`: 特徴抽出器をすべて凍結
//! - `FineTuned`: `fine_tune_blocks` に名前のあるブロック以外を凍結

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{BinFileRecorder, FullPrecisionSettings, RecorderError},
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use std::path::Path;

use crate::ml::codec::NUM_CHANNELS;
use crate::model::config::{ModelKind, ModelSettings};

/// Stemの出力チャネル数
const STEM_CHANNELS: usize = 16;

/// 特徴抽出器のブロック構成: (出力チャネル, ストライド)
///
/// ブロック名は先頭から `block_1`, `block_2`, ... となります。
pub const BLOCK_PLAN: [(usize, usize); 7] = [
    (32, 1),
    (64, 2),
    (64, 1),
    (128, 2),
    (128, 1),
    (256, 2),
    (256, 1),
];

/// ブロックのインデックス（0始まり）から名前を返す
pub fn block_name(index: usize) -> String {
    format!("block_{}", index + 1)
}

/// ネットワーク構成
///
/// 重みバンドルに保存され、読み込み時に同じ構造を再構築するために使います。
#[derive(Config, Debug)]
pub struct NetworkConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// モデルの種類
    pub kind: ModelKind,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// 使用するブロック数
    pub cutoff_blocks: usize,
    /// 追加学習するブロック名
    pub fine_tune_blocks: Vec<String>,
    /// `FeatureHead` の隠れ層ユニット数
    #[config(default = 20)]
    pub hidden_units: usize,
}

impl NetworkConfig {
    /// 設定とクラス数から構成を作る
    pub fn from_settings(settings: &ModelSettings, num_classes: usize) -> Self {
        NetworkConfig::new(
            num_classes,
            settings.kind,
            settings.image_size,
            settings.cutoff_blocks,
            settings.fine_tune_blocks.clone(),
        )
        .with_hidden_units(settings.hidden_units)
    }

    /// 実際に使うブロック数（1..=BLOCK_PLAN.len() に丸める）
    pub fn cutoff(&self) -> usize {
        self.cutoff_blocks.clamp(1, BLOCK_PLAN.len())
    }

    /// 切り詰め後の特徴次元
    pub fn feature_dim(&self) -> usize {
        BLOCK_PLAN[self.cutoff() - 1].0
    }

    /// 学習対象になるブロック名の一覧
    pub fn trainable_blocks(&self) -> Vec<String> {
        let names = (0..self.cutoff()).map(block_name);
        match self.kind {
            ModelKind::Cnn => names.collect(),
            ModelKind::FeatureHead => Vec::new(),
            ModelKind::FineTuned => names
                .filter(|name| self.fine_tune_blocks.contains(name))
                .collect(),
        }
    }

    /// ネットワークを初期化（重みはランダム）
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierNet<B> {
        self.assemble(FeatureExtractor::init(device), device)
    }

    /// 特徴抽出器を切り詰め、分類ヘッドを載せる
    pub fn assemble<B: Backend>(&self, extractor: FeatureExtractor<B>, device: &B::Device) -> ClassifierNet<B> {
        let extractor = extractor.truncate(self.cutoff());
        let d = self.feature_dim();

        let (hidden, head) = match self.kind {
            ModelKind::FeatureHead => (
                Some(LinearConfig::new(d, self.hidden_units).init(device)),
                LinearConfig::new(self.hidden_units, self.num_classes).init(device),
            ),
            ModelKind::Cnn | ModelKind::FineTuned => {
                (None, LinearConfig::new(d, self.num_classes).init(device))
            }
        };

        tracing::debug!(
            kind = %self.kind,
            image_size = self.image_size,
            blocks = self.cutoff(),
            feature_dim = d,
            classes = self.num_classes,
            "ネットワークを構築しました"
        );

        ClassifierNet {
            extractor,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            hidden,
            head,
            activation: Relu::new(),
        }
    }
}

/// 深さ方向分離畳み込みブロック
#[derive(Module, Debug)]
pub struct SeparableBlock<B: Backend> {
    depthwise: Conv2d<B>,
    pointwise: Conv2d<B>,
    activation: Relu,
}

impl<B: Backend> SeparableBlock<B> {
    fn new(channels_in: usize, channels_out: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            depthwise: Conv2dConfig::new([channels_in, channels_in], [3, 3])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_groups(channels_in)
                .init(device),
            pointwise: Conv2dConfig::new([channels_in, channels_out], [1, 1]).init(device),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.depthwise.forward(x));
        self.activation.forward(self.pointwise.forward(x))
    }
}

/// 特徴抽出器
#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    stem: Conv2d<B>,
    blocks: Vec<SeparableBlock<B>>,
    activation: Relu,
}

impl<B: Backend> FeatureExtractor<B> {
    /// 全ブロックを持つ特徴抽出器を初期化
    pub fn init(device: &B::Device) -> Self {
        let stem = Conv2dConfig::new([NUM_CHANNELS, STEM_CHANNELS], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let mut channels_in = STEM_CHANNELS;
        let mut blocks = Vec::with_capacity(BLOCK_PLAN.len());
        for (channels_out, stride) in BLOCK_PLAN {
            blocks.push(SeparableBlock::new(channels_in, channels_out, stride, device));
            channels_in = channels_out;
        }

        Self {
            stem,
            blocks,
            activation: Relu::new(),
        }
    }

    /// 学習済み重みファイルから全ブロックを読み込む
    pub fn load_pretrained(path: &Path, device: &B::Device) -> Result<Self, RecorderError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        Self::init(device).load_file(path.to_path_buf(), &recorder, device)
    }

    /// 重みファイルとして書き出す（拡張子 `.bin` が付与される）
    pub fn save_pretrained(self, path: &Path) -> Result<(), RecorderError> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.save_file(path.to_path_buf(), &recorder)
    }

    /// 先頭 `count` ブロックのみ残す
    pub fn truncate(mut self, count: usize) -> Self {
        self.blocks.truncate(count);
        self
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// 名前のあるブロック以外を凍結する（Stemは常に凍結）
    pub fn freeze_except(self, trainable: &[String]) -> Self {
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(index, block)| {
                if trainable.contains(&block_name(index)) {
                    block
                } else {
                    block.no_grad()
                }
            })
            .collect();

        Self {
            stem: self.stem.no_grad(),
            blocks,
            activation: self.activation,
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.activation.forward(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }
}

/// 分類ネットワーク（特徴抽出器 + 分類ヘッド）
#[derive(Module, Debug)]
pub struct ClassifierNet<B: Backend> {
    extractor: FeatureExtractor<B>,
    pool: AdaptiveAvgPool2d,
    hidden: Option<Linear<B>>,
    head: Linear<B>,
    activation: Relu,
}

impl<B: Backend> ClassifierNet<B> {
    /// 構成に従って凍結する
    pub fn freeze(self, config: &NetworkConfig) -> Self {
        match config.kind {
            ModelKind::Cnn => self,
            ModelKind::FeatureHead => Self {
                extractor: self.extractor.no_grad(),
                ..self
            },
            ModelKind::FineTuned => Self {
                extractor: self.extractor.freeze_except(&config.fine_tune_blocks),
                ..self
            },
        }
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.extractor.forward(images);
        let x = self.pool.forward(x);

        // Flatten: [batch, c, 1, 1] -> [batch, c]
        let [_, c, _, _] = x.dims();
        let mut x = x.reshape([batch_size, c]);

        if let Some(hidden) = &self.hidden {
            x = self.activation.forward(hidden.forward(x));
        }

        self.head.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// 損失はソフトマックス + カテゴリカル交差エントロピーです。
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}
