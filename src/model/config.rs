//! エンジン設定管理モジュール
//!
//! モデル構成・学習パラメータ・オーケストレータ設定をJSON形式で保存・読み込みします。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ml::codec::IMAGE_SIZE;

/// モデルの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// 特徴抽出器ごとゼロから学習（凍結なし、既定）
    #[default]
    Cnn,
    /// 特徴抽出器をすべて凍結し、隠れ層付きヘッドのみ学習
    FeatureHead,
    /// 特徴抽出器の末尾ブロックのみ追加学習
    FineTuned,
}

impl ModelKind {
    /// 学習済み特徴抽出器の重みが必要か
    pub fn requires_pretrained(&self) -> bool {
        !matches!(self, ModelKind::Cnn)
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Cnn => write!(f, "CNN (from scratch)"),
            ModelKind::FeatureHead => write!(f, "Frozen extractor + head"),
            ModelKind::FineTuned => write!(f, "Fine-tuned extractor"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// モデルの種類
    pub kind: ModelKind,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// 特徴抽出器を何ブロック目で切り詰めるか
    pub cutoff_blocks: usize,
    /// 追加学習するブロック名（`FineTuned` のみ）
    pub fine_tune_blocks: Vec<String>,
    /// `FeatureHead` の隠れ層ユニット数
    pub hidden_units: usize,
    /// 学習済み特徴抽出器の重みファイル（Burn バイナリレコード）
    ///
    /// `FeatureHead` と `FineTuned` では必須。
    pub extractor_weights: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            kind: ModelKind::default(),
            image_size: IMAGE_SIZE,
            cutoff_blocks: 7,
            fine_tune_blocks: vec!["block_6".to_string(), "block_7".to_string()],
            hidden_units: 20,
            extractor_weights: None,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// 学習精度が改善しないまま何エポック続いたら打ち切るか（Noneで無効）
    pub early_stopping_patience: Option<usize>,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 15,
            batch_size: 16,
            learning_rate: 1e-3,
            seed: 42,
            early_stopping_patience: Some(5),
        }
    }
}

/// オーケストレータ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// 再学習までの待機時間（ミリ秒）
    pub debounce_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self { debounce_ms: 3000 }
    }
}

impl OrchestratorSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// エンジン設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// モデル設定
    pub model: ModelSettings,
    /// トレーニング設定
    pub training: TrainingSettings,
    /// オーケストレータ設定
    pub orchestrator: OrchestratorSettings,
    /// ファイルストアのルート（Noneでメモリストア）
    pub store_dir: Option<String>,
}

impl EngineConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("quicklabel.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// 設定を読み込む。存在しない・読めない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                tracing::info!("設定ファイルを読み込みました: {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {:#}。デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// 値の整合性チェック
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model.image_size < 8 {
            anyhow::bail!("model.image_size must be at least 8 (got {})", self.model.image_size);
        }
        if self.model.cutoff_blocks == 0 {
            anyhow::bail!("model.cutoff_blocks must be at least 1");
        }
        if self.training.batch_size == 0 {
            anyhow::bail!("training.batch_size must be at least 1");
        }
        if !(self.training.learning_rate > 0.0) {
            anyhow::bail!("training.learning_rate must be positive");
        }
        if self.model.kind.requires_pretrained() && self.model.extractor_weights.is_none() {
            anyhow::bail!("model.extractor_weights is required for kind {:?}", self.model.kind);
        }
        Ok(())
    }
}
