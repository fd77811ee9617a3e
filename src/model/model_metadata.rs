//! モデルメタデータの定義
//!
//! - [`ModelRecord`]: ストアに保存されるモデル情報（プロジェクトごとに1件）
//! - [`WeightsManifest`]: 重みバンドル（tar.gz）内の `metadata.json`
//!
//! `label_names` の順序がスコアベクトルのインデックスとラベル名を結び付けます。
//! 学習時のスナップショットであり、後からデータセットを編集しても変わりません。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::NetworkConfig;
use crate::model::config::ModelKind;
use crate::types::{ModelRef, Prediction, ProjectId, TrainingLog};

/// 学習済みモデルの情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub project_id: ProjectId,
    /// 学習時のラベル順（"Unlabeled" を除く）
    pub label_names: Vec<String>,
    /// エポックごとの学習ログ
    pub history: Vec<TrainingLog>,
    /// 重みバンドルへの参照
    pub model_ref: ModelRef,
    /// 学習データに対する自己評価
    pub prediction: Prediction,
    #[serde(default)]
    pub kind: ModelKind,
    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

/// 重みバンドル内のメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightsManifest {
    pub project_id: ProjectId,
    /// ネットワーク構成（読み込み時に同じ構造を再構築する）
    pub network: NetworkConfig,
    /// 学習時のラベル順
    pub label_names: Vec<String>,
    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl WeightsManifest {
    /// 新しいメタデータを作成
    pub fn new(project_id: ProjectId, network: NetworkConfig, label_names: Vec<String>) -> Self {
        let trained_at = chrono::Utc::now().to_rfc3339();

        Self {
            project_id,
            network,
            label_names,
            trained_at,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
