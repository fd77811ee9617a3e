use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub type ProjectId = u64;

/// 予約済みラベル名（学習対象外）
pub const UNLABELED: &str = "Unlabeled";

/// プロジェクト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// 撮影された画像（保存後は不変）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// エンコード済み画像（PNG/JPEGなど）。JSONではbase64文字列
    #[serde(with = "base64_bytes")]
    pub src: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl Image {
    pub fn new(src: Vec<u8>) -> Self {
        Self {
            src,
            created_at: Utc::now(),
        }
    }

    /// `data:image/jpeg;base64,...` 形式から画像を作成
    ///
    /// Webカメラのスクリーンショットはこの形式で渡されます。
    pub fn from_data_url(url: &str) -> Result<Self, CodecError> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| CodecError::DataUrl("missing 'data:' scheme".to_string()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| CodecError::DataUrl("missing ',' separator".to_string()))?;
        if !header.ends_with(";base64") {
            return Err(CodecError::DataUrl(format!("unsupported encoding '{}'", header)));
        }
        let src = STANDARD.decode(payload.trim())?;
        if src.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(Self::new(src))
    }
}

/// ラベル（名前と画像列）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub images: Vec<Image>,
}

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            images: Vec::new(),
        }
    }

    pub fn is_unlabeled(&self) -> bool {
        self.name == UNLABELED
    }
}

/// データセット（プロジェクトごとに1つ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub project_id: ProjectId,
    pub labels: Vec<Label>,
}

impl Dataset {
    /// "Unlabeled" のみを持つ初期データセット
    pub fn empty(project_id: ProjectId) -> Self {
        Self {
            project_id,
            labels: vec![Label::new(UNLABELED)],
        }
    }

    pub fn label(&self, name: &str) -> Option<&Label> {
        self.labels.iter().find(|label| label.name == name)
    }

    pub fn total_images(&self) -> usize {
        self.labels.iter().map(|label| label.images.len()).sum()
    }
}

/// 1エポック分の学習ログ
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingLog {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
}

/// 1枚の画像に対するクラスごとのスコア（学習時のラベル順）
pub type ImagePrediction = Vec<f32>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelPrediction {
    pub label: String,
    pub images: Vec<ImagePrediction>,
}

/// 学習データに対する自己評価のスナップショット
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub project_id: ProjectId,
    pub labels: Vec<LabelPrediction>,
}

/// 永続化された重みへの参照（ストアのblobキー）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelRef(pub String);

impl ModelRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// オーケストレータの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
    #[default]
    Idle,
    Loading,
    Failed,
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingStatus::Idle => write!(f, "idle"),
            TrainingStatus::Loading => write!(f, "loading"),
            TrainingStatus::Failed => write!(f, "failed"),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_dataset_has_unlabeled() {
        let dataset = Dataset::empty(1);
        assert_eq!(dataset.labels.len(), 1);
        assert!(dataset.labels[0].is_unlabeled());
        assert_eq!(dataset.total_images(), 0);
    }

    #[test]
    fn test_image_serializes_as_base64() {
        let image = Image::new(vec![1, 2, 3, 250]);
        let json = serde_json::to_value(&image).unwrap();
        assert_eq!(json["src"], "AQID+g==");

        let back: Image = serde_json::from_value(json).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn test_from_data_url() {
        let image = Image::from_data_url("data:image/png;base64,AQID").unwrap();
        assert_eq!(image.src, vec![1, 2, 3]);

        assert!(matches!(
            Image::from_data_url("image/png;base64,AQID"),
            Err(CodecError::DataUrl(_))
        ));
        assert!(matches!(
            Image::from_data_url("data:image/png,AQID"),
            Err(CodecError::DataUrl(_))
        ));
        assert!(matches!(
            Image::from_data_url("data:image/png;base64,!!"),
            Err(CodecError::Base64(_))
        ));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TrainingStatus::Loading).unwrap(), "\"loading\"");
        assert_eq!(TrainingStatus::Failed.to_string(), "failed");
    }
}
