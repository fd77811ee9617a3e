//! エンジン全体のエラー定義
//!
//! コーデック・ストア・エンジンの3層に分かれています。
//! 呼び出し側へは最終的に [`EngineError`] として返ります。

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ProjectId;

/// 画像デコード時のエラー
#[derive(Debug, Error)]
pub enum CodecError {
    /// 画像バイト列が空
    #[error("image payload is empty")]
    Empty,
    /// 画像としてデコードできない
    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),
    /// data URL の形式が不正
    #[error("malformed data URL: {0}")]
    DataUrl(String),
    /// base64 のデコード失敗
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    /// テンソルの要素数がサイズと一致しない
    #[error("tensor has {actual} values, expected {expected} for a {size}x{size} image")]
    TensorShape {
        size: usize,
        expected: usize,
        actual: usize,
    },
}

/// レコードの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Project,
    Dataset,
    Model,
}

impl RecordKind {
    /// ストア内のディレクトリ名
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Project => "projects",
            RecordKind::Dataset => "datasets",
            RecordKind::Model => "models",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 永続化ストアのエラー
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} record for project {project_id} not found")]
    NotFound { kind: RecordKind, project_id: ProjectId },
    #[error("blob '{0}' not found")]
    BlobNotFound(String),
    #[error("invalid blob key '{0}'")]
    InvalidKey(String),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("record serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("weight bundle is malformed: {0}")]
    Bundle(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. } | StoreError::BlobNotFound(_))
    }
}

/// エンジンのドメインエラー
#[derive(Debug, Error)]
pub enum EngineError {
    /// ラベル数・画像数の条件を満たさない
    #[error("dataset is not trainable: {reason}")]
    NotTrainable { reason: String },
    /// 学習済みモデルが存在しない
    #[error("no trained model is loaded")]
    ModelNotReady,
    #[error(transparent)]
    Decode(#[from] CodecError),
    #[error(transparent)]
    Persistence(#[from] StoreError),
    /// 学習中の数値エラーやランタイムエラー
    #[error("training failed: {0}")]
    TrainingFailure(String),
    #[error("invalid label name '{0}'")]
    InvalidLabel(String),
    #[error("label '{0}' not found")]
    LabelNotFound(String),
    #[error("label '{0}' already exists")]
    LabelExists(String),
    #[error("label '{0}' is reserved")]
    ReservedLabel(String),
    /// スコアベクトルとラベル列の長さ不一致
    #[error("score vector has {scores} entries but {labels} labels were given")]
    LabelMismatch { scores: usize, labels: usize },
}

impl EngineError {
    /// ユーザー操作で回復可能なエラーか
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::NotTrainable { .. }
                | EngineError::ModelNotReady
                | EngineError::Decode(_)
                | EngineError::InvalidLabel(_)
                | EngineError::LabelNotFound(_)
                | EngineError::LabelExists(_)
                | EngineError::ReservedLabel(_)
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
