//! 少数のラベル付き画像から分類器を学習する転移学習エンジン
//!
//! プロジェクトごとにラベル付き画像を集め、学習可能になった時点で
//! 学習済み特徴抽出器の上に新しい分類ヘッドを学習します。

pub mod dataset;
pub mod error;
pub mod ml;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod summary;
pub mod types;

pub use dataset::{is_trainable, trainable_labels, DatasetManager};
pub use error::{CodecError, EngineError, Result, StoreError};
pub use ml::{BurnClassifierFactory, ClassifierFactory, CpuBackend, ImageClassifier};
pub use model::{EngineConfig, ModelKind, ModelRecord};
pub use orchestrator::{Orchestrator, TrainOutcome};
pub use store::{FileStore, MemoryStore, ObjectStore, RecordStoreExt};
pub use summary::{argmax_label, summarize_history, AccuracySummary, LabelScore};
pub use types::{
    Dataset, Image, ImagePrediction, Label, Prediction, Project, ProjectId, TrainingLog,
    TrainingStatus, UNLABELED,
};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// ログ出力を初期化する
///
/// `RUST_LOG` が設定されていればそちらを優先します。
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // 初期化済みなら何もしない
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
