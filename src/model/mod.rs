pub mod model_metadata;
pub mod model_storage;
pub mod config;

pub use model_metadata::{ModelRecord, WeightsManifest};
pub use model_storage::{pack_bundle, unpack_bundle, read_manifest, log_manifest_info};
pub use config::{EngineConfig, ModelKind, ModelSettings, TrainingSettings, OrchestratorSettings};
