pub mod codec;
pub mod network;
pub mod training;
pub mod classifier;

pub use codec::{ImageTensor, IMAGE_SIZE, NUM_CHANNELS};
pub use network::{ClassifierNet, FeatureExtractor, NetworkConfig};
pub use training::{EncodedDataset, ImageBatcher};
pub use classifier::{BurnClassifier, BurnClassifierFactory, ClassifierFactory, CpuBackend, ImageClassifier};
