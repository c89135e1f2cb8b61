mod cli;
mod data;
mod dataset;
mod evaluate;
mod model;
mod predict;
mod train;
mod visualize;
mod weights;

pub use cli::run;
pub use dataset::{CifarDataset, CifarItem, CifarSplit, DatasetError, CIFAR10_CLASSES};
pub use evaluate::{evaluate, ClassAccuracy, EvaluationReport};
pub use model::{
    ActivationCapture, AnyClassifier, Architecture, ImageClassifier, MiniResNet, MiniResNetConfig,
    ModelConfig, ResNet18, ResNet18Config,
};
pub use predict::{predict, Output, PredictConfig};
pub use train::{train, TrainingConfig};
pub use visualize::{make_grid, render_activations, render_filters, GridOptions, TileStack};
pub use weights::{ResNet18Weights, WeightsError};
