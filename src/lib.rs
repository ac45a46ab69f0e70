pub mod cli;
pub mod config;
pub mod daemon;
pub mod dataset;
pub mod error;
pub mod ipc;
pub mod model;
pub mod predictor;
pub mod preprocess;
pub mod train;

pub use cli::{execute, predict_output, run_cli, Cli, Commands, ConfigSubcommand, OutputFormat};
pub use error::{DiagnosisError, Result};
pub use model::{Classifier, OnnxClassifier};
pub use predictor::{Diagnosis, DiagnosisReport, Label, PredictionOutput, Predictor};
pub use preprocess::{image_to_tensor, preprocess_path, TensorLayout};
