use crate::error::{DiagnosisError, Result};
use crate::preprocess::TensorLayout;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::debug;

pub const CONFIG_ENV: &str = "MEDSCAN_CONFIG";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub models: ModelsConfig,
    pub inference: InferenceConfig,
    pub training: TrainingConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ModelsConfig {
    pub tuberculosis: PathBuf,
    pub retinopathy: PathBuf,
    /// Hugging Face repository to fetch missing model files from.
    pub hub_repo: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    /// A probability strictly above this is reported as positive.
    pub threshold: f32,
    pub image_size: u32,
    pub layout: TensorLayout,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    pub dataset_dir: PathBuf,
    pub extension: String,
    pub max_files: usize,
    pub feature_key: String,
    pub label_key: String,
    pub epochs: usize,
    pub batch_size: usize,
    pub test_ratio: f32,
    pub seed: u64,
    pub learning_rate: f64,
    pub output: PathBuf,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            tuberculosis: PathBuf::from("tb_detection_model.onnx"),
            retinopathy: PathBuf::from("diabetic_retinopathy_model.onnx"),
            hub_repo: None,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            image_size: 224,
            layout: TensorLayout::Nhwc,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset/cardio"),
            extension: "npz".to_string(),
            max_files: 500,
            feature_key: "val".to_string(),
            label_key: "label".to_string(),
            epochs: 10,
            batch_size: 32,
            test_ratio: 0.2,
            seed: 42,
            learning_rate: 0.001,
            output: PathBuf::from("heart_disease_model.safetensors"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: ModelsConfig::default(),
            inference: InferenceConfig::default(),
            training: TrainingConfig::default(),
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(DiagnosisError::Config(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if self.image_size == 0 {
            return Err(DiagnosisError::Config("image_size must be non-zero".into()));
        }
        Ok(())
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_files == 0 {
            return Err(DiagnosisError::Config("max_files must be non-zero".into()));
        }
        if self.epochs == 0 {
            return Err(DiagnosisError::Config("epochs must be non-zero".into()));
        }
        if self.batch_size == 0 {
            return Err(DiagnosisError::Config("batch_size must be non-zero".into()));
        }
        if !(self.test_ratio > 0.0 && self.test_ratio < 1.0) {
            return Err(DiagnosisError::Config(format!(
                "test_ratio must be within (0, 1), got {}",
                self.test_ratio
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(DiagnosisError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.feature_key.is_empty() || self.label_key.is_empty() {
            return Err(DiagnosisError::Config("record keys must be non-empty".into()));
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.inference.validate()?;
        self.training.validate()
    }
}

pub fn config_path() -> PathBuf {
    env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("medscan.json"))
}

/// Reads the configuration file, falling back to defaults when it does not exist.
pub fn load_config() -> Result<Config> {
    let path = config_path();
    let cfg = match fs::read(&path) {
        Ok(data) => {
            debug!(path = %path.display(), "loaded configuration file");
            serde_json::from_slice(&data)?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no configuration file, using defaults");
            Config::default()
        }
        Err(e) => return Err(e.into()),
    };
    cfg.validate()?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config) -> Result<PathBuf> {
    cfg.validate()?;
    let path = config_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, serde_json::to_vec_pretty(cfg)?)?;
    Ok(path)
}
