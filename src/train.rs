use crate::config::TrainingConfig;
use crate::dataset::{load_dataset, Split};
use crate::error::{DiagnosisError, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{
    loss::binary_cross_entropy_with_logit, ops::sigmoid, AdamW, Conv2d, Conv2dConfig, Linear,
    Optimizer, ParamsAdamW, VarBuilder, VarMap,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONV_FILTERS: usize = 32;
const HIDDEN_UNITS: usize = 64;

/// conv 3x3 -> relu -> max-pool 2x2 -> flatten -> dense -> relu -> dense (logit).
pub struct CardioNet {
    conv: Conv2d,
    fc1: Linear,
    fc2: Linear,
}

impl CardioNet {
    pub fn new(vb: VarBuilder, height: usize, width: usize) -> Result<Self> {
        let pooled = (height.saturating_sub(2) / 2, width.saturating_sub(2) / 2);
        if pooled.0 == 0 || pooled.1 == 0 {
            return Err(DiagnosisError::Config(format!(
                "samples of {height}x{width} are too small, need at least 4x4"
            )));
        }
        let conv = candle_nn::conv2d(1, CONV_FILTERS, 3, Conv2dConfig::default(), vb.pp("conv"))?;
        let fc1 = candle_nn::linear(CONV_FILTERS * pooled.0 * pooled.1, HIDDEN_UNITS, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(HIDDEN_UNITS, 1, vb.pp("fc2"))?;
        debug!(height, width, ?pooled, "cardio network built");
        Ok(Self { conv, fc1, fc2 })
    }
}

impl Module for CardioNet {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.apply(&self.conv)?
            .relu()?
            .max_pool2d(2)?
            .flatten_from(1)?
            .apply(&self.fc1)?
            .relu()?
            .apply(&self.fc2)?
            .squeeze(1)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub test_loss: f32,
    pub test_accuracy: f32,
}

/// Written next to the weights as `<output>.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub model_path: PathBuf,
    pub files: usize,
    pub skipped_files: usize,
    pub samples: usize,
    pub train_samples: usize,
    pub test_samples: usize,
    pub input_height: usize,
    pub input_width: usize,
    pub batch_size: usize,
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingReport {
    pub fn final_accuracy(&self) -> Option<f32> {
        self.epochs.last().map(|m| m.test_accuracy)
    }
}

pub fn report_path(model_path: &Path) -> PathBuf {
    let mut name = model_path.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

fn batch(split: &Split, indices: &[u32]) -> Result<(Tensor, Tensor)> {
    let idx = Tensor::from_vec(indices.to_vec(), indices.len(), split.features.device())?;
    Ok((
        split.features.index_select(&idx, 0)?,
        split.labels.index_select(&idx, 0)?,
    ))
}

/// Mean loss and accuracy (probability above 0.5) over `split`.
pub fn evaluate(model: &CardioNet, split: &Split, batch_size: usize) -> Result<(f32, f32)> {
    let indices: Vec<u32> = (0..split.len() as u32).collect();
    let mut loss_sum = 0f32;
    let mut correct = 0usize;
    for chunk in indices.chunks(batch_size) {
        let (xs, ys) = batch(split, chunk)?;
        let logits = model.forward(&xs)?;
        let loss = binary_cross_entropy_with_logit(&logits, &ys)?.to_scalar::<f32>()?;
        loss_sum += loss * chunk.len() as f32;
        let probs = sigmoid(&logits)?.to_vec1::<f32>()?;
        let labels = ys.to_vec1::<f32>()?;
        correct += probs
            .iter()
            .zip(labels.iter())
            .filter(|(p, y)| (**p > 0.5) == (**y >= 0.5))
            .count();
    }
    let n = split.len().max(1) as f32;
    Ok((loss_sum / n, correct as f32 / n))
}

/// Loads the dataset, fits [`CardioNet`], and saves weights plus report.
pub fn train(cfg: &TrainingConfig) -> Result<TrainingReport> {
    cfg.validate()?;
    let device = Device::Cpu;
    let dataset = load_dataset(cfg, &device)?;
    let (height, width) = dataset.sample_shape();
    let (train_split, test_split) = dataset.split(cfg.test_ratio, cfg.seed)?;
    info!(
        train = train_split.len(),
        test = test_split.len(),
        "dataset split"
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = CardioNet::new(vb, height, width)?;
    let mut opt = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: cfg.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut order: Vec<u32> = (0..train_split.len() as u32).collect();
    let mut history = Vec::with_capacity(cfg.epochs);
    for epoch in 1..=cfg.epochs {
        order.shuffle(&mut rng);
        let mut loss_sum = 0f32;
        for chunk in order.chunks(cfg.batch_size) {
            let (xs, ys) = batch(&train_split, chunk)?;
            let logits = model.forward(&xs)?;
            let loss = binary_cross_entropy_with_logit(&logits, &ys)?;
            opt.backward_step(&loss)?;
            loss_sum += loss.to_scalar::<f32>()? * chunk.len() as f32;
        }
        let train_loss = loss_sum / train_split.len() as f32;
        let (test_loss, test_accuracy) = evaluate(&model, &test_split, cfg.batch_size)?;
        info!(epoch, train_loss, test_loss, test_accuracy, "epoch complete");
        history.push(EpochMetrics {
            epoch,
            train_loss,
            test_loss,
            test_accuracy,
        });
    }

    if let Some(parent) = cfg.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    varmap.save(&cfg.output)?;
    let report = TrainingReport {
        model_path: cfg.output.clone(),
        files: dataset.files.len(),
        skipped_files: dataset.skipped.len(),
        samples: dataset.len(),
        train_samples: train_split.len(),
        test_samples: test_split.len(),
        input_height: height,
        input_width: width,
        batch_size: cfg.batch_size,
        epochs: history,
    };
    std::fs::write(report_path(&cfg.output), serde_json::to_vec_pretty(&report)?)?;
    info!(path = %cfg.output.display(), "model saved");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_yields_one_logit_per_sample() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = CardioNet::new(vb, 12, 9).unwrap();
        let xs = Tensor::zeros((5, 1, 12, 9), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&xs).unwrap().dims(), &[5]);
    }

    #[test]
    fn tiny_inputs_are_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(CardioNet::new(vb, 3, 10).is_err());
    }

    #[test]
    fn report_sits_next_to_weights() {
        assert_eq!(
            report_path(Path::new("out/heart.safetensors")),
            PathBuf::from("out/heart.safetensors.json")
        );
    }
}
