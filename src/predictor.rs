use crate::config::{Config, InferenceConfig};
use crate::error::Result;
use crate::model::{load_classifier, Classifier};
use crate::preprocess::{image_to_tensor, preprocess_path, TensorLayout};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Positive,
    Negative,
}

impl Label {
    pub fn from_probability(probability: f32, threshold: f32) -> Self {
        if probability > threshold {
            Label::Positive
        } else {
            Label::Negative
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Positive => f.write_str("Positive"),
            Label::Negative => f.write_str("Negative"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Diagnosis {
    pub probability: f32,
    pub label: Label,
}

impl Diagnosis {
    pub fn new(probability: f32, threshold: f32) -> Self {
        Self {
            probability,
            label: Label::from_probability(probability, threshold),
        }
    }

    /// Probability as a percentage.
    pub fn confidence(&self) -> f64 {
        self.probability as f64 * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiagnosisReport {
    pub tuberculosis: Diagnosis,
    pub retinopathy: Diagnosis,
}

/// Wire shape of a successful prediction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PredictionJson {
    pub tb_probability: f64,
    pub dr_probability: f64,
    pub tb_diagnosis: Label,
    pub dr_diagnosis: Label,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum PredictionOutput {
    Report(PredictionJson),
    Error { error: String },
}

impl From<&DiagnosisReport> for PredictionJson {
    fn from(report: &DiagnosisReport) -> Self {
        Self {
            tb_probability: report.tuberculosis.confidence(),
            dr_probability: report.retinopathy.confidence(),
            tb_diagnosis: report.tuberculosis.label,
            dr_diagnosis: report.retinopathy.label,
        }
    }
}

impl<E: fmt::Display> From<std::result::Result<DiagnosisReport, E>> for PredictionOutput {
    fn from(result: std::result::Result<DiagnosisReport, E>) -> Self {
        match result {
            Ok(report) => PredictionOutput::Report((&report).into()),
            Err(e) => PredictionOutput::Error {
                error: e.to_string(),
            },
        }
    }
}

impl PredictionOutput {
    pub fn is_error(&self) -> bool {
        matches!(self, PredictionOutput::Error { .. })
    }
}

const BAR_WIDTH: usize = 20;

fn progress_bar(confidence: f64) -> String {
    let filled = ((confidence / 100.0) * BAR_WIDTH as f64).round() as usize;
    let filled = filled.min(BAR_WIDTH);
    format!("[{}{}]", "#".repeat(filled), ".".repeat(BAR_WIDTH - filled))
}

/// Human-readable rendering: diagnosis, progress bar and confidence per disease.
pub fn render_text(report: &DiagnosisReport) -> String {
    let mut out = String::new();
    for (name, d) in [
        ("Tuberculosis", &report.tuberculosis),
        ("Diabetic Retinopathy", &report.retinopathy),
    ] {
        out.push_str(&format!("{name} Diagnosis: {}\n", d.label));
        out.push_str(&format!("{}\n", progress_bar(d.confidence())));
        out.push_str(&format!("Confidence: {:.2}%\n", d.confidence()));
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictorSettings {
    pub threshold: f32,
    pub image_size: u32,
    pub layout: TensorLayout,
}

impl From<&InferenceConfig> for PredictorSettings {
    fn from(cfg: &InferenceConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            image_size: cfg.image_size,
            layout: cfg.layout,
        }
    }
}

impl Default for PredictorSettings {
    fn default() -> Self {
        (&InferenceConfig::default()).into()
    }
}

/// Both disease models, loaded once and shared read-only.
pub struct Predictor {
    tuberculosis: Box<dyn Classifier>,
    retinopathy: Box<dyn Classifier>,
    settings: PredictorSettings,
    device: Device,
}

impl Predictor {
    pub fn new(
        tuberculosis: Box<dyn Classifier>,
        retinopathy: Box<dyn Classifier>,
        settings: PredictorSettings,
    ) -> Result<Self> {
        InferenceConfig {
            threshold: settings.threshold,
            image_size: settings.image_size,
            layout: settings.layout,
        }
        .validate()?;
        Ok(Self {
            tuberculosis,
            retinopathy,
            settings,
            device: Device::Cpu,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let hub = cfg.models.hub_repo.as_deref();
        let tb = load_classifier(&cfg.models.tuberculosis, hub)?;
        let dr = load_classifier(&cfg.models.retinopathy, hub)?;
        info!(
            tb = %cfg.models.tuberculosis.display(),
            dr = %cfg.models.retinopathy.display(),
            threshold = cfg.inference.threshold,
            "models ready"
        );
        Self::new(Box::new(tb), Box::new(dr), (&cfg.inference).into())
    }

    pub fn settings(&self) -> &PredictorSettings {
        &self.settings
    }

    pub fn diagnose_tensor(&self, input: &Tensor) -> Result<DiagnosisReport> {
        let threshold = self.settings.threshold;
        let tb = self.tuberculosis.probability(input)?;
        let dr = self.retinopathy.probability(input)?;
        debug!(tb, dr, "model outputs");
        Ok(DiagnosisReport {
            tuberculosis: Diagnosis::new(tb, threshold),
            retinopathy: Diagnosis::new(dr, threshold),
        })
    }

    pub fn diagnose_image(&self, img: &DynamicImage) -> Result<DiagnosisReport> {
        let input = image_to_tensor(
            img,
            self.settings.image_size,
            self.settings.layout,
            &self.device,
        )?;
        self.diagnose_tensor(&input)
    }

    pub fn diagnose_path(&self, path: &Path) -> Result<DiagnosisReport> {
        let input = preprocess_path(
            path,
            self.settings.image_size,
            self.settings.layout,
            &self.device,
        )?;
        self.diagnose_tensor(&input)
    }
}
