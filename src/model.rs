use crate::error::{DiagnosisError, Result};
use candle_core::{DType, Tensor};
use candle_onnx::{onnx, read_file, simple_eval};
use hf_hub::api::sync::Api;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A binary classifier producing the probability that a condition is present.
pub trait Classifier: Send + Sync {
    fn probability(&self, input: &Tensor) -> Result<f32>;
}

pub struct OnnxClassifier {
    model: onnx::ModelProto,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    pub fn load(path: &Path) -> Result<Self> {
        let classifier = Self::from_proto(read_file(path)?)?;
        debug!(
            path = %path.display(),
            input = %classifier.input_name,
            output = %classifier.output_name,
            "model loaded"
        );
        Ok(classifier)
    }

    pub fn from_proto(model: onnx::ModelProto) -> Result<Self> {
        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| DiagnosisError::Model("model graph missing".into()))?;
        let initializers: HashSet<&str> =
            graph.initializer.iter().map(|t| t.name.as_str()).collect();
        let input_name = graph
            .input
            .iter()
            .find(|i| !initializers.contains(i.name.as_str()))
            .map(|i| i.name.clone())
            .ok_or_else(|| DiagnosisError::Model("graph has no runtime input".into()))?;
        let output_name = graph
            .output
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| DiagnosisError::Model("graph has no output".into()))?;
        Ok(Self {
            model,
            input_name,
            output_name,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn probability(&self, input: &Tensor) -> Result<f32> {
        let mut inputs = HashMap::new();
        inputs.insert(self.input_name.clone(), input.clone());
        let mut outputs = simple_eval(&self.model, inputs)?;
        let output = outputs
            .remove(&self.output_name)
            .ok_or_else(|| DiagnosisError::Model("model output missing".into()))?;
        let values = output.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let first = values
            .first()
            .copied()
            .ok_or_else(|| DiagnosisError::Model("model output is empty".into()))?;
        if !first.is_finite() {
            return Err(DiagnosisError::Model(format!(
                "model produced non-finite output {first}"
            )));
        }
        Ok(first.clamp(0.0, 1.0))
    }
}

/// Uses the local file when present, otherwise fetches it by file name from `hub_repo`.
pub fn resolve_model_path(path: &Path, hub_repo: Option<&str>) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    let Some(repo) = hub_repo else {
        return Err(DiagnosisError::ModelNotFound(path.to_path_buf()));
    };
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .ok_or_else(|| DiagnosisError::ModelNotFound(path.to_path_buf()))?;
    info!(repo, filename = %filename, "downloading model");
    Api::new()
        .and_then(|api| api.model(repo.to_string()).get(&filename))
        .map_err(|e| DiagnosisError::Hub {
            repo: repo.to_string(),
            reason: e.to_string(),
        })
}

pub fn load_classifier(path: &Path, hub_repo: Option<&str>) -> Result<OnnxClassifier> {
    OnnxClassifier::load(&resolve_model_path(path, hub_repo)?)
}
