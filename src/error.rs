use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiagnosisError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("failed to download model from {repo}: {reason}")]
    Hub { repo: String, reason: String },

    #[error("malformed model: {0}")]
    Model(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no valid sample files loaded from {}", .0.display())]
    NoValidSamples(PathBuf),

    #[error("dataset of {samples} samples is too small to split with test ratio {ratio}")]
    DatasetTooSmall { samples: usize, ratio: f32 },
}

pub type Result<T> = std::result::Result<T, DiagnosisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_path() {
        let err = DiagnosisError::ModelNotFound(PathBuf::from("tb.onnx"));
        assert_eq!(err.to_string(), "model file not found: tb.onnx");

        let err = DiagnosisError::NoValidSamples(PathBuf::from("data"));
        assert!(err.to_string().contains("data"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DiagnosisError = io.into();
        assert!(matches!(err, DiagnosisError::Io(_)));
    }
}
