//! Sample file discovery and loading for the cardio training job.
//!
//! Each sample file is a NumPy `.npz` archive holding a feature array of shape
//! `(n, h, w)` or `(n, h, w, 1)` and a label array with `n` entries. Files that
//! do not fit are skipped with a warning; the rest are concatenated into one
//! channel-first dataset.

use crate::config::TrainingConfig;
use crate::error::{DiagnosisError, Result};
use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Why a sample file was left out of the dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Unreadable(String),
    MissingKeys(Vec<String>),
    BadRank(Vec<usize>),
    SampleMismatch { features: usize, labels: usize },
    ShapeChanged { expected: (usize, usize), found: (usize, usize) },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unreadable(e) => write!(f, "unreadable: {e}"),
            SkipReason::MissingKeys(keys) => write!(f, "missing required keys {keys:?}"),
            SkipReason::BadRank(dims) => write!(f, "unexpected feature shape {dims:?}"),
            SkipReason::SampleMismatch { features, labels } => {
                write!(f, "feature-label mismatch: {features} vs {labels}")
            }
            SkipReason::ShapeChanged { expected, found } => {
                write!(f, "sample shape {found:?} differs from {expected:?}")
            }
        }
    }
}

/// Features `(n, h, w)` and labels `(n,)` read from one file, both f32.
#[derive(Debug)]
pub struct Record {
    pub features: Tensor,
    pub labels: Tensor,
}

impl Record {
    pub fn len(&self) -> usize {
        self.labels.dims1().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sample_shape(&self) -> (usize, usize) {
        let dims = self.features.dims();
        (dims[1], dims[2])
    }
}

/// Regular files in `dir` with the given extension, sorted by path.
pub fn candidate_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

pub fn select_files(mut files: Vec<PathBuf>, max_files: usize, seed: u64) -> Vec<PathBuf> {
    let mut rng = StdRng::seed_from_u64(seed);
    files.shuffle(&mut rng);
    files.truncate(max_files);
    files
}

pub fn read_record(
    path: &Path,
    feature_key: &str,
    label_key: &str,
    device: &Device,
) -> std::result::Result<Record, SkipReason> {
    let arrays: HashMap<String, Tensor> = Tensor::read_npz(path)
        .map_err(|e| SkipReason::Unreadable(e.to_string()))?
        .into_iter()
        .collect();
    debug!(file = %path.display(), keys = ?arrays.keys().collect::<Vec<_>>(), "record keys");

    let missing: Vec<String> = [feature_key, label_key]
        .iter()
        .filter(|k| !arrays.contains_key(**k))
        .map(|k| k.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(SkipReason::MissingKeys(missing));
    }

    let convert = |t: &Tensor| -> std::result::Result<Tensor, SkipReason> {
        t.to_dtype(DType::F32)
            .and_then(|t| t.to_device(device))
            .map_err(|e| SkipReason::Unreadable(e.to_string()))
    };
    let features = convert(&arrays[feature_key])?;
    let labels = convert(&arrays[label_key])?
        .flatten_all()
        .map_err(|e| SkipReason::Unreadable(e.to_string()))?;

    let dims = features.dims().to_vec();
    let features = match dims.as_slice() {
        [_, _, _] => features,
        [_, _, _, 1] => features
            .squeeze(3)
            .map_err(|e| SkipReason::Unreadable(e.to_string()))?,
        _ => return Err(SkipReason::BadRank(dims.clone())),
    };
    let n_features = features.dims()[0];
    let n_labels = labels.dims()[0];
    if n_features != n_labels {
        return Err(SkipReason::SampleMismatch {
            features: n_features,
            labels: n_labels,
        });
    }
    Ok(Record { features, labels })
}

/// Concatenated samples: features `(N, 1, H, W)` scaled to `[0, 1]`, labels `(N,)`.
#[derive(Debug)]
pub struct Dataset {
    pub features: Tensor,
    pub labels: Tensor,
    pub files: Vec<PathBuf>,
    pub skipped: Vec<(PathBuf, SkipReason)>,
}

impl Dataset {
    pub fn from_records(
        records: Vec<(PathBuf, Record)>,
        skipped: Vec<(PathBuf, SkipReason)>,
        source: &Path,
    ) -> Result<Self> {
        if records.is_empty() {
            return Err(DiagnosisError::NoValidSamples(source.to_path_buf()));
        }
        let (files, records): (Vec<_>, Vec<_>) = records.into_iter().unzip();
        let features: Vec<&Tensor> = records.iter().map(|r| &r.features).collect();
        let labels: Vec<&Tensor> = records.iter().map(|r| &r.labels).collect();
        let features = Tensor::cat(&features, 0)?
            .affine(1.0 / 255.0, 0.0)?
            .unsqueeze(1)?;
        let labels = Tensor::cat(&labels, 0)?;
        Ok(Self {
            features,
            labels,
            files,
            skipped,
        })
    }

    pub fn len(&self) -> usize {
        self.features.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(height, width)` of one sample.
    pub fn sample_shape(&self) -> (usize, usize) {
        let dims = self.features.dims();
        (dims[2], dims[3])
    }

    /// Seeded shuffle into `(train, test)`; the test side gets `ceil(len * test_ratio)` samples.
    pub fn split(&self, test_ratio: f32, seed: u64) -> Result<(Split, Split)> {
        let n = self.len();
        let n_test = (n as f32 * test_ratio).ceil() as usize;
        if n_test == 0 || n_test >= n {
            return Err(DiagnosisError::DatasetTooSmall {
                samples: n,
                ratio: test_ratio,
            });
        }
        let mut indices: Vec<u32> = (0..n as u32).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        let (test_idx, train_idx) = indices.split_at(n_test);
        Ok((self.select(train_idx)?, self.select(test_idx)?))
    }

    fn select(&self, indices: &[u32]) -> Result<Split> {
        let idx = Tensor::from_vec(indices.to_vec(), indices.len(), self.features.device())?;
        Ok(Split {
            features: self.features.index_select(&idx, 0)?,
            labels: self.labels.index_select(&idx, 0)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Split {
    pub features: Tensor,
    pub labels: Tensor,
}

impl Split {
    pub fn len(&self) -> usize {
        self.features.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scans, samples and loads the dataset directory described by `cfg`.
pub fn load_dataset(cfg: &TrainingConfig, device: &Device) -> Result<Dataset> {
    let dir = &cfg.dataset_dir;
    let all = candidate_files(dir, &cfg.extension)?;
    let total = all.len();
    let selected = select_files(all, cfg.max_files, cfg.seed);
    info!(dir = %dir.display(), total, selected = selected.len(), "scanning sample files");

    let mut records = Vec::new();
    let mut skipped = Vec::new();
    let mut shape: Option<(usize, usize)> = None;
    for path in selected {
        let record = read_record(&path, &cfg.feature_key, &cfg.label_key, device).and_then(|r| {
            match shape {
                Some(expected) if expected != r.sample_shape() => Err(SkipReason::ShapeChanged {
                    expected,
                    found: r.sample_shape(),
                }),
                _ => Ok(r),
            }
        });
        match record {
            Ok(r) => {
                shape.get_or_insert(r.sample_shape());
                records.push((path, r));
            }
            Err(reason) => {
                warn!(file = %path.display(), %reason, "skipping sample file");
                skipped.push((path, reason));
            }
        }
    }

    let dataset = Dataset::from_records(records, skipped, dir)?;
    info!(
        samples = dataset.len(),
        files = dataset.files.len(),
        skipped = dataset.skipped.len(),
        shape = ?dataset.features.dims(),
        "dataset loaded"
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_sample(dir: &Path, name: &str, n: usize, n_labels: usize) -> PathBuf {
        let path = dir.join(name);
        let features = Tensor::full(255f32, (n, 6, 6), &Device::Cpu).unwrap();
        let labels = Tensor::zeros(n_labels, DType::F32, &Device::Cpu).unwrap();
        Tensor::write_npz(&[("val", &features), ("label", &labels)], &path).unwrap();
        path
    }

    #[test]
    fn candidates_filter_by_extension() {
        let dir = tempdir().unwrap();
        write_sample(dir.path(), "b.npz", 1, 1);
        write_sample(dir.path(), "a.NPZ", 1, 1);
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub.npz")).unwrap();
        let files = candidate_files(dir.path(), "npz").unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.NPZ", "b.npz"]);
    }

    #[test]
    fn selection_is_seeded_and_capped() {
        let files: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("{i}.npz"))).collect();
        let a = select_files(files.clone(), 4, 7);
        let b = select_files(files, 4, 7);
        assert_eq!(a.len(), 4);
        assert_eq!(a, b);
    }

    #[test]
    fn mismatched_counts_are_reported() {
        let dir = tempdir().unwrap();
        let path = write_sample(dir.path(), "bad.npz", 3, 2);
        let err = read_record(&path, "val", "label", &Device::Cpu).unwrap_err();
        assert_eq!(
            err,
            SkipReason::SampleMismatch {
                features: 3,
                labels: 2
            }
        );
    }

    #[test]
    fn missing_keys_are_reported() {
        let dir = tempdir().unwrap();
        let path = write_sample(dir.path(), "s.npz", 2, 2);
        let err = read_record(&path, "signal", "label", &Device::Cpu).unwrap_err();
        assert_eq!(err, SkipReason::MissingKeys(vec!["signal".to_string()]));
    }

    #[test]
    fn trailing_channel_is_accepted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.npz");
        let features = Tensor::zeros((2, 5, 7, 1), DType::U8, &Device::Cpu).unwrap();
        let labels = Tensor::zeros((2, 1), DType::F32, &Device::Cpu).unwrap();
        Tensor::write_npz(&[("val", &features), ("label", &labels)], &path).unwrap();
        let record = read_record(&path, "val", "label", &Device::Cpu).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.sample_shape(), (5, 7));
    }

    #[test]
    fn split_partitions_every_sample() {
        let dir = tempdir().unwrap();
        let path = write_sample(dir.path(), "s.npz", 10, 10);
        let record = read_record(&path, "val", "label", &Device::Cpu).unwrap();
        let ds = Dataset::from_records(vec![(path, record)], vec![], dir.path()).unwrap();
        assert_eq!(ds.features.dims(), &[10, 1, 6, 6]);
        let max = ds.features.max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(max, 1.0);

        let (train, test) = ds.split(0.2, 42).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 2);
    }

    #[test]
    fn single_sample_cannot_be_split() {
        let dir = tempdir().unwrap();
        let path = write_sample(dir.path(), "s.npz", 1, 1);
        let record = read_record(&path, "val", "label", &Device::Cpu).unwrap();
        let ds = Dataset::from_records(vec![(path, record)], vec![], dir.path()).unwrap();
        assert!(matches!(
            ds.split(0.2, 42),
            Err(DiagnosisError::DatasetTooSmall { .. })
        ));
    }
}
