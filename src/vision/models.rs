//! Digit classifier models
//!
//! The classifier is loaded once at startup and shared read-only between
//! grading requests. ONNX Runtime sessions need `&mut` to run, so each
//! session sits behind a mutex.

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

use crate::config::ClassifierOutput;
use crate::error::GradeError;

/// Number of classes: digits 0-9
pub const NUM_CLASSES: usize = 10;

/// Ten-class digit classifier
pub trait DigitClassifier: Send + Sync {
    /// Class scores for a (1, 1, S, S) glyph tensor in [0, 1] with ink = 1.
    ///
    /// Scores are logits; the recognizer applies the softmax.
    fn classify(&self, input: &Array4<f32>) -> Result<[f32; NUM_CLASSES]>;
}

/// SHA256 hex digest of a model file
pub fn model_fingerprint(path: &Path) -> Result<String> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read model {:?}", path))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

/// ONNX Runtime digit classifier
pub struct OnnxDigitClassifier {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    output_kind: ClassifierOutput,
}

impl OnnxDigitClassifier {
    /// Load a classifier; any failure is `ModelUnavailable`
    pub fn load(model_path: &Path, intra_threads: usize, output_kind: ClassifierOutput) -> Result<Self, GradeError> {
        Self::try_load(model_path, intra_threads, output_kind)
            .map_err(|e| GradeError::ModelUnavailable(format!("{:?}: {:#}", model_path, e)))
    }

    fn try_load(model_path: &Path, intra_threads: usize, output_kind: ClassifierOutput) -> Result<Self> {
        if !model_path.is_file() {
            bail!("model file not found");
        }
        info!("Loading digit classifier from {:?}", model_path);

        let fingerprint = model_fingerprint(model_path)?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads.max(1))?
            .commit_from_file(model_path)
            .context("Failed to load ONNX model")?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .context("model has no inputs")?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .context("model has no outputs")?;

        info!(
            "Classifier loaded. Input: {:?}, Output: {:?} ({:?}), sha256: {}",
            input_name, output_name, output_kind, fingerprint
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            output_kind,
        })
    }
}

impl DigitClassifier for OnnxDigitClassifier {
    fn classify(&self, input: &Array4<f32>) -> Result<[f32; NUM_CLASSES]> {
        let tensor = TensorRef::from_array_view(input.view()).context("Failed to convert input tensor")?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .context("Classifier inference failed")?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .context("Failed to extract classifier output")?;
        debug!("Classifier output shape: {:?}", shape);

        to_scores(data, self.output_kind)
    }
}

/// Normalize a raw output row to logits.
///
/// Models exported with a trailing softmax produce probabilities; their log is
/// an equivalent logit vector.
fn to_scores(data: &[f32], kind: ClassifierOutput) -> Result<[f32; NUM_CLASSES]> {
    if data.len() != NUM_CLASSES {
        bail!("expected {} class scores, got {}", NUM_CLASSES, data.len());
    }
    if data.iter().any(|v| !v.is_finite()) {
        bail!("classifier produced non-finite scores");
    }

    let mut scores = [0f32; NUM_CLASSES];
    scores.copy_from_slice(data);

    if kind == ClassifierOutput::Probabilities {
        if scores.iter().any(|v| *v < 0.0) {
            bail!("probability output contains negative values");
        }
        for v in scores.iter_mut() {
            *v = v.max(1e-12).ln();
        }
    }
    Ok(scores)
}

/// Softmax over class scores: (argmax class, its probability)
pub fn softmax_top(scores: &[f32; NUM_CLASSES]) -> (usize, f32) {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();

    let (class, top) = exps
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &e)| if e > best.1 { (i, e) } else { best });
    (class, top / sum)
}
