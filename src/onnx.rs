//! ONNX Runtime classifier backend (feature `onnx`).
//! Loads the model once per `ModelCache` lifetime; the session runs on a
//! blocking worker and is serialised behind a mutex.

use async_trait::async_trait;
use ort::session::Session;
use ort::session::builder::GraphOptimizationLevel;
use ort::value::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::classifier::{Classifier, ModelLoader, Prediction};
use crate::config::ModelConfig;
use crate::error::ClassifierError;
use crate::preprocess::PixelBuffer;

pub struct OnnxClassifier {
    session: Mutex<Session>,
    labels: Vec<String>,
    top_k: usize,
}

impl Classifier for OnnxClassifier {
    fn classify(&self, input: PixelBuffer) -> Result<Vec<Prediction>, ClassifierError> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| ClassifierError::Inference("model session poisoned".to_string()))?;

        let input_name =
            first_input_name(session.inputs().iter().map(|input| input.name().to_string()))?;
        let input_tensor = Value::from_array(input)
            .map_err(|e| ClassifierError::Inference(format!("Failed to create tensor value: {}", e)))?;
        let outputs = session
            .run(ort::inputs![input_name.as_str() => input_tensor])
            .map_err(|e| ClassifierError::Inference(format!("Inference failed: {}", e)))?;

        let output = outputs
            .values()
            .next()
            .ok_or_else(|| ClassifierError::Inference("Model produced no outputs".to_string()))?;
        let (_, logits) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::Inference(format!("Failed to extract output tensor: {}", e)))?;

        Ok(rank(&softmax(logits), &self.labels, self.top_k))
    }
}

pub struct OnnxLoader {
    model_path: PathBuf,
    labels_path: PathBuf,
    top_k: usize,
    use_gpu: bool,
    intra_threads: usize,
}

impl OnnxLoader {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            model_path: config.model_path.clone(),
            labels_path: config.labels_path.clone(),
            top_k: config.top_k,
            use_gpu: config.use_gpu,
            intra_threads: config.intra_threads,
        }
    }
}

#[async_trait]
impl ModelLoader for OnnxLoader {
    async fn load(&self) -> Result<Arc<dyn Classifier>, ClassifierError> {
        let labels_path = self.labels_path.clone();
        let labels = tokio::task::spawn_blocking(move || load_labels(&labels_path))
            .await
            .map_err(|e| ClassifierError::Unavailable(format!("label loading task failed: {}", e)))??;
        debug!(count = labels.len(), "Labels loaded");

        if !self.model_path.exists() {
            return Err(ClassifierError::Unavailable(format!(
                "model file {} not found",
                self.model_path.display()
            )));
        }

        let model_path = self.model_path.clone();
        let use_gpu = self.use_gpu;
        let intra_threads = self.intra_threads;
        let session = tokio::task::spawn_blocking(move || -> Result<Session, ClassifierError> {
            let _ = ort::init().with_name("chess-analyser").commit();

            let mut builder = Session::builder()
                .map_err(|e| unavailable("Failed to create session builder", e))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| unavailable("Failed to set optimization level", e))?
                .with_intra_threads(intra_threads)
                .map_err(|e| unavailable("Failed to set intra threads", e))?;

            if use_gpu {
                builder = builder.with_execution_providers([
                    ort::execution_providers::CoreMLExecutionProvider::default().build(),
                    ort::execution_providers::CUDAExecutionProvider::default().build(),
                    ort::execution_providers::CPUExecutionProvider::default().build(),
                ])
                .map_err(|e| unavailable("Failed to register execution providers", e))?;
            }

            builder
                .commit_from_file(&model_path)
                .map_err(|e| unavailable("Failed to load ONNX model", e))
        })
        .await
        .map_err(|e| ClassifierError::Unavailable(format!("model loading task failed: {}", e)))??;

        info!("Loaded ONNX model {}", self.model_path.display());
        Ok(Arc::new(OnnxClassifier {
            session: Mutex::new(session),
            labels,
            top_k: self.top_k,
        }))
    }
}

/// Reads labels from a JSON file whose `id2label` object maps indices to names.
fn load_labels(path: &Path) -> Result<Vec<String>, ClassifierError> {
    let content = std::fs::read_to_string(path).map_err(|source| ClassifierError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_labels(&content)
}

fn parse_labels(content: &str) -> Result<Vec<String>, ClassifierError> {
    let config: serde_json::Value =
        serde_json::from_str(content).map_err(|e| ClassifierError::Labels(e.to_string()))?;

    let id2label = config["id2label"]
        .as_object()
        .ok_or_else(|| ClassifierError::Labels("missing id2label field".to_string()))?;

    let mut labels = Vec::with_capacity(id2label.len());
    for (key, value) in id2label {
        let idx = key
            .parse::<usize>()
            .map_err(|_| ClassifierError::Labels(format!("non-numeric label index '{}'", key)))?;
        let label = value
            .as_str()
            .ok_or_else(|| ClassifierError::Labels(format!("label {} is not a string", idx)))?;
        labels.push((idx, label.to_string()));
    }
    labels.sort_by_key(|(idx, _)| *idx);
    if labels.iter().enumerate().any(|(pos, (idx, _))| pos != *idx) {
        return Err(ClassifierError::Labels("label indices are not contiguous from 0".to_string()));
    }

    Ok(labels.into_iter().map(|(_, label)| label).collect())
}

fn first_input_name(mut names: impl Iterator<Item = String>) -> Result<String, ClassifierError> {
    names
        .next()
        .ok_or_else(|| ClassifierError::Inference("Model declares no inputs".to_string()))
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> ClassifierError {
    ClassifierError::Unavailable(format!("{}: {}", context, err))
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp: Vec<f32> = logits.iter().map(|&x| (x - max_logit).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|x| x / sum).collect()
}

/// Sorts by descending probability and keeps `top_k` (0 keeps everything).
fn rank(probabilities: &[f32], labels: &[String], top_k: usize) -> Vec<Prediction> {
    let mut indexed: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    if top_k > 0 {
        indexed.truncate(top_k);
    }

    indexed
        .into_iter()
        .map(|(idx, confidence)| {
            match labels.get(idx) {
                Some(label) => Prediction::new(label.clone(), confidence),
                None => Prediction::new(format!("class_{}", idx), confidence),
            }
        })
        .collect()
}
