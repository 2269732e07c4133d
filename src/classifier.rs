//! Classifier boundary.
//! `Classifier` runs one forward pass; `ModelLoader` produces one; `ModelCache`
//! keeps the loaded handle for the lifetime of the process until `reset`.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ClassifierError;
use crate::preprocess::PixelBuffer;

#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidence: f32,
}

impl Prediction {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// A loaded model. `classify` is blocking and is called from a worker thread.
pub trait Classifier: Send + Sync {
    fn classify(&self, input: PixelBuffer) -> Result<Vec<Prediction>, ClassifierError>;
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn Classifier>, ClassifierError>;
}

/// Init-once holder for the classifier handle. Failed loads are not cached.
pub struct ModelCache {
    loader: Box<dyn ModelLoader>,
    model: Mutex<Option<Arc<dyn Classifier>>>,
}

impl ModelCache {
    pub fn new(loader: impl ModelLoader + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            model: Mutex::new(None),
        }
    }

    pub async fn get_or_load(&self) -> Result<Arc<dyn Classifier>, ClassifierError> {
        // Held across the load so concurrent callers wait for one load.
        let mut slot = self.model.lock().await;
        if let Some(model) = slot.as_ref() {
            debug!("Using cached classifier");
            return Ok(Arc::clone(model));
        }

        let model = self.loader.load().await?;
        info!("Classifier loaded");
        *slot = Some(Arc::clone(&model));
        Ok(model)
    }

    pub async fn reset(&self) {
        if self.model.lock().await.take().is_some() {
            info!("Classifier cache cleared");
        }
    }
}

/// First maximal element by scan order. A NaN confidence never beats a number.
pub fn top_prediction(predictions: &[Prediction]) -> Option<&Prediction> {
    let mut iter = predictions.iter();
    let mut best = iter.next()?;
    for candidate in iter {
        if candidate.confidence > best.confidence
            || (best.confidence.is_nan() && !candidate.confidence.is_nan())
        {
            best = candidate;
        }
    }
    Some(best)
}

/// Formats a confidence in [0, 1] as a percentage with exactly two decimals,
/// rounding half away from zero.
pub fn format_confidence(confidence: f32) -> String {
    let hundredths = (f64::from(confidence) * 10_000.0).round() as i64;
    let sign = if hundredths < 0 { "-" } else { "" };
    let abs = hundredths.abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}
