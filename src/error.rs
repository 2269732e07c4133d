//! Error types.
//! `AnalysisError` messages double as the text shown to the user, so the
//! `#[error]` strings here are the exact output of a failed analysis.

use thiserror::Error;

/// Terminal failures of one analysis (or one image pick).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Please select an image first.")]
    NoImageSelected,
    #[error("Unable to process the image.")]
    ImageConversionFailed,
    #[error("Error: {0}")]
    ModelLoadFailed(String),
    #[error("Vision request failed: {0}")]
    ClassifierFailed(String),
    #[error("No predictions returned.")]
    EmptyPredictions,
    #[error("Unable to read the selected image: {0}")]
    ImageUnreadable(String),
}

/// Errors raised by a classifier backend while loading or running a model.
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid label file: {0}")]
    Labels(String),
    #[error("Model unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Inference(String),
}
