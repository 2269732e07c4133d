//! Published analysis state.

use std::fmt;

use crate::classifier::format_confidence;
use crate::error::AnalysisError;

#[derive(Clone, Debug, Default, PartialEq)]
pub enum AnalysisState {
    #[default]
    Idle,
    /// An image picker is open.
    Selecting,
    Running,
    Succeeded {
        label: String,
        confidence: f32,
    },
    Failed(AnalysisError),
}

impl AnalysisState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisState::Succeeded { .. } | AnalysisState::Failed(_))
    }
}

impl fmt::Display for AnalysisState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisState::Idle => write!(f, "Model predictions will appear here."),
            AnalysisState::Selecting => write!(f, "Selecting an image..."),
            AnalysisState::Running => write!(f, "Analyzing the image..."),
            AnalysisState::Succeeded { label, confidence } => {
                write!(f, "{}: {}%", label, format_confidence(*confidence))
            }
            AnalysisState::Failed(err) => write!(f, "{}", err),
        }
    }
}
