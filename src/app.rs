//! Terminal front end.
//! `App` owns the selected bitmap (the "preview") and wires the image source to
//! the analyzer; `OutputView` renders every published state in order.

use image::GenericImageView;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::watch;
use tracing::warn;

use crate::analyzer::Analyzer;
use crate::image_source::{ImageSource, PickOutcome, Selection};
use crate::state::AnalysisState;

pub struct App {
    analyzer: Arc<Analyzer>,
    source: Box<dyn ImageSource>,
    selected: Option<Selection>,
    output: watch::Receiver<AnalysisState>,
}

impl App {
    pub fn new(analyzer: Arc<Analyzer>, source: Box<dyn ImageSource>) -> Self {
        let output = analyzer.subscribe();
        Self {
            analyzer,
            source,
            selected: None,
            output,
        }
    }

    /// Opens the source. Cancelling or failing keeps the previous selection.
    pub async fn select_image(&mut self) {
        let previous = self.analyzer.begin_selection();
        let outcome = self.source.pick_image().await;
        self.analyzer.finish_selection(previous, &outcome);
        if let PickOutcome::Selected(selection) = outcome {
            self.selected = Some(selection);
        }
    }

    pub async fn analyze(&self) {
        self.analyzer
            .analyze(self.selected.as_ref().map(|s| &s.image))
            .await;
    }

    pub fn preview(&self) -> String {
        match &self.selected {
            Some(selection) => {
                let (w, h) = selection.image.dimensions();
                format!("{} ({}x{})", selection.origin, w, h)
            }
            None => "No Image Selected".to_string(),
        }
    }

    pub fn state(&self) -> AnalysisState {
        self.output.borrow().clone()
    }

    /// Clears the output and forgets the loaded model.
    pub async fn reset(&self) {
        self.analyzer.reset();
        self.analyzer.reset_model().await;
    }

    /// Abandons any in-flight analysis, e.g. on exit.
    pub fn close(&self) {
        self.analyzer.cancel();
    }
}

pub struct OutputView {
    events: broadcast::Receiver<AnalysisState>,
}

impl OutputView {
    pub fn new(analyzer: &Analyzer) -> Self {
        Self {
            events: analyzer.subscribe_events(),
        }
    }

    /// Drives `action` to completion, printing states as they are published.
    pub async fn follow<F: Future<Output = ()>>(&mut self, action: F) {
        tokio::pin!(action);
        loop {
            tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Ok(state) => render(&state),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Output view fell behind"),
                    Err(RecvError::Closed) => {
                        (&mut action).await;
                        break;
                    }
                },
                _ = &mut action => break,
            }
        }
        self.flush();
    }

    fn flush(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(state) => render(&state),
                Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "Output view fell behind"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

fn render(state: &AnalysisState) {
    println!("Analysis Output: {}", state);
}
