//! Analysis orchestrator.
//! Drives one classification per `analyze` call and publishes every state
//! change through a single `watch` channel (latest value) and a `broadcast`
//! channel (ordered log). Each call owns a cancellation token; starting a new
//! call cancels the previous one so a late result can never overwrite newer state.

use image::DynamicImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::classifier::{ModelCache, ModelLoader, top_prediction};
use crate::error::AnalysisError;
use crate::image_source::PickOutcome;
use crate::preprocess::{InputSpec, to_pixel_buffer};
use crate::state::AnalysisState;

const EVENT_CAPACITY: usize = 64;

pub struct Analyzer {
    cache: ModelCache,
    input: InputSpec,
    state: watch::Sender<AnalysisState>,
    events: broadcast::Sender<AnalysisState>,
    current: Mutex<CancellationToken>,
    runs: AtomicU64,
}

impl Analyzer {
    pub fn new(loader: impl ModelLoader + 'static, input: InputSpec) -> Self {
        let (state, _) = watch::channel(AnalysisState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            cache: ModelCache::new(loader),
            input,
            state,
            events,
            current: Mutex::new(CancellationToken::new()),
            runs: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AnalysisState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AnalysisState> {
        self.events.subscribe()
    }

    pub fn state(&self) -> AnalysisState {
        self.state.borrow().clone()
    }

    /// Classifies `bitmap` and publishes the outcome. Never returns an error:
    /// every failure becomes a published `Failed` state.
    pub async fn analyze(&self, bitmap: Option<&DynamicImage>) {
        let token = self.supersede();
        let run = self.runs.fetch_add(1, Ordering::Relaxed) + 1;

        let outcome = self
            .run_analysis(bitmap, &token)
            .instrument(info_span!("analysis", run))
            .await;

        match outcome {
            Some(terminal) => {
                debug_assert!(terminal.is_terminal());
                info!(run, outcome = %terminal, "Analysis finished");
                if !self.publish(&token, terminal) {
                    debug!(run, "Result dropped, analysis was superseded");
                }
            }
            None => debug!(run, "Analysis cancelled"),
        }
    }

    /// Returns the terminal state, or `None` when the call was superseded.
    async fn run_analysis(
        &self,
        bitmap: Option<&DynamicImage>,
        token: &CancellationToken,
    ) -> Option<AnalysisState> {
        let Some(bitmap) = bitmap else {
            warn!("No image selected");
            return Some(AnalysisState::Failed(AnalysisError::NoImageSelected));
        };

        let bitmap = bitmap.clone();
        let spec = self.input.clone();
        let conversion = tokio::task::spawn_blocking(move || to_pixel_buffer(&bitmap, &spec));
        let input = tokio::select! {
            _ = token.cancelled() => return None,
            converted = conversion => match converted {
                Ok(Ok(input)) => input,
                Ok(Err(e)) => return Some(AnalysisState::Failed(e)),
                Err(e) => {
                    warn!("Conversion worker failed: {}", e);
                    return Some(AnalysisState::Failed(AnalysisError::ImageConversionFailed));
                }
            },
        };

        self.publish(token, AnalysisState::Running);
        debug!("Starting image analysis");

        let model = tokio::select! {
            _ = token.cancelled() => return None,
            loaded = self.cache.get_or_load() => match loaded {
                Ok(model) => model,
                Err(e) => {
                    warn!("Model load failed: {}", e);
                    return Some(AnalysisState::Failed(AnalysisError::ModelLoadFailed(e.to_string())));
                }
            },
        };

        let job = tokio::task::spawn_blocking(move || model.classify(input));
        let joined = tokio::select! {
            _ = token.cancelled() => return None,
            joined = job => joined,
        };

        let predictions = match joined {
            Ok(Ok(predictions)) => predictions,
            Ok(Err(e)) => {
                warn!("Classifier failed: {}", e);
                return Some(AnalysisState::Failed(AnalysisError::ClassifierFailed(e.to_string())));
            }
            Err(e) => {
                warn!("Classifier worker failed: {}", e);
                return Some(AnalysisState::Failed(AnalysisError::ClassifierFailed(format!(
                    "worker task failed: {}",
                    e
                ))));
            }
        };

        debug!(count = predictions.len(), "Processing results");
        match top_prediction(&predictions) {
            Some(top) => Some(AnalysisState::Succeeded {
                label: top.label.clone(),
                confidence: top.confidence,
            }),
            None => Some(AnalysisState::Failed(AnalysisError::EmptyPredictions)),
        }
    }

    /// Supersedes any in-flight analysis and publishes `Selecting`.
    /// Returns the state to restore if the pick does not change anything.
    pub fn begin_selection(&self) -> AnalysisState {
        let token = self.supersede();
        let previous = match self.state() {
            // The superseded run will never publish its result.
            AnalysisState::Running | AnalysisState::Selecting => AnalysisState::Idle,
            other => other,
        };
        self.publish(&token, AnalysisState::Selecting);
        previous
    }

    pub fn finish_selection(&self, previous: AnalysisState, outcome: &PickOutcome) {
        let token = self.current_token();
        let next = match outcome {
            PickOutcome::Selected(_) | PickOutcome::Cancelled => previous,
            PickOutcome::Failed(reason) => {
                AnalysisState::Failed(AnalysisError::ImageUnreadable(reason.clone()))
            }
        };
        self.publish(&token, next);
    }

    /// Drops any in-flight analysis; its result will not be published.
    pub fn cancel(&self) {
        self.lock_current().cancel();
    }

    /// Cancels any in-flight analysis and returns to `Idle`.
    pub fn reset(&self) {
        let token = self.supersede();
        self.publish(&token, AnalysisState::Idle);
    }

    /// Forgets the cached classifier; the next analysis loads it again.
    pub async fn reset_model(&self) {
        self.cache.reset().await;
    }

    fn supersede(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut current = self.lock_current();
        current.cancel();
        *current = token.clone();
        token
    }

    fn current_token(&self) -> CancellationToken {
        self.lock_current().clone()
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The token is checked under the channel's write lock, so a cancelled
    /// call cannot slip a publish in after its successor.
    fn publish(&self, token: &CancellationToken, next: AnalysisState) -> bool {
        self.state.send_if_modified(|state| {
            if token.is_cancelled() {
                return false;
            }
            let _ = self.events.send(next.clone());
            *state = next;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, Prediction};
    use crate::error::ClassifierError;
    use crate::image_source::Selection;
    use crate::preprocess::PixelBuffer;
    use async_trait::async_trait;
    use image::{Rgb, RgbImage};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Scripted {
        reply: Result<Vec<Prediction>, String>,
        calls: Arc<AtomicUsize>,
    }

    impl Classifier for Scripted {
        fn classify(&self, _input: PixelBuffer) -> Result<Vec<Prediction>, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(ClassifierError::Inference)
        }
    }

    struct ScriptedLoader {
        reply: Result<Vec<Prediction>, String>,
        load_error: Option<String>,
        loads: Arc<AtomicUsize>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedLoader {
        fn replying(reply: Result<Vec<Prediction>, String>) -> Self {
            Self {
                reply,
                load_error: None,
                loads: Arc::new(AtomicUsize::new(0)),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl ModelLoader for ScriptedLoader {
        async fn load(&self) -> Result<Arc<dyn Classifier>, ClassifierError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(msg) = &self.load_error {
                return Err(ClassifierError::Unavailable(msg.clone()));
            }
            Ok(Arc::new(Scripted {
                reply: self.reply.clone(),
                calls: Arc::clone(&self.calls),
            }))
        }
    }

    /// Blocks on the gate for dark images, answers immediately for bright ones.
    struct Gated {
        gate: std::sync::Mutex<mpsc::Receiver<()>>,
    }

    impl Classifier for Gated {
        fn classify(&self, input: PixelBuffer) -> Result<Vec<Prediction>, ClassifierError> {
            if input[[0, 0, 0, 0]] > 0.0 {
                return Ok(vec![Prediction::new("fresh", 0.9)]);
            }
            let gate = self.gate.lock().map_err(|e| ClassifierError::Inference(e.to_string()))?;
            let _ = gate.recv();
            Ok(vec![Prediction::new("stale", 0.99)])
        }
    }

    struct GatedLoader(Arc<Gated>);

    #[async_trait]
    impl ModelLoader for GatedLoader {
        async fn load(&self) -> Result<Arc<dyn Classifier>, ClassifierError> {
            Ok(self.0.clone())
        }
    }

    fn small_spec() -> InputSpec {
        InputSpec {
            size: 16,
            ..InputSpec::default()
        }
    }

    fn board_image(shade: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb([shade, shade, shade])))
    }

    fn drain(rx: &mut broadcast::Receiver<AnalysisState>) -> Vec<AnalysisState> {
        let mut log = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(state) => log.push(state),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return log,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_no_image_selected() {
        let loader = ScriptedLoader::replying(Ok(vec![Prediction::new("x", 1.0)]));
        let calls = Arc::clone(&loader.calls);
        let loads = Arc::clone(&loader.loads);
        let analyzer = Analyzer::new(loader, small_spec());
        let mut events = analyzer.subscribe_events();

        analyzer.analyze(None).await;

        assert_eq!(analyzer.state().to_string(), "Please select an image first.");
        assert_eq!(
            drain(&mut events),
            vec![AnalysisState::Failed(AnalysisError::NoImageSelected)]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_top_prediction_published() {
        let loader = ScriptedLoader::replying(Ok(vec![
            Prediction::new("white_king_e1", 0.97),
            Prediction::new("black_queen_d8", 0.81),
        ]));
        let analyzer = Analyzer::new(loader, small_spec());
        let mut events = analyzer.subscribe_events();

        analyzer.analyze(Some(&board_image(128))).await;

        assert_eq!(analyzer.state().to_string(), "white_king_e1: 97.00%");
        let log = drain(&mut events);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], AnalysisState::Running);
        assert!(log[1].is_terminal());
    }

    #[tokio::test]
    async fn test_classifier_error_published() {
        let loader = ScriptedLoader::replying(Err("model unavailable".into()));
        let analyzer = Analyzer::new(loader, small_spec());

        let mut events = analyzer.subscribe_events();

        analyzer.analyze(Some(&board_image(128))).await;

        assert_eq!(
            analyzer.state().to_string(),
            "Vision request failed: model unavailable"
        );
        assert_eq!(
            drain(&mut events),
            vec![
                AnalysisState::Running,
                AnalysisState::Failed(AnalysisError::ClassifierFailed("model unavailable".into()))
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_predictions() {
        let loader = ScriptedLoader::replying(Ok(vec![]));
        let analyzer = Analyzer::new(loader, small_spec());
        let mut events = analyzer.subscribe_events();

        analyzer.analyze(Some(&board_image(128))).await;

        assert_eq!(analyzer.state().to_string(), "No predictions returned.");
        assert_eq!(
            drain(&mut events),
            vec![
                AnalysisState::Running,
                AnalysisState::Failed(AnalysisError::EmptyPredictions)
            ]
        );
    }

    #[tokio::test]
    async fn test_model_load_failure() {
        let mut loader = ScriptedLoader::replying(Ok(vec![]));
        loader.load_error = Some("no such file".into());
        let calls = Arc::clone(&loader.calls);
        let analyzer = Analyzer::new(loader, small_spec());
        let mut events = analyzer.subscribe_events();

        analyzer.analyze(Some(&board_image(128))).await;

        assert_eq!(
            analyzer.state().to_string(),
            "Error: Model unavailable: no such file"
        );
        assert_eq!(
            drain(&mut events),
            vec![
                AnalysisState::Running,
                AnalysisState::Failed(AnalysisError::ModelLoadFailed(
                    "Model unavailable: no such file".into()
                ))
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_conversion_failure_skips_classifier() {
        let loader = ScriptedLoader::replying(Ok(vec![Prediction::new("x", 1.0)]));
        let calls = Arc::clone(&loader.calls);
        let analyzer = Analyzer::new(loader, small_spec());
        let mut events = analyzer.subscribe_events();

        analyzer.analyze(Some(&DynamicImage::new_rgb8(0, 0))).await;

        assert_eq!(
            drain(&mut events),
            vec![AnalysisState::Failed(AnalysisError::ImageConversionFailed)]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_image_skips_classifier() {
        let loader = ScriptedLoader::replying(Ok(vec![Prediction::new("x", 1.0)]));
        let calls = Arc::clone(&loader.calls);
        let loads = Arc::clone(&loader.loads);
        let analyzer = Analyzer::new(loader, InputSpec::default());
        let mut events = analyzer.subscribe_events();

        analyzer.analyze(Some(&DynamicImage::ImageRgb8(RgbImage::new(16_385, 1)))).await;

        assert_eq!(analyzer.state().to_string(), "Unable to process the image.");
        assert_eq!(
            drain(&mut events),
            vec![AnalysisState::Failed(AnalysisError::ImageConversionFailed)]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sliver_image_is_classified() {
        let loader = ScriptedLoader::replying(Ok(vec![Prediction::new("empty_board", 0.5)]));
        let calls = Arc::clone(&loader.calls);
        let analyzer = Analyzer::new(loader, InputSpec::default());

        analyzer.analyze(Some(&DynamicImage::ImageRgb8(RgbImage::new(1, 16_384)))).await;

        assert_eq!(analyzer.state().to_string(), "empty_board: 50.00%");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_model_loaded_once_across_calls() {
        let loader = ScriptedLoader::replying(Ok(vec![Prediction::new("x", 0.5)]));
        let loads = Arc::clone(&loader.loads);
        let calls = Arc::clone(&loader.calls);
        let analyzer = Analyzer::new(loader, small_spec());

        analyzer.analyze(Some(&board_image(10))).await;
        analyzer.analyze(Some(&board_image(20))).await;
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        analyzer.reset_model().await;
        analyzer.analyze(Some(&board_image(30))).await;
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_superseded_result_is_dropped() {
        let (gate_tx, gate_rx) = mpsc::channel();
        let gated = Arc::new(Gated {
            gate: std::sync::Mutex::new(gate_rx),
        });
        let analyzer = Arc::new(Analyzer::new(GatedLoader(gated), small_spec()));
        let mut events = analyzer.subscribe_events();

        let first = {
            let analyzer = Arc::clone(&analyzer);
            tokio::spawn(async move {
                let dark = board_image(0);
                analyzer.analyze(Some(&dark)).await;
            })
        };
        assert_eq!(events.recv().await.unwrap(), AnalysisState::Running);

        analyzer.analyze(Some(&board_image(255))).await;
        assert_eq!(analyzer.state().to_string(), "fresh: 90.00%");

        gate_tx.send(()).unwrap();
        first.await.unwrap();

        assert_eq!(analyzer.state().to_string(), "fresh: 90.00%");
        let log = drain(&mut events);
        assert!(log.iter().all(|s| !s.to_string().starts_with("stale")));
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let loader = ScriptedLoader::replying(Ok(vec![Prediction::new("x", 0.5)]));
        let analyzer = Analyzer::new(loader, small_spec());
        analyzer.analyze(None).await;

        analyzer.reset();
        assert_eq!(analyzer.state(), AnalysisState::Idle);
    }

    #[tokio::test]
    async fn test_selection_states() {
        let loader = ScriptedLoader::replying(Ok(vec![]));
        let analyzer = Analyzer::new(loader, small_spec());
        analyzer.analyze(None).await;
        let before = analyzer.state();

        let previous = analyzer.begin_selection();
        assert_eq!(analyzer.state(), AnalysisState::Selecting);
        analyzer.finish_selection(previous, &PickOutcome::Cancelled);
        assert_eq!(analyzer.state(), before);

        let previous = analyzer.begin_selection();
        analyzer.finish_selection(
            previous.clone(),
            &PickOutcome::Selected(Selection {
                image: board_image(1),
                origin: "board.png".into(),
            }),
        );
        assert_eq!(analyzer.state(), before);

        let previous = analyzer.begin_selection();
        analyzer.finish_selection(previous, &PickOutcome::Failed("bad header".into()));
        assert_eq!(
            analyzer.state().to_string(),
            "Unable to read the selected image: bad header"
        );
    }

    #[tokio::test]
    async fn test_watch_receiver_sees_latest() {
        let loader = ScriptedLoader::replying(Ok(vec![Prediction::new("empty_board", 0.8)]));
        let analyzer = Analyzer::new(loader, small_spec());
        let rx = analyzer.subscribe();
        assert_eq!(*rx.borrow(), AnalysisState::Idle);

        analyzer.analyze(Some(&board_image(128))).await;
        assert_eq!(rx.borrow().to_string(), "empty_board: 80.00%");
    }
}
