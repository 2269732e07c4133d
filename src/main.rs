mod analyzer;
mod app;
mod classifier;
mod config;
mod error;
mod image_source;
#[cfg(feature = "onnx")]
mod onnx;
mod preprocess;
mod state;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{Level, info};

use crate::analyzer::Analyzer;
use crate::app::{App, OutputView};
use crate::config::Config;
use crate::image_source::{ImageSource, PathSource, PromptSource};
use crate::state::AnalysisState;

const MENU: [&str; 4] = ["Select Image", "Analyze Image", "Reset", "Quit"];

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let matches = Command::new("chess-analyser")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Classifies chessboard photos with a bundled image model")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Config file (default: analyser_config.json if present)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("model")
                .long("model")
                .value_name("PATH")
                .help("ONNX model file")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("labels")
                .long("labels")
                .value_name("PATH")
                .help("JSON file with an id2label map")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("image")
                .long("image")
                .value_name("PATH")
                .help("Analyze this image once and exit")
                .value_parser(clap::value_parser!(PathBuf))
                .conflicts_with("screen"),
        )
        .arg(
            Arg::new("screen")
                .long("screen")
                .help("Analyze a capture of the primary monitor once and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("gpu")
                .long("gpu")
                .help("Try GPU execution providers before the CPU")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity (-v debug, -vv trace)")
                .action(ArgAction::Count),
        )
        .get_matches();

    let mut config = Config::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))
        .context("Failed to load configuration")?;
    if let Some(model) = matches.get_one::<PathBuf>("model") {
        config.model.model_path = model.clone();
    }
    if let Some(labels) = matches.get_one::<PathBuf>("labels") {
        config.model.labels_path = labels.clone();
    }
    if matches.get_flag("gpu") {
        config.model.use_gpu = true;
    }

    let level = match matches.get_count("verbose") {
        0 => config.level()?,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    info!(model = %config.model.model_path.display(), "Chess Position Analyzer starting");
    let analyzer = Arc::new(Analyzer::new(
        loader::for_config(&config.model),
        config.input.clone(),
    ));
    let mut view = OutputView::new(&analyzer);

    if let Some(path) = matches.get_one::<PathBuf>("image") {
        let app = App::new(Arc::clone(&analyzer), Box::new(PathSource::new(path)));
        return run_once(app, &mut view).await;
    }
    if matches.get_flag("screen") {
        let app = App::new(Arc::clone(&analyzer), screen_source(&config)?);
        return run_once(app, &mut view).await;
    }

    run_interactive(App::new(analyzer, Box::new(PromptSource::new())), &mut view).await
}

async fn run_once(mut app: App, view: &mut OutputView) -> Result<ExitCode> {
    view.follow(app.select_image()).await;
    view.follow(app.analyze()).await;

    Ok(match app.state() {
        AnalysisState::Succeeded { .. } => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

async fn run_interactive(mut app: App, view: &mut OutputView) -> Result<ExitCode> {
    println!("Chess Position Analyzer");
    println!("Analysis Output: {}", app.state());

    loop {
        println!("Image: {}", app.preview());
        let choice = tokio::task::spawn_blocking(|| {
            dialoguer::Select::new()
                .with_prompt("Choose an action")
                .items(&MENU)
                .default(0)
                .interact_opt()
        })
        .await
        .context("Menu task failed")?
        .context("Failed to read menu selection")?;

        match choice {
            Some(0) => view.follow(app.select_image()).await,
            Some(1) => view.follow(app.analyze()).await,
            Some(2) => view.follow(app.reset()).await,
            _ => break,
        }
    }

    app.close();

    Ok(ExitCode::SUCCESS)
}

#[cfg(feature = "screen-capture")]
fn screen_source(config: &Config) -> Result<Box<dyn ImageSource>> {
    Ok(Box::new(image_source::ScreenSource::new(config.capture.bounds)))
}

#[cfg(not(feature = "screen-capture"))]
fn screen_source(_config: &Config) -> Result<Box<dyn ImageSource>> {
    anyhow::bail!("--screen needs a build with the `screen-capture` feature")
}

#[cfg(feature = "onnx")]
mod loader {
    use crate::config::ModelConfig;
    use crate::onnx::OnnxLoader;

    pub fn for_config(config: &ModelConfig) -> OnnxLoader {
        OnnxLoader::from_config(config)
    }
}

#[cfg(not(feature = "onnx"))]
mod loader {
    use async_trait::async_trait;
    use std::sync::Arc;

    use crate::classifier::{Classifier, ModelLoader};
    use crate::config::ModelConfig;
    use crate::error::ClassifierError;

    /// Stands in when no inference backend is compiled; every load fails.
    pub struct NoBackend;

    #[async_trait]
    impl ModelLoader for NoBackend {
        async fn load(&self) -> Result<Arc<dyn Classifier>, ClassifierError> {
            Err(ClassifierError::Unavailable(
                "built without an inference backend (enable the `onnx` feature)".to_string(),
            ))
        }
    }

    pub fn for_config(_config: &ModelConfig) -> NoBackend {
        NoBackend
    }
}
