//! Image sources.
//! A source yields one decoded bitmap per pick, and reports cancellation and
//! decode failure as different outcomes.
//! - `PromptSource`: asks for a file path on the terminal (dialoguer).
//! - `PathSource`: a fixed path, for non-interactive runs.
//! - `ScreenSource` (feature `screen-capture`): primary monitor via xcap.

use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Selection {
    pub image: DynamicImage,
    /// Where the image came from, for display.
    pub origin: String,
}

#[derive(Debug)]
pub enum PickOutcome {
    Selected(Selection),
    Cancelled,
    Failed(String),
}

#[async_trait]
pub trait ImageSource: Send {
    async fn pick_image(&mut self) -> PickOutcome;
}

/// Decodes an image file, sniffing the format from its contents.
pub fn decode_file(path: &Path) -> PickOutcome {
    let decoded = ImageReader::open(path)
        .map_err(|e| format!("failed to open {}: {}", path.display(), e))
        .and_then(|reader| {
            reader
                .with_guessed_format()
                .map_err(|e| format!("failed to read {}: {}", path.display(), e))
        })
        .and_then(|reader| {
            reader
                .decode()
                .map_err(|e| format!("failed to decode {}: {}", path.display(), e))
        });

    match decoded {
        Ok(image) => {
            let (w, h) = image.dimensions();
            info!("Selected {} ({}x{})", path.display(), w, h);
            PickOutcome::Selected(Selection {
                image,
                origin: path.display().to_string(),
            })
        }
        Err(reason) => PickOutcome::Failed(reason),
    }
}

async fn decode_file_blocking(path: PathBuf) -> PickOutcome {
    tokio::task::spawn_blocking(move || decode_file(&path))
        .await
        .unwrap_or_else(|e| PickOutcome::Failed(format!("image decoding task failed: {}", e)))
}

pub struct PathSource {
    path: PathBuf,
}

impl PathSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ImageSource for PathSource {
    async fn pick_image(&mut self) -> PickOutcome {
        decode_file_blocking(self.path.clone()).await
    }
}

/// Terminal picker. An empty answer cancels.
#[derive(Default)]
pub struct PromptSource {
    last_path: Option<String>,
}

impl PromptSource {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageSource for PromptSource {
    async fn pick_image(&mut self) -> PickOutcome {
        let initial = self.last_path.clone();
        let answer = tokio::task::spawn_blocking(move || {
            let mut input = dialoguer::Input::<String>::new()
                .with_prompt("Path to chessboard image (empty to cancel)")
                .allow_empty(true);
            if let Some(initial) = initial {
                input = input.with_initial_text(initial);
            }
            input.interact_text()
        })
        .await;

        let path = match answer {
            Ok(Ok(path)) => path.trim().to_string(),
            Ok(Err(e)) => return PickOutcome::Failed(format!("image picker unavailable: {}", e)),
            Err(e) => return PickOutcome::Failed(format!("image picker task failed: {}", e)),
        };

        if path.is_empty() {
            debug!("Image selection cancelled");
            return PickOutcome::Cancelled;
        }

        self.last_path = Some(path.clone());
        decode_file_blocking(PathBuf::from(path)).await
    }
}

#[cfg(feature = "screen-capture")]
pub use screen::ScreenSource;

#[cfg(feature = "screen-capture")]
mod screen {
    use super::{ImageSource, PickOutcome, Selection};
    use anyhow::{Context, Result, bail};
    use async_trait::async_trait;
    use image::{DynamicImage, GenericImageView};
    use std::time::Instant;
    use tracing::debug;
    use xcap::Monitor;

    /// Captures the primary monitor, optionally cropped to `(x, y, width, height)`.
    /// On macOS the terminal needs the Screen Recording permission.
    pub struct ScreenSource {
        bounds: Option<[u32; 4]>,
    }

    impl ScreenSource {
        pub fn new(bounds: Option<[u32; 4]>) -> Self {
            Self { bounds }
        }
    }

    #[async_trait]
    impl ImageSource for ScreenSource {
        async fn pick_image(&mut self) -> PickOutcome {
            let bounds = self.bounds;
            match tokio::task::spawn_blocking(move || capture(bounds)).await {
                Ok(Ok(image)) => PickOutcome::Selected(Selection {
                    image,
                    origin: "screen capture".to_string(),
                }),
                Ok(Err(e)) => PickOutcome::Failed(format!("{:#}", e)),
                Err(e) => PickOutcome::Failed(format!("screen capture task failed: {}", e)),
            }
        }
    }

    fn capture(bounds: Option<[u32; 4]>) -> Result<DynamicImage> {
        let start = Instant::now();

        let monitors = Monitor::all().context("Failed to enumerate monitors")?;
        let primary = monitors.first().cloned().context("No monitors found")?;
        let raw = primary
            .capture_image()
            .context("Failed to capture screen; check Screen Recording permission")?;

        let screenshot = DynamicImage::ImageRgba8(raw);
        let (screen_w, screen_h) = screenshot.dimensions();
        if (screen_w, screen_h) == (0, 0) {
            bail!("Captured empty screenshot - possible permission issue or no display");
        }

        let image = match bounds {
            None => screenshot,
            Some([x, y, w, h]) => {
                if x.saturating_add(w) > screen_w || y.saturating_add(h) > screen_h {
                    bail!(
                        "Crop bounds ({},{},{},{}) exceed screenshot dimensions {}x{}",
                        x, y, w, h, screen_w, screen_h
                    );
                }
                screenshot.crop_imm(x, y, w, h)
            }
        };

        debug!("Capture latency: {:?}", start.elapsed());
        Ok(image)
    }

}
