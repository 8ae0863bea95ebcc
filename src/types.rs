use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::labels::Labels;
use crate::postprocess::Ranking;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSpec {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl InputSpec {
    /// Checks an NCHW tensor shape against the model input.
    pub fn validate(&self, shape: &[usize]) -> anyhow::Result<()> {
        anyhow::ensure!(shape.len() == 4, "input must be 4D (NCHW), got {:?}", shape);
        anyhow::ensure!(shape[0] == self.batch, "batch size mismatch: {:?}", shape);
        anyhow::ensure!(shape[1] == self.channels, "channel mismatch: {:?}", shape);
        anyhow::ensure!(
            shape[2] == self.height && shape[3] == self.width,
            "H/W mismatch: expected {}x{}, got {:?}",
            self.height,
            self.width,
            shape
        );
        Ok(())
    }

    pub fn shape(&self) -> [usize; 4] {
        [self.batch, self.channels, self.height, self.width]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelCfg {
    pub backend: String,
    pub model_path: PathBuf,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub input_name: Option<String>,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_intra_threads() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    #[default]
    Nearest,
    Triangle,
    CatmullRom,
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputCfg {
    #[serde(default = "default_side")]
    pub height: usize,
    #[serde(default = "default_side")]
    pub width: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
    #[serde(default)]
    pub resize_filter: ResizeFilter,
}

fn default_side() -> usize {
    256
}

fn default_channels() -> usize {
    3
}

fn default_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

impl Default for InputCfg {
    fn default() -> Self {
        Self {
            height: default_side(),
            width: default_side(),
            channels: default_channels(),
            mean: default_mean(),
            std: default_std(),
            resize_filter: ResizeFilter::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelsCfg {
    pub path: PathBuf,
    #[serde(default = "default_unknown")]
    pub unknown: String,
}

fn default_unknown() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputCfg {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    3
}

impl Default for OutputCfg {
    fn default() -> Self {
        Self { top_k: default_top_k() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamCfg {
    pub frames_dir: PathBuf,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub max_frames: Option<usize>,
}

fn default_interval_ms() -> u64 {
    33
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub model: ModelCfg,
    #[serde(default)]
    pub input: InputCfg,
    pub labels: LabelsCfg,
    #[serde(default)]
    pub output: OutputCfg,
    #[serde(default)]
    pub stream: Option<StreamCfg>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        let cfg: Config = toml::from_str(&text)
            .with_context(|| format!("invalid config {}", path.display()))?;
        anyhow::ensure!(cfg.input.channels == 3, "only 3-channel input is supported");
        anyhow::ensure!(cfg.input.height > 0 && cfg.input.width > 0, "input size must be non-zero");
        anyhow::ensure!(
            cfg.input.std.iter().all(|s| *s != 0.0),
            "normalization std must be non-zero"
        );
        anyhow::ensure!(cfg.output.top_k > 0, "top_k must be at least 1");
        Ok(cfg)
    }

    pub fn input_spec(&self) -> InputSpec {
        InputSpec {
            batch: 1,
            channels: self.input.channels,
            height: self.input.height,
            width: self.input.width,
        }
    }
}

// Frames

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Borrowed interleaved pixels handed to the preprocessor.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub rotation_degrees: i32,
}

/// A frame on loan from a frame source.
///
/// The source's release hook runs exactly once, when the frame is dropped.
pub struct RawFrame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    rotation_degrees: i32,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl RawFrame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, format: PixelFormat, rotation_degrees: i32) -> Self {
        Self { pixels, width, height, format, rotation_degrees, release: None }
    }

    pub fn from_rgb(image: image::RgbImage, rotation_degrees: i32) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height, PixelFormat::Rgb8, rotation_degrees)
    }

    pub fn with_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            pixels: &self.pixels,
            width: self.width,
            height: self.height,
            format: self.format,
            rotation_degrees: self.rotation_degrees,
        }
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("rotation_degrees", &self.rotation_degrees)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

// Results

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameOrigin {
    Stream,
    Still,
}

/// Ranked classes for one frame. Scores are softmax probabilities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    indices: Vec<usize>,
    scores: Vec<f32>,
    processing_time_ms: u64,
    origin: FrameOrigin,
}

impl AnalysisResult {
    pub(crate) fn new(ranking: Ranking, processing_time_ms: u64, origin: FrameOrigin) -> Self {
        Self {
            indices: ranking.indices,
            scores: ranking.scores,
            processing_time_ms,
            origin,
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn processing_time_ms(&self) -> u64 {
        self.processing_time_ms
    }

    pub fn origin(&self) -> FrameOrigin {
        self.origin
    }

    pub fn ranked<'a>(&self, labels: &'a Labels) -> Vec<(&'a str, f32)> {
        self.indices
            .iter()
            .zip(&self.scores)
            .map(|(&idx, &score)| (labels.get(idx), score))
            .collect()
    }

    /// Top label with its confidence, e.g. `"cat (97.3%)"`.
    pub fn headline(&self, labels: &Labels) -> String {
        let score = self.scores.first().copied().unwrap_or(0.0);
        let label = match self.indices.first() {
            Some(&idx) => labels.get(idx),
            None => labels.unknown(),
        };
        format!("{} ({:.1}%)", label, score * 100.0)
    }
}
