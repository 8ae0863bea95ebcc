//! Image classification runtime.
//!
//! Frames (camera stream or picked stills) go through a fixed pipeline:
//! stretch-resize, rotate and normalize into a planar tensor, run the model on
//! a single worker that owns the engine, then softmax and top-k. The
//! [`AnalyzerHost`] owns that worker and publishes an [`Analyzer`] once the
//! engine is ready.
//!
//! # Modules
//!
//! * [`engine`] - Engine trait, ONNX and linear backends
//! * [`pipeline`], [`preprocess`], [`postprocess`] - Tensor in/out stages
//! * [`analyzer`] - Readiness, frame source swap and teardown
//! * [`source`] - Directory replay used by the CLI
//! * [`types`] - Configuration, frames and results

pub mod analyzer;
pub mod engine;
pub mod error;
pub mod labels;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod resources;
pub mod source;
pub mod types;
mod worker;

pub use crate::analyzer::{Analyzer, AnalyzerHost, Availability, FrameSource, HostSettings, ResultSink};
pub use crate::error::AnalyzerError;
pub use crate::worker::EngineLoader;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::labels::Labels;
use crate::source::{AnalyzerSlot, DirectoryReplay};
use crate::types::{AnalysisResult, Config};

/// Runs the classifier CLI: `imageclassifier-cli [config.toml] [image ...]`.
///
/// With image arguments each one is classified as a still image, otherwise
/// the configured frames directory is replayed as a stream.
///
/// # Returns
///
/// * `Ok(())` - All input handed to the analyzer and every result printed
/// * `Err(_)` - Config, labels or frames could not be loaded, or the engine
///   never became ready
pub async fn start_runtime() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let mut args = std::env::args().skip(1);
    let cfg_path = args.next().unwrap_or_else(|| "runtime.toml".to_string());
    let images: Vec<PathBuf> = args.map(PathBuf::from).collect();

    let cfg = Config::load(&cfg_path)?;
    let labels = Arc::new(Labels::load(&cfg.labels.path, &cfg.labels.unknown)?);
    let spec = cfg.input_spec();
    info!(
        "starting classifier: backend={}, input={}x{}x{}, labels={}",
        cfg.model.backend,
        spec.channels,
        spec.height,
        spec.width,
        labels.len()
    );

    let (tx, mut rx) = mpsc::unbounded_channel::<AnalysisResult>();
    let sink: Arc<dyn ResultSink> = Arc::new(move |result: AnalysisResult| {
        let _ = tx.send(result);
    });
    let host = AnalyzerHost::launch(&cfg, sink)?;

    let printer = tokio::spawn({
        let labels = Arc::clone(&labels);
        async move {
            while let Some(result) = rx.recv().await {
                print_result(&result, &labels);
            }
        }
    });

    let outcome = if images.is_empty() {
        run_stream(&host, &cfg).await
    } else {
        run_stills(&host, &images).await
    };

    host.shutdown().await;
    drop(host);
    printer.await?;
    outcome
}

/// Classifies each image path as a still, once the analyzer is ready.
///
/// Undecodable files are logged and skipped.
async fn run_stills(host: &AnalyzerHost, images: &[PathBuf]) -> Result<()> {
    let availability = host.wait_ready().await;
    anyhow::ensure!(availability == Availability::Ready, "analyzer {:?}", availability);

    for path in images {
        let bitmap = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot decode image");
                continue;
            }
        };
        if let Err(e) = host.analyze_still(&bitmap).await {
            error!(path = %path.display(), error = %e, "image not analyzed");
        }
    }
    Ok(())
}

/// Replays `[stream].frames_dir` through a frame source attached to the host.
async fn run_stream(host: &AnalyzerHost, cfg: &Config) -> Result<()> {
    let Some(stream) = &cfg.stream else {
        anyhow::bail!("no images given and no [stream] section configured");
    };
    let replay = DirectoryReplay::new(stream)?;
    let slot = AnalyzerSlot::new();
    host.set_frame_source(Box::new(slot.clone()));

    let stats = replay.run(&slot).await;
    host.clear_frame_source();
    info!(
        delivered = stats.delivered,
        skipped = stats.skipped,
        unreadable = stats.unreadable,
        released = replay.released(),
        "stream done"
    );
    Ok(())
}

/// One JSON line per result on stdout.
fn print_result(result: &AnalysisResult, labels: &Labels) {
    let ranked: Vec<_> = result
        .ranked(labels)
        .into_iter()
        .map(|(label, score)| serde_json::json!({ "label": label, "score": score }))
        .collect();
    let payload = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "origin": result.origin(),
        "headline": result.headline(labels),
        "indices": result.indices(),
        "ranked": ranked,
        "processing_time_ms": result.processing_time_ms(),
    });
    println!("{}", payload);
}
