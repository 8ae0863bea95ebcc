//! The single worker that owns the engine.
//!
//! Engine creation, every inference and the final close all happen on one
//! dedicated thread, in channel order. A `Close` queued behind a job therefore
//! cannot overtake it, and nothing else ever touches the engine.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::RgbImage;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};
use tracing::{debug, error, info, warn};

use crate::analyzer::ResultSink;
use crate::engine::Engine;
use crate::error::AnalyzerError;
use crate::pipeline::Pipeline;
use crate::resources::{BufferKind, ResourceLedger};
use crate::types::{AnalysisResult, FrameOrigin, FrameView, InputSpec, PixelFormat, RawFrame};

/// Produces the engine on the worker thread.
pub type EngineLoader = Box<dyn FnOnce() -> Result<Box<dyn Engine>> + Send>;

pub(crate) enum Command {
    Analyze(Job),
    Close(oneshot::Sender<()>),
}

pub(crate) enum JobFrame {
    Stream(RawFrame),
    Still(RgbImage),
}

pub(crate) struct Job {
    pub frame: JobFrame,
    /// Held by stream jobs; dropping it frees the stream slot.
    pub permit: Option<OwnedSemaphorePermit>,
}

pub(crate) struct WorkerContext {
    pub pipeline: Pipeline,
    pub spec: InputSpec,
    pub sink: Arc<dyn ResultSink>,
    pub ledger: Arc<ResourceLedger>,
}

pub(crate) fn spawn_worker<F>(
    loader: EngineLoader,
    rx: mpsc::Receiver<Command>,
    ctx: WorkerContext,
    on_ready: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce(Result<(), AnalyzerError>) + Send + 'static,
{
    std::thread::Builder::new()
        .name("analyzer-worker".into())
        .spawn(move || run_worker(loader, rx, ctx, on_ready))
}

fn run_worker<F>(loader: EngineLoader, mut rx: mpsc::Receiver<Command>, ctx: WorkerContext, on_ready: F)
where
    F: FnOnce(Result<(), AnalyzerError>),
{
    let started = Instant::now();
    let mut engine = match loader() {
        Ok(engine) => engine,
        Err(e) => {
            let err = AnalyzerError::SessionCreation(e);
            error!(error = %err, "engine unavailable");
            on_ready(Err(err));
            drain_until_close(&mut rx);
            return;
        }
    };
    info!(backend = engine.name(), elapsed_ms = started.elapsed().as_millis() as u64, "engine created");
    on_ready(Ok(()));

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Analyze(job) => match process(engine.as_mut(), &ctx, job) {
                Ok(result) => ctx.sink.on_result(result),
                Err(e) => warn!(error = %e, "frame dropped"),
            },
            Command::Close(ack) => {
                drop(engine);
                info!("engine closed");
                let _ = ack.send(());
                return;
            }
        }
    }

    drop(engine);
    info!("engine closed, no submitters left");
}

/// Frames queued while the engine failed to load are released unprocessed.
fn drain_until_close(rx: &mut mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Analyze(_) => debug!("engine unavailable, frame dropped"),
            Command::Close(ack) => {
                let _ = ack.send(());
                return;
            }
        }
    }
}

/// One frame through preprocess → engine → postprocess.
///
/// The job (and with it any stream frame) is dropped before this returns, on
/// every path.
pub(crate) fn process(engine: &mut dyn Engine, ctx: &WorkerContext, job: Job) -> Result<AnalysisResult, AnalyzerError> {
    let Job { frame, permit: _permit } = job;

    let (tensor, origin) = match &frame {
        JobFrame::Stream(raw) => (ctx.pipeline.run_pre(raw.view())?, FrameOrigin::Stream),
        JobFrame::Still(bitmap) => {
            let scaled = prescale_still(bitmap, &ctx.spec);
            let view = FrameView {
                pixels: scaled.as_raw(),
                width: scaled.width(),
                height: scaled.height(),
                format: PixelFormat::Rgb8,
                rotation_degrees: 0,
            };
            (ctx.pipeline.run_pre(view)?, FrameOrigin::Still)
        }
    };
    drop(frame);

    let _input = ctx.ledger.lease(BufferKind::InputTensor);
    ctx.spec.validate(tensor.shape()).map_err(AnalyzerError::Inference)?;

    let start = Instant::now();
    let raw = engine.infer_array(tensor).map_err(AnalyzerError::Inference)?;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let _output = ctx.ledger.lease(BufferKind::RawOutput);

    let ranking = ctx.pipeline.run_post(raw)?;
    debug!(?origin, elapsed_ms, top = ?ranking.indices.first(), "frame classified");
    Ok(AnalysisResult::new(ranking, elapsed_ms, origin))
}

/// Smooth downscale of a picked image to the model size. Stream frames skip
/// this and go straight to the (nearest) stretch resize.
fn prescale_still(bitmap: &RgbImage, spec: &InputSpec) -> RgbImage {
    let (w, h) = (spec.width as u32, spec.height as u32);
    if bitmap.dimensions() == (w, h) {
        return bitmap.clone();
    }
    imageops::resize(bitmap, w, h, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use ndarray::{Array, ArrayD};

    use crate::types::Config;

    struct Failing;

    impl Engine for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn infer_array(&mut self, _input: ArrayD<f32>) -> Result<ArrayD<f32>> {
            anyhow::bail!("shape mismatch")
        }
    }

    struct Constant(Vec<f32>);

    impl Engine for Constant {
        fn name(&self) -> &'static str {
            "constant"
        }

        fn infer_array(&mut self, _input: ArrayD<f32>) -> Result<ArrayD<f32>> {
            Ok(Array::from_shape_vec((1, self.0.len()), self.0.clone())?.into_dyn())
        }
    }

    fn context(results: Arc<Mutex<Vec<AnalysisResult>>>) -> WorkerContext {
        let cfg: Config = toml::from_str(
            "[model]\nbackend = \"linear\"\nmodel_path = \"unused\"\n[labels]\npath = \"unused\"\n",
        )
        .unwrap();
        WorkerContext {
            pipeline: Pipeline::from_config(&cfg),
            spec: cfg.input_spec(),
            sink: Arc::new(move |r: AnalysisResult| results.lock().unwrap().push(r)),
            ledger: ResourceLedger::new(),
        }
    }

    fn frame(released: &Arc<AtomicUsize>) -> Job {
        let released = Arc::clone(released);
        let raw = RawFrame::new(vec![0; 4 * 4 * 3], 4, 4, PixelFormat::Rgb8, 180).with_release(move || {
            released.fetch_add(1, Ordering::SeqCst);
        });
        Job { frame: JobFrame::Stream(raw), permit: None }
    }

    #[test]
    fn test_inference_error_releases_everything() {
        let ctx = context(Arc::default());
        let released = Arc::new(AtomicUsize::new(0));

        let err = process(&mut Failing, &ctx, frame(&released)).unwrap_err();
        assert!(matches!(err, AnalyzerError::Inference(_)));
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.ledger.snapshot().outstanding(), 0);
    }

    #[test]
    fn test_still_is_prescaled_on_the_worker() {
        let ctx = context(Arc::default());
        let job = Job { frame: JobFrame::Still(RgbImage::new(640, 480)), permit: None };

        let result = process(&mut Constant(vec![2.0, 0.5]), &ctx, job).unwrap();
        assert_eq!(result.origin(), FrameOrigin::Still);
        assert_eq!(result.indices(), &[0, 1, 0]);
        assert_eq!(ctx.ledger.snapshot().outstanding(), 0);
    }

    #[test]
    fn test_prescale_targets_model_size() {
        let spec = InputSpec { batch: 1, channels: 3, height: 224, width: 256 };
        assert_eq!(prescale_still(&RgbImage::new(1920, 1080), &spec).dimensions(), (256, 224));
        assert_eq!(prescale_still(&RgbImage::new(256, 224), &spec).dimensions(), (256, 224));
    }

    #[test]
    fn test_worker_serves_jobs_then_closes() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let ctx = context(Arc::clone(&results));
        let ledger = Arc::clone(&ctx.ledger);
        let (tx, rx) = mpsc::channel(4);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let loader: EngineLoader = Box::new(|| Ok(Box::new(Constant(vec![0.1, 3.0])) as Box<dyn Engine>));

        let handle = spawn_worker(loader, rx, ctx, move |outcome| {
            let _ = ready_tx.send(outcome.is_ok());
        })
        .unwrap();
        assert!(ready_rx.recv().unwrap());

        let released = Arc::new(AtomicUsize::new(0));
        let (ack_tx, ack_rx) = oneshot::channel();
        tx.blocking_send(Command::Analyze(frame(&released))).unwrap();
        tx.blocking_send(Command::Close(ack_tx)).unwrap();
        ack_rx.blocking_recv().unwrap();
        handle.join().unwrap();

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].indices(), &[1, 0, 0]);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.snapshot().acquired, 2);
        assert_eq!(ledger.snapshot().outstanding(), 0);
    }
}
