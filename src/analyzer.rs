//! Analyzer lifecycle.
//!
//! [`AnalyzerHost`] launches the worker (which creates the engine off the
//! caller's thread), publishes an immutable [`Analyzer`] once the engine is
//! ready, hands it to the attached [`FrameSource`], and tears everything down
//! in order. Installing the analyzer, attaching/swapping the frame source and
//! teardown all go through the same lock, so no caller sees a half-built
//! analyzer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use image::RgbImage;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tracing::{debug, info, warn};

use crate::engine::EngineFactory;
use crate::error::AnalyzerError;
use crate::pipeline::Pipeline;
use crate::resources::{LedgerSnapshot, ResourceLedger};
use crate::types::{AnalysisResult, Config, InputSpec, RawFrame};
use crate::worker::{spawn_worker, Command, EngineLoader, Job, JobFrame, WorkerContext};

/// Receives results on the worker thread. Implementations forward them to
/// their own context.
pub trait ResultSink: Send + Sync {
    fn on_result(&self, result: AnalysisResult);
}

impl<F> ResultSink for F
where
    F: Fn(AnalysisResult) + Send + Sync,
{
    fn on_result(&self, result: AnalysisResult) {
        self(result)
    }
}

/// Producer of stream frames. Called with the host lock held; must not call
/// back into the host.
pub trait FrameSource: Send {
    fn attach(&mut self, analyzer: Arc<Analyzer>);
    fn detach(&mut self);
}

/// Handle to a ready engine. Cheap to share; every submission goes to the
/// single worker.
pub struct Analyzer {
    tx: mpsc::Sender<Command>,
    stream_slot: Arc<Semaphore>,
}

impl Analyzer {
    fn new(tx: mpsc::Sender<Command>) -> Self {
        Self {
            tx,
            stream_slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Hands a stream frame to the worker without blocking.
    ///
    /// While another stream frame is in flight the new one is refused with
    /// [`AnalyzerError::Busy`]. A refused frame is released before returning.
    pub fn analyze_stream(&self, frame: RawFrame) -> Result<(), AnalyzerError> {
        let Ok(permit) = Arc::clone(&self.stream_slot).try_acquire_owned() else {
            debug!("analyzer busy, frame skipped");
            return Err(AnalyzerError::Busy);
        };
        let job = Job { frame: JobFrame::Stream(frame), permit: Some(permit) };
        self.tx.try_send(Command::Analyze(job)).map_err(|e| match e {
            TrySendError::Full(_) => {
                debug!("worker queue full, frame skipped");
                AnalyzerError::Busy
            }
            TrySendError::Closed(_) => AnalyzerError::Unavailable,
        })
    }

    /// Queues a copy of a picked image, waiting for queue space.
    ///
    /// The worker pre-scales it with a smoothing filter before the regular
    /// pipeline runs; the caller keeps ownership of `bitmap`.
    pub async fn analyze_still(&self, bitmap: &RgbImage) -> Result<(), AnalyzerError> {
        if bitmap.width() == 0 || bitmap.height() == 0 {
            warn!("empty bitmap skipped");
            return Err(AnalyzerError::Preprocess("empty bitmap".into()));
        }
        let job = Job { frame: JobFrame::Still(bitmap.clone()), permit: None };
        self.tx
            .send(Command::Analyze(job))
            .await
            .map_err(|_| AnalyzerError::Unavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Engine creation still running.
    Pending,
    Ready,
    /// Engine creation failed; there is no retry.
    Unavailable,
    Closed,
}

enum Phase {
    Pending,
    Ready(Arc<Analyzer>),
    Unavailable,
    Closed,
}

impl Phase {
    fn availability(&self) -> Availability {
        match self {
            Phase::Pending => Availability::Pending,
            Phase::Ready(_) => Availability::Ready,
            Phase::Unavailable => Availability::Unavailable,
            Phase::Closed => Availability::Closed,
        }
    }
}

struct HostState {
    phase: Phase,
    source: Option<Box<dyn FrameSource>>,
}

struct Shared {
    state: Mutex<HostState>,
    availability: watch::Sender<Availability>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, state: &mut HostState, phase: Phase) -> Phase {
        self.availability.send_replace(phase.availability());
        std::mem::replace(&mut state.phase, phase)
    }

    fn become_ready(&self, outcome: Result<(), AnalyzerError>, tx: mpsc::Sender<Command>) {
        let mut state = self.lock();
        if !matches!(state.phase, Phase::Pending) {
            debug!("engine finished after teardown, analyzer discarded");
            return;
        }
        match outcome {
            Ok(()) => {
                let analyzer = Arc::new(Analyzer::new(tx));
                if let Some(source) = state.source.as_mut() {
                    source.attach(Arc::clone(&analyzer));
                }
                self.set_phase(&mut state, Phase::Ready(analyzer));
                info!("analyzer ready");
            }
            Err(_) => {
                self.set_phase(&mut state, Phase::Unavailable);
                warn!("analyzer unavailable");
            }
        }
    }
}

pub struct HostSettings {
    pub pipeline: Pipeline,
    pub spec: InputSpec,
    /// Channel depth for still images and control messages.
    pub queue_depth: usize,
}

impl HostSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            pipeline: Pipeline::from_config(cfg),
            spec: cfg.input_spec(),
            queue_depth: 4,
        }
    }
}

/// Owner of the engine's worker and of the current analyzer.
pub struct AnalyzerHost {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Command>,
    ledger: Arc<ResourceLedger>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AnalyzerHost {
    /// Starts creating the configured engine in the background.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Runtime configuration; `[model]` selects the backend
    /// * `sink` - Receives every result, on the worker thread
    ///
    /// # Returns
    ///
    /// The host in `Pending` state; see [`AnalyzerHost::launch_with`]
    pub fn launch(cfg: &Config, sink: Arc<dyn ResultSink>) -> Result<Self, AnalyzerError> {
        let engine_cfg = cfg.clone();
        Self::launch_with(
            HostSettings::from_config(cfg),
            Box::new(move || EngineFactory::create(&engine_cfg)),
            sink,
        )
    }

    /// Spawns the worker, which runs `loader` and then serves jobs.
    ///
    /// Returns immediately. Once the loader finishes the host moves to
    /// `Ready` (and attaches any waiting frame source) or to `Unavailable`.
    ///
    /// # Arguments
    ///
    /// * `settings` - Pipeline, expected input shape and queue depth
    /// * `loader` - Builds the engine; runs on the worker thread
    /// * `sink` - Receives every result, on the worker thread
    ///
    /// # Returns
    ///
    /// * `Ok(host)` - Worker started, engine creation under way
    /// * `Err(SessionCreation)` - The worker thread could not be spawned
    pub fn launch_with(
        settings: HostSettings,
        loader: EngineLoader,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self, AnalyzerError> {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let ledger = ResourceLedger::new();
        let (availability, _) = watch::channel(Availability::Pending);
        let shared = Arc::new(Shared {
            state: Mutex::new(HostState { phase: Phase::Pending, source: None }),
            availability,
        });

        let ctx = WorkerContext {
            pipeline: settings.pipeline,
            spec: settings.spec,
            sink,
            ledger: Arc::clone(&ledger),
        };
        let on_ready = {
            let shared = Arc::clone(&shared);
            let tx = tx.clone();
            move |outcome: Result<(), AnalyzerError>| shared.become_ready(outcome, tx)
        };

        let worker = spawn_worker(loader, rx, ctx, on_ready).map_err(|e| {
            AnalyzerError::SessionCreation(anyhow::Error::new(e).context("cannot spawn analyzer worker"))
        })?;
        info!("engine creation started");

        Ok(Self {
            shared,
            tx,
            ledger,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn availability(&self) -> Availability {
        self.shared.lock().phase.availability()
    }

    /// Waits until engine creation has finished one way or the other.
    pub async fn wait_ready(&self) -> Availability {
        let mut rx = self.shared.availability.subscribe();
        let settled = rx.wait_for(|a| *a != Availability::Pending).await.map(|a| *a);
        settled.unwrap_or_else(|_| self.availability())
    }

    pub fn analyzer(&self) -> Option<Arc<Analyzer>> {
        match &self.shared.lock().phase {
            Phase::Ready(analyzer) => Some(Arc::clone(analyzer)),
            _ => None,
        }
    }

    /// Submits a stream frame; without a ready analyzer the frame is dropped.
    pub fn analyze_stream(&self, frame: RawFrame) -> Result<(), AnalyzerError> {
        match self.analyzer() {
            Some(analyzer) => analyzer.analyze_stream(frame),
            None => {
                info!(availability = ?self.availability(), "no analyzer, frame dropped");
                Err(AnalyzerError::Unavailable)
            }
        }
    }

    pub async fn analyze_still(&self, bitmap: &RgbImage) -> Result<(), AnalyzerError> {
        match self.analyzer() {
            Some(analyzer) => analyzer.analyze_still(bitmap).await,
            None => {
                info!(availability = ?self.availability(), "no analyzer, image dropped");
                Err(AnalyzerError::Unavailable)
            }
        }
    }

    /// Replaces the frame source. The previous one is detached; the new one
    /// is attached now if the analyzer is ready, otherwise when it becomes
    /// ready.
    pub fn set_frame_source(&self, mut source: Box<dyn FrameSource>) {
        let mut state = self.shared.lock();
        if let Some(mut previous) = state.source.take() {
            previous.detach();
        }
        match &state.phase {
            Phase::Ready(analyzer) => {
                source.attach(Arc::clone(analyzer));
                info!("frame source attached");
            }
            Phase::Closed => {
                warn!("host closed, frame source ignored");
                return;
            }
            Phase::Pending | Phase::Unavailable => debug!("frame source waiting for analyzer"),
        }
        state.source = Some(source);
    }

    pub fn clear_frame_source(&self) {
        if let Some(mut source) = self.shared.lock().source.take() {
            source.detach();
        }
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    /// Detaches the frame source, then closes the engine on the worker after
    /// any job already queued. Returns once the engine is gone.
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.shared.lock();
            if matches!(state.phase, Phase::Closed) {
                return;
            }
            if let Some(mut source) = state.source.take() {
                source.detach();
            }
            self.shared.set_phase(&mut state, Phase::Closed)
        };
        drop(previous);

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Command::Close(ack_tx)).await.is_err() {
            warn!("analyzer worker already stopped");
        } else if ack_rx.await.is_err() {
            warn!("analyzer worker stopped without acknowledging close");
        }

        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Ok(Err(_)) = tokio::task::spawn_blocking(move || handle.join()).await {
                warn!("analyzer worker panicked");
            }
        }
        info!("analyzer host shut down");
    }
}

impl Drop for AnalyzerHost {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if matches!(state.phase, Phase::Closed) {
            return;
        }
        if let Some(mut source) = state.source.take() {
            source.detach();
        }
        self.shared.set_phase(&mut state, Phase::Closed);
        let (ack, _) = oneshot::channel();
        if self.tx.try_send(Command::Close(ack)).is_err() {
            debug!("close not queued, worker stops once submitters are gone");
        }
    }
}
