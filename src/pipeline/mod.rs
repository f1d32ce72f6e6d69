//! Frame pipeline: worker context, single-slot scheduler, detector dispatch
//! and result hand-off.

pub mod dispatch;
pub mod pool;
pub mod router;
pub mod scheduler;
pub mod worker;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use flume::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use crate::capture::{OrientationCorrector, PixelConverter, RawFrame};
use crate::detect::DetectorFactory;
use crate::Config;

pub use dispatch::{DispatchOutcome, DispatchQueue, Dispatcher};
pub use pool::{BufferPool, PoolStats, PooledBuffer};
pub use router::{DetectionEvent, DetectionListener, Notice, PresentationQueue, ResultRouter};
pub use scheduler::{Admission, FrameScheduler, FrameSink, SchedulerStats};
pub use worker::{Control, FrameOutcome, FrameWorker};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("pipeline thread panicked")]
    ThreadPanicked,

    #[error("pipeline is shut down")]
    Closed,
}

#[derive(Default)]
pub(crate) struct Counters {
    submitted: AtomicU64,
    dropped_capture: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Raw frames offered by the producer
    pub frames_submitted: u64,
    /// Queued raw frames released unprocessed because newer ones arrived
    pub frames_dropped_capture: u64,
    /// Frames the worker did not forward (no planes, placeholder)
    pub frames_skipped: u64,
    pub scheduler: SchedulerStats,
    pub pool: PoolStats,
}

/// Producer-side result of [`FrameSubmitter::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Worker queue was full; the oldest queued frame was released to make
    /// room for this one
    Replaced,
    /// Pipeline shut down; the frame was released
    Closed,
}

/// Cloneable producer handle. Never blocks.
///
/// The worker queue keeps the newest frames: a submission into a full queue
/// evicts the oldest queued frame.
#[derive(Clone)]
pub struct FrameSubmitter {
    frames: Sender<RawFrame>,
    oldest: Arc<Receiver<RawFrame>>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl FrameSubmitter {
    fn new(frames: Sender<RawFrame>, oldest: Receiver<RawFrame>, counters: Arc<Counters>) -> Self {
        Self {
            frames,
            oldest: Arc::new(oldest),
            closed: Arc::new(AtomicBool::new(false)),
            counters,
        }
    }

    pub fn submit(&self, mut frame: RawFrame) -> SubmitOutcome {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_submitted").increment(1);

        if self.closed.load(Ordering::SeqCst) {
            return SubmitOutcome::Closed;
        }

        let mut outcome = SubmitOutcome::Accepted;
        loop {
            match self.frames.try_send(frame) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    frame = back;
                    // The worker may take it first; then the retry has room
                    if let Ok(stale) = self.oldest.try_recv() {
                        self.counters.dropped_capture.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("frames_dropped_capture").increment(1);
                        trace!(seq = stale.info().sequence, "queue full, releasing oldest frame");
                        outcome = SubmitOutcome::Replaced;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return SubmitOutcome::Closed,
            }
        }

        // Raced with shutdown: nobody will take what is queued now
        if self.closed.load(Ordering::SeqCst) {
            self.release_queued();
            return SubmitOutcome::Closed;
        }
        outcome
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn release_queued(&self) -> usize {
        self.oldest.drain().count()
    }
}

/// Running pipeline.
///
/// Owns the worker thread (conversion, rotation, admission) and the dispatch
/// thread (detector). Results leave through the [`ResultRouter`] given to
/// [`Pipeline::start`].
pub struct Pipeline {
    submitter: FrameSubmitter,
    control: Sender<Control>,
    dispatch: DispatchQueue,
    scheduler: Arc<FrameScheduler<DispatchQueue>>,
    pool: BufferPool,
    worker: Option<JoinHandle<()>>,
    detector: Option<JoinHandle<()>>,
}

impl Pipeline {
    #[instrument(skip_all)]
    pub fn start(
        config: &Config,
        factory: Arc<dyn DetectorFactory>,
        router: ResultRouter,
    ) -> Result<Self, PipelineError> {
        if config.capture.queue_depth == 0 {
            return Err(PipelineError::Config(config::ConfigError::Message(
                "capture.queue_depth must be at least 1".into(),
            )));
        }
        let options = config.detector.options();
        info!(
            queue_depth = config.capture.queue_depth,
            pool_buffers = config.pipeline.pool_buffers,
            accelerated = options.accelerated,
            "starting pipeline"
        );

        let pool = BufferPool::new(config.pipeline.pool_buffers);
        let counters = Arc::new(Counters::default());

        let (dispatch, jobs) = DispatchQueue::channel();
        let scheduler = Arc::new(FrameScheduler::new(dispatch.clone()));

        let dispatcher = Dispatcher::new(factory, router.clone());
        let detector = {
            let scheduler = Arc::clone(&scheduler);
            dispatch::spawn_dispatch_thread(dispatcher, options, jobs, move || {
                scheduler.complete()
            })?
        };

        let (frames_tx, frames_rx) = flume::bounded(config.capture.queue_depth);
        let submitter = FrameSubmitter::new(frames_tx, frames_rx.clone(), Arc::clone(&counters));
        let (control_tx, control_rx) = flume::unbounded();
        let worker = FrameWorker::new(
            PixelConverter::new(pool.clone()),
            OrientationCorrector::new(pool.clone()),
            Arc::clone(&scheduler),
            dispatch.clone(),
            router,
            options,
            config.pipeline.forward_placeholders,
            Arc::clone(&counters),
        );
        let worker = match worker::spawn_worker(worker, frames_rx, control_rx) {
            Ok(handle) => handle,
            Err(err) => {
                dispatch.shutdown();
                let _ = detector.join();
                return Err(err.into());
            }
        };

        Ok(Self {
            submitter,
            control: control_tx,
            dispatch,
            scheduler,
            pool,
            worker: Some(worker),
            detector: Some(detector),
        })
    }

    /// Handle for the sensor side
    pub fn submitter(&self) -> FrameSubmitter {
        self.submitter.clone()
    }

    pub fn submit(&self, frame: RawFrame) -> SubmitOutcome {
        self.submitter.submit(frame)
    }

    /// Switch accelerated mode. The detector is rebuilt on the dispatch
    /// thread once any in-flight detection has finished.
    pub fn set_accelerated(&self, accelerated: bool) -> Result<(), PipelineError> {
        self.control
            .send(Control::SetAccelerated(accelerated))
            .map_err(|_| PipelineError::Closed)
    }

    /// RGB buffer pool shared by conversion and rotation
    pub fn pool(&self) -> BufferPool {
        self.pool.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.submitter.counters;
        PipelineStats {
            frames_submitted: counters.submitted.load(Ordering::Relaxed),
            frames_dropped_capture: counters.dropped_capture.load(Ordering::Relaxed),
            frames_skipped: counters.skipped.load(Ordering::Relaxed),
            scheduler: self.scheduler.stats(),
            pool: self.pool.stats(),
        }
    }

    /// Stop accepting frames, let the in-flight detection finish, and join
    /// both threads. Pending frames are released.
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), PipelineError> {
        let mut result = Ok(());
        self.submitter.close();

        if let Some(worker) = self.worker.take() {
            let _ = self.control.send(Control::Shutdown);
            if worker.join().is_err() {
                result = Err(PipelineError::ThreadPanicked);
            }
        }
        let released = self.submitter.release_queued();
        if released > 0 {
            debug!(released, "released frames queued after the worker stopped");
        }

        self.scheduler.close();

        if let Some(detector) = self.detector.take() {
            self.dispatch.shutdown();
            if detector.join().is_err() {
                result = Err(PipelineError::ThreadPanicked);
            }
        }

        debug!(stats = ?self.stats(), "pipeline stopped");
        result
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.worker.is_some() || self.detector.is_some() {
            if let Err(err) = self.stop() {
                warn!(%err, "pipeline shutdown failed");
            }
        }
    }
}
