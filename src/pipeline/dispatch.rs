//! Detector invocation, off the worker thread
//!
//! The dispatch thread owns the only detector handle. Frames, restarts and
//! shutdown arrive on one FIFO job queue, so a restart can never overlap a
//! detection: the old detector is dropped only after the job in front of the
//! restart has finished.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{debug, error, info, instrument, warn};

use super::router::{DetectionEvent, Notice, ResultRouter};
use super::scheduler::FrameSink;
use crate::capture::CorrectedFrame;
use crate::detect::{BoundingBox, Detector, DetectorError, DetectorFactory, DetectorOptions};
use crate::utils::spawn_thread;

enum Job {
    Detect(CorrectedFrame),
    Restart(DetectorOptions),
    Shutdown,
}

/// Sending side of the dispatch thread's job queue
#[derive(Clone)]
pub struct DispatchQueue {
    jobs: Sender<Job>,
}

/// Receiving side, moved into the dispatch thread
pub struct DispatchJobs {
    jobs: Receiver<Job>,
}

impl DispatchQueue {
    pub fn channel() -> (DispatchQueue, DispatchJobs) {
        let (tx, rx) = flume::unbounded();
        (DispatchQueue { jobs: tx }, DispatchJobs { jobs: rx })
    }

    /// Rebuild the detector once the job ahead of this one is done
    pub fn restart(&self, options: DetectorOptions) -> bool {
        self.jobs.send(Job::Restart(options)).is_ok()
    }

    /// Finish queued jobs, then stop the dispatch thread
    pub fn shutdown(&self) -> bool {
        self.jobs.send(Job::Shutdown).is_ok()
    }
}

impl FrameSink for DispatchQueue {
    fn dispatch(&self, frame: CorrectedFrame) {
        if self.jobs.send(Job::Detect(frame)).is_err() {
            warn!("dispatch thread is gone, dropping frame");
        }
    }
}

enum DetectorState {
    Loading,
    Ready(Box<dyn Detector>),
    Failed(DetectorError),
}

/// What happened to one dispatched frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Detected(usize),
    Empty,
    Unavailable,
    Failed,
}

/// Runs detections against the current detector and routes the results.
pub struct Dispatcher {
    factory: Arc<dyn DetectorFactory>,
    state: DetectorState,
    router: ResultRouter,
    unavailable_reported: bool,
}

impl Dispatcher {
    pub fn new(factory: Arc<dyn DetectorFactory>, router: ResultRouter) -> Self {
        Self {
            factory,
            state: DetectorState::Loading,
            router,
            unavailable_reported: false,
        }
    }

    /// Drop the current detector, then build a new one with `options`.
    pub fn load(&mut self, options: &DetectorOptions) {
        let previous = std::mem::replace(&mut self.state, DetectorState::Loading);
        drop(previous);
        self.unavailable_reported = false;

        let factory = &self.factory;
        let created = panic::catch_unwind(AssertUnwindSafe(|| factory.create(options)))
            .unwrap_or_else(|payload| Err(DetectorError::Panicked(panic_message(&*payload))));

        match created {
            Ok(detector) => {
                info!(accelerated = options.accelerated, "detector ready");
                self.state = DetectorState::Ready(detector);
            }
            Err(err) => {
                error!(%err, "failed to initialize detector");
                self.state = DetectorState::Failed(err.clone());
                self.report_unavailable(err);
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&self.state, DetectorState::Ready(detector) if detector.is_ready())
    }

    /// Run one frame through the detector. The frame's buffer is released
    /// before this returns, whatever the outcome.
    #[instrument(skip_all, fields(seq = frame.info().sequence))]
    pub fn handle_frame(&mut self, frame: CorrectedFrame) -> DispatchOutcome {
        let timestamp = frame.info().timestamp;

        let run = match &mut self.state {
            DetectorState::Ready(detector) if detector.is_ready() => {
                Some(run_detector(detector.as_mut(), &frame))
            }
            _ => None,
        };
        drop(frame);

        let Some((result, inference_time)) = run else {
            let reason = match &self.state {
                DetectorState::Failed(err) => err.clone(),
                _ => DetectorError::Unavailable,
            };
            self.report_unavailable(reason);
            return DispatchOutcome::Unavailable;
        };

        self.unavailable_reported = false;
        metrics::histogram!("inference_time_ms").record(inference_time.as_secs_f64() * 1000.0);

        match result {
            Ok(boxes) if boxes.is_empty() => {
                self.router.route(DetectionEvent::Empty { timestamp });
                DispatchOutcome::Empty
            }
            Ok(boxes) => {
                let count = boxes.len();
                debug!(count, ?inference_time, "objects detected");
                self.router.route(DetectionEvent::Detected {
                    timestamp,
                    boxes,
                    inference_time,
                });
                DispatchOutcome::Detected(count)
            }
            Err(err) => {
                warn!(%err, "detection failed");
                metrics::counter!("detection_failures").increment(1);
                DispatchOutcome::Failed
            }
        }
    }

    fn report_unavailable(&mut self, reason: DetectorError) {
        metrics::counter!("detector_unavailable").increment(1);
        if self.unavailable_reported {
            return;
        }
        self.unavailable_reported = true;
        warn!(%reason, "detector unavailable, dropping frames");
        self.router.notify(Notice::DetectorUnavailable(reason));
    }
}

fn run_detector(
    detector: &mut dyn Detector,
    frame: &CorrectedFrame,
) -> (Result<Vec<BoundingBox>, DetectorError>, Duration) {
    let started = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(|| detector.detect(frame)))
        .unwrap_or_else(|payload| Err(DetectorError::Panicked(panic_message(&*payload))));
    (result, started.elapsed())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Start the dispatch thread.
///
/// The detector is built on the new thread before the first job is read.
/// `on_complete` runs after every frame, once its result has been routed.
pub fn spawn_dispatch_thread(
    mut dispatcher: Dispatcher,
    options: DetectorOptions,
    jobs: DispatchJobs,
    on_complete: impl Fn() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    spawn_thread("lookout-detector", move || {
        dispatcher.load(&options);

        for job in jobs.jobs.iter() {
            match job {
                Job::Detect(frame) => {
                    let outcome = dispatcher.handle_frame(frame);
                    debug!(?outcome, "dispatch finished");
                    on_complete();
                }
                Job::Restart(options) => {
                    info!(accelerated = options.accelerated, "restarting detector");
                    dispatcher.load(&options);
                }
                Job::Shutdown => break,
            }
        }

        debug!("dispatch thread exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameInfo, RgbFrame, Rotation};
    use crate::pipeline::pool::BufferPool;
    use crate::pipeline::router::{DetectionListener, PresentationQueue};

    #[derive(Default)]
    struct Seen {
        detections: Vec<(Duration, usize)>,
        empties: Vec<Duration>,
        notices: Vec<Notice>,
    }

    impl DetectionListener for Seen {
        fn on_detect(&mut self, timestamp: Duration, boxes: &[BoundingBox], _: Duration) {
            self.detections.push((timestamp, boxes.len()));
        }

        fn on_empty_detect(&mut self, timestamp: Duration) {
            self.empties.push(timestamp);
        }

        fn on_notice(&mut self, notice: &Notice) {
            self.notices.push(notice.clone());
        }
    }

    struct Scripted(Vec<Result<Vec<BoundingBox>, DetectorError>>);

    impl Detector for Scripted {
        fn detect(&mut self, _: &CorrectedFrame) -> Result<Vec<BoundingBox>, DetectorError> {
            self.0.remove(0)
        }
    }

    struct Warming;

    impl Detector for Warming {
        fn detect(&mut self, _: &CorrectedFrame) -> Result<Vec<BoundingBox>, DetectorError> {
            unreachable!("not ready")
        }

        fn is_ready(&self) -> bool {
            false
        }
    }

    struct Panicky;

    impl Detector for Panicky {
        fn detect(&mut self, _: &CorrectedFrame) -> Result<Vec<BoundingBox>, DetectorError> {
            panic!("tensor shape mismatch")
        }
    }

    fn frame(pool: &BufferPool, ms: u64) -> CorrectedFrame {
        let info = FrameInfo {
            sequence: ms,
            timestamp: Duration::from_millis(ms),
            rotation: Rotation::Deg0,
        };
        CorrectedFrame::upright(RgbFrame::from_buffer(2, 2, pool.acquire(12), info))
    }

    fn dispatcher_with(
        make: impl Fn() -> Result<Box<dyn Detector>, DetectorError> + Send + Sync + 'static,
    ) -> (Dispatcher, PresentationQueue) {
        let (router, queue) = ResultRouter::channel();
        let factory = move |_: &DetectorOptions| make();
        let mut dispatcher = Dispatcher::new(Arc::new(factory), router);
        dispatcher.load(&DetectorOptions::default());
        (dispatcher, queue)
    }

    fn bbox() -> BoundingBox {
        BoundingBox::from_corners(0.1, 0.1, 0.2, 0.2, 0.8, 1, "person")
    }

    #[test]
    fn results_and_empties_are_distinguished() {
        let pool = BufferPool::new(4);
        let (mut dispatcher, queue) = dispatcher_with(|| {
            Ok(Box::new(Scripted(vec![Ok(vec![bbox(), bbox()]), Ok(Vec::new())])))
        });

        assert_eq!(dispatcher.handle_frame(frame(&pool, 1)), DispatchOutcome::Detected(2));
        assert_eq!(dispatcher.handle_frame(frame(&pool, 2)), DispatchOutcome::Empty);
        assert_eq!(pool.outstanding(), 0);

        let mut seen = Seen::default();
        queue.drain(&mut seen);
        assert_eq!(seen.detections, vec![(Duration::from_millis(1), 2)]);
        assert_eq!(seen.empties, vec![Duration::from_millis(2)]);
        assert!(seen.notices.is_empty());
    }

    #[test]
    fn failed_init_drops_frames_and_notifies_once() {
        let pool = BufferPool::new(4);
        let (mut dispatcher, queue) =
            dispatcher_with(|| Err(DetectorError::Init("model missing".into())));

        for ms in 0..3 {
            assert_eq!(dispatcher.handle_frame(frame(&pool, ms)), DispatchOutcome::Unavailable);
        }
        assert_eq!(pool.outstanding(), 0);

        let mut seen = Seen::default();
        queue.drain(&mut seen);
        assert!(seen.detections.is_empty());
        assert!(seen.empties.is_empty());
        assert_eq!(
            seen.notices,
            vec![Notice::DetectorUnavailable(DetectorError::Init(
                "model missing".into()
            ))]
        );
    }

    #[test]
    fn warming_detector_counts_as_unavailable() {
        let pool = BufferPool::new(2);
        let (mut dispatcher, queue) = dispatcher_with(|| Ok(Box::new(Warming)));

        assert!(!dispatcher.is_ready());
        dispatcher.handle_frame(frame(&pool, 1));
        dispatcher.handle_frame(frame(&pool, 2));

        let mut seen = Seen::default();
        queue.drain(&mut seen);
        assert_eq!(
            seen.notices,
            vec![Notice::DetectorUnavailable(DetectorError::Unavailable)]
        );
    }

    #[test]
    fn detector_errors_and_panics_are_absorbed() {
        let pool = BufferPool::new(2);
        let (mut dispatcher, queue) = dispatcher_with(|| {
            Ok(Box::new(Scripted(vec![Err(DetectorError::Inference("oom".into()))])))
        });
        assert_eq!(dispatcher.handle_frame(frame(&pool, 1)), DispatchOutcome::Failed);

        let (mut panicky, panic_queue) = dispatcher_with(|| Ok(Box::new(Panicky)));
        assert_eq!(panicky.handle_frame(frame(&pool, 2)), DispatchOutcome::Failed);
        assert_eq!(pool.outstanding(), 0);

        let mut seen = Seen::default();
        assert_eq!(queue.drain(&mut seen), 0);
        assert_eq!(panic_queue.drain(&mut seen), 0);
    }

    #[test]
    fn panicking_factory_leaves_dispatcher_degraded() {
        let pool = BufferPool::new(2);
        let (mut dispatcher, queue) = dispatcher_with(|| panic!("model load blew up"));

        assert!(!dispatcher.is_ready());
        for ms in 0..3 {
            assert_eq!(dispatcher.handle_frame(frame(&pool, ms)), DispatchOutcome::Unavailable);
        }
        assert_eq!(pool.outstanding(), 0);

        let mut seen = Seen::default();
        queue.drain(&mut seen);
        assert_eq!(
            seen.notices,
            vec![Notice::DetectorUnavailable(DetectorError::Panicked(
                "model load blew up".into()
            ))]
        );
    }

    #[test]
    fn thread_processes_restart_between_frames() {
        use std::sync::Mutex;

        let pool = BufferPool::new(4);
        let built = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&built);
        let factory = move |options: &DetectorOptions| -> Result<Box<dyn Detector>, DetectorError> {
            log.lock().unwrap().push(options.accelerated);
            Ok(Box::new(Scripted(vec![Ok(vec![bbox()]); 4])))
        };
        let (router, queue) = ResultRouter::channel();
        let (jobs_tx, jobs_rx) = DispatchQueue::channel();
        let (done_tx, done_rx) = flume::unbounded();

        let handle = spawn_dispatch_thread(
            Dispatcher::new(Arc::new(factory), router),
            DetectorOptions::default(),
            jobs_rx,
            move || {
                let _ = done_tx.send(());
            },
        )
        .unwrap();

        jobs_tx.dispatch(frame(&pool, 1));
        jobs_tx.restart(DetectorOptions {
            accelerated: true,
            ..DetectorOptions::default()
        });
        jobs_tx.dispatch(frame(&pool, 2));
        jobs_tx.shutdown();
        handle.join().unwrap();

        assert_eq!(done_rx.try_iter().count(), 2);
        assert_eq!(*built.lock().unwrap(), vec![false, true]);
        assert_eq!(pool.outstanding(), 0);

        let mut seen = Seen::default();
        queue.run(&mut seen);
        assert_eq!(
            seen.detections,
            vec![(Duration::from_millis(1), 1), (Duration::from_millis(2), 1)]
        );
    }
}
