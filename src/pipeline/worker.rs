//! The worker context: conversion, rotation and admission for every frame

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use flume::{Receiver, RecvError, Selector};
use tracing::{debug, info, instrument, warn};

use super::dispatch::DispatchQueue;
use super::router::{Notice, ResultRouter};
use super::scheduler::{Admission, FrameScheduler};
use super::Counters;
use crate::capture::{ConversionStatus, OrientationCorrector, PixelConverter, RawFrame};
use crate::detect::DetectorOptions;
use crate::utils::spawn_thread;

/// Requests queued onto the worker alongside frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
    SetAccelerated(bool),
    Shutdown,
}

/// What the worker did with one raw frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Admitted(Admission),
    /// Not forwarded to the scheduler (no planes, or placeholder output)
    Skipped,
}

enum Input {
    Frame(RawFrame),
    Control(Control),
    Disconnected,
}

pub struct FrameWorker {
    converter: PixelConverter,
    corrector: OrientationCorrector,
    scheduler: Arc<FrameScheduler<DispatchQueue>>,
    dispatch: DispatchQueue,
    router: ResultRouter,
    options: DetectorOptions,
    forward_placeholders: bool,
    counters: Arc<Counters>,
}

impl FrameWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        converter: PixelConverter,
        corrector: OrientationCorrector,
        scheduler: Arc<FrameScheduler<DispatchQueue>>,
        dispatch: DispatchQueue,
        router: ResultRouter,
        options: DetectorOptions,
        forward_placeholders: bool,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            converter,
            corrector,
            scheduler,
            dispatch,
            router,
            options,
            forward_placeholders,
            counters,
        }
    }

    /// Convert, rotate and offer one frame to the scheduler
    #[instrument(skip_all, fields(seq = raw.info().sequence))]
    pub fn process(&mut self, raw: RawFrame) -> FrameOutcome {
        let info = raw.info();
        if raw.planes().is_empty() {
            warn!("frame carries no image planes, skipping");
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return FrameOutcome::Skipped;
        }
        debug!(
            width = raw.width(),
            height = raw.height(),
            format = ?raw.format(),
            rotation = info.rotation.degrees(),
            "processing frame"
        );

        let conversion = self.converter.convert(raw);
        if let ConversionStatus::Placeholder {
            error,
            first_of_kind,
        } = &conversion.status
        {
            metrics::counter!("frames_placeholder").increment(1);
            if *first_of_kind {
                warn!(%error, "frame conversion degraded to placeholder");
                self.router.notify(Notice::from(error.clone()));
            }
            if !self.forward_placeholders {
                self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                return FrameOutcome::Skipped;
            }
        }

        let corrected = self.corrector.correct(conversion.frame, info.rotation);
        FrameOutcome::Admitted(self.scheduler.submit(corrected))
    }

    fn apply(&mut self, control: Control) -> bool {
        match control {
            Control::SetAccelerated(accelerated) => {
                if self.options.accelerated == accelerated {
                    debug!(accelerated, "accelerated mode unchanged");
                    return true;
                }
                self.options.accelerated = accelerated;
                info!(accelerated, "queueing detector restart");
                if !self.dispatch.restart(self.options) {
                    warn!(accelerated, "dispatch thread is gone, dropping restart");
                }
                true
            }
            Control::Shutdown => false,
        }
    }

    /// Skip ahead to the newest queued frame, releasing the older ones
    fn newest(&self, mut raw: RawFrame, frames: &Receiver<RawFrame>) -> RawFrame {
        for newer in frames.try_iter() {
            self.counters.dropped_capture.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("frames_dropped_capture").increment(1);
            debug!(seq = raw.info().sequence, "newer frame queued, releasing");
            raw = newer;
        }
        raw
    }

    fn run(mut self, frames: Receiver<RawFrame>, control: Receiver<Control>) {
        info!("frame worker started");
        loop {
            let input = Selector::new()
                .recv(&control, |msg: Result<Control, RecvError>| {
                    msg.map_or(Input::Disconnected, Input::Control)
                })
                .recv(&frames, |msg: Result<RawFrame, RecvError>| {
                    msg.map_or(Input::Disconnected, Input::Frame)
                })
                .wait();

            match input {
                Input::Frame(raw) => {
                    let raw = self.newest(raw, &frames);
                    let outcome = self.process(raw);
                    debug!(?outcome, "frame handled");
                }
                Input::Control(control) => {
                    if !self.apply(control) {
                        break;
                    }
                }
                Input::Disconnected => break,
            }
        }

        // Queued sensor frames go straight back to the producer
        let drained = frames.drain().count();
        if drained > 0 {
            debug!(drained, "released queued frames on shutdown");
        }
        info!("frame worker stopped");
    }
}

pub(crate) fn spawn_worker(
    worker: FrameWorker,
    frames: Receiver<RawFrame>,
    control: Receiver<Control>,
) -> io::Result<JoinHandle<()>> {
    spawn_thread("lookout-worker", move || worker.run(frames, control))
}
