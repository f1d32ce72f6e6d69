//! Lookout: camera frames in, bright-region detections out

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use lookout::capture::SyntheticSensor;
use lookout::detect::LumaDetectorFactory;
use lookout::overlay::ConsoleOverlay;
use lookout::{Config, FrameSubmitter, Pipeline, ResultRouter, SourceKind, SubmitOutcome};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    info!("Lookout launching...");

    let path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    lookout::CONFIG.store(Arc::new(config.clone()));
    info!(?config, "configuration loaded");

    let (router, queue) = ResultRouter::channel();
    let factory = Arc::new(LumaDetectorFactory::new(config.detector.luma_threshold));
    let pipeline = Pipeline::start(&config, factory, router)?;

    // Presentation context: everything the overlay sees arrives here, in order
    let presenter = tokio::task::spawn_blocking(move || {
        let mut overlay = ConsoleOverlay::default();
        queue.run(&mut overlay);
        overlay
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let sensor = match config.capture.source {
        SourceKind::Synthetic => spawn_synthetic(&config, pipeline.submitter(), stop_rx),
        SourceKind::V4l2 => spawn_v4l2(&config, pipeline.submitter(), stop_rx)?,
    };

    let mut toggle = signal(SignalKind::user_defined1())?;
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupt received");
                break;
            }
            Some(()) = toggle.recv() => {
                let previous = lookout::CONFIG.rcu(|current| {
                    let mut next = Config::clone(current);
                    next.detector.accelerated = !next.detector.accelerated;
                    next
                });
                let accelerated = !previous.detector.accelerated;
                info!(accelerated, "toggling accelerated detection");
                pipeline.set_accelerated(accelerated)?;
            }
            _ = stats_tick.tick() => {
                info!(stats = ?pipeline.stats(), "pipeline stats");
            }
        }
    }

    let _ = stop_tx.send(true);
    if let Err(err) = sensor.await {
        warn!(%err, "sensor task failed");
    }

    tokio::task::spawn_blocking(move || pipeline.shutdown()).await??;
    let overlay = presenter.await?;
    info!(
        notices = overlay.notices(),
        last_inference = overlay.inference_readout(),
        "Lookout shutting down"
    );
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lookout=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

/// Drive the test-pattern sensor at the configured frame rate
fn spawn_synthetic(
    config: &Config,
    submitter: FrameSubmitter,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut sensor = SyntheticSensor::new(&config.capture);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sensor.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(frame) = sensor.next_frame() else {
                        continue;
                    };
                    if submitter.submit(frame) == SubmitOutcome::Closed {
                        break;
                    }
                }
                _ = stop.changed() => break,
            }
        }
        info!("synthetic sensor stopped");
    })
}

#[cfg(feature = "v4l2")]
fn spawn_v4l2(
    config: &Config,
    submitter: FrameSubmitter,
    stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    use lookout::capture::V4l2Sensor;
    use lookout::utils;
    use tracing::error;

    let mut capture = config.capture.clone();
    if capture.device.is_empty() {
        utils::auto_detect_device()?.apply_to(&mut capture);
    }
    info!(device = %capture.device, format = ?capture.format, "using capture device");
    let mut sensor = V4l2Sensor::open(&capture.device, &capture)?;

    Ok(tokio::task::spawn_blocking(move || {
        while !*stop.borrow() {
            match sensor.next_frame() {
                Ok(frame) => {
                    if submitter.submit(frame) == SubmitOutcome::Closed {
                        break;
                    }
                }
                Err(e) => {
                    error!("capture error: {}", e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        info!("V4L2 sensor stopped");
    }))
}

#[cfg(not(feature = "v4l2"))]
fn spawn_v4l2(
    _config: &Config,
    _submitter: FrameSubmitter,
    _stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    use color_eyre::eyre::eyre;

    Err(eyre!("capture.source = \"v4l2\" needs a build with the `v4l2` feature"))
}
