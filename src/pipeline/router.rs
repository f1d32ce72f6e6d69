//! Hand-off of detection results to the presentation context

use std::time::Duration;

use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::capture::{ConvertError, PixelFormat};
use crate::detect::{BoundingBox, DetectorError};

/// Outcome of one detector run, tagged with the source frame's timestamp
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionEvent {
    Detected {
        timestamp: Duration,
        boxes: Vec<BoundingBox>,
        inference_time: Duration,
    },
    /// The detector ran and found nothing
    Empty { timestamp: Duration },
}

impl DetectionEvent {
    pub fn timestamp(&self) -> Duration {
        match self {
            Self::Detected { timestamp, .. } | Self::Empty { timestamp } => *timestamp,
        }
    }
}

/// Operator-facing conditions, reported once rather than per frame
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    UnsupportedFormat(PixelFormat),
    ConversionFailed(ConvertError),
    DetectorUnavailable(DetectorError),
}

impl From<ConvertError> for Notice {
    fn from(error: ConvertError) -> Self {
        match error {
            ConvertError::UnsupportedFormat(format) => Self::UnsupportedFormat(format),
            other => Self::ConversionFailed(other),
        }
    }
}

/// Presentation-side consumer. Called only on the presentation context.
pub trait DetectionListener {
    fn on_detect(&mut self, timestamp: Duration, boxes: &[BoundingBox], inference_time: Duration);

    fn on_empty_detect(&mut self, timestamp: Duration);

    fn on_notice(&mut self, _notice: &Notice) {}
}

#[derive(Debug)]
enum Message {
    Event(DetectionEvent),
    Notice(Notice),
}

/// Sending half, usable from any thread. Delivery is FIFO; nothing is merged
/// or reordered.
#[derive(Debug, Clone)]
pub struct ResultRouter {
    tx: Sender<Message>,
}

/// Receiving half, owned by the presentation context
#[derive(Debug)]
pub struct PresentationQueue {
    rx: Receiver<Message>,
}

impl ResultRouter {
    pub fn channel() -> (ResultRouter, PresentationQueue) {
        let (tx, rx) = flume::unbounded();
        (ResultRouter { tx }, PresentationQueue { rx })
    }

    /// Queue a detection result. Returns false when the presentation side is
    /// gone.
    pub fn route(&self, event: DetectionEvent) -> bool {
        trace!(timestamp = ?event.timestamp(), "routing detection event");
        self.send(Message::Event(event))
    }

    /// Queue an operator notice
    pub fn notify(&self, notice: Notice) -> bool {
        self.send(Message::Notice(notice))
    }

    fn send(&self, message: Message) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(_) => {
                debug!("presentation queue closed, dropping message");
                false
            }
        }
    }
}

impl PresentationQueue {
    /// Deliver everything until every [`ResultRouter`] is dropped.
    pub fn run<L: DetectionListener + ?Sized>(self, listener: &mut L) {
        for message in self.rx.iter() {
            deliver(listener, message);
        }
        debug!("presentation queue drained");
    }

    /// Deliver whatever is queued without blocking; for UIs polling from
    /// their own loop. Returns how many messages were delivered.
    pub fn drain<L: DetectionListener + ?Sized>(&self, listener: &mut L) -> usize {
        let mut delivered = 0;
        for message in self.rx.try_iter() {
            deliver(listener, message);
            delivered += 1;
        }
        delivered
    }

    /// Wait up to `timeout` for one message and deliver it
    pub fn deliver_next<L: DetectionListener + ?Sized>(
        &self,
        listener: &mut L,
        timeout: Duration,
    ) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => {
                deliver(listener, message);
                true
            }
            Err(_) => false,
        }
    }
}

fn deliver<L: DetectionListener + ?Sized>(listener: &mut L, message: Message) {
    match message {
        Message::Event(DetectionEvent::Detected {
            timestamp,
            boxes,
            inference_time,
        }) => listener.on_detect(timestamp, &boxes, inference_time),
        Message::Event(DetectionEvent::Empty { timestamp }) => listener.on_empty_detect(timestamp),
        Message::Notice(notice) => listener.on_notice(&notice),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct Log(Vec<String>);

    impl DetectionListener for Log {
        fn on_detect(&mut self, timestamp: Duration, boxes: &[BoundingBox], _: Duration) {
            self.0.push(format!("detect {} {}", timestamp.as_millis(), boxes.len()));
        }

        fn on_empty_detect(&mut self, timestamp: Duration) {
            self.0.push(format!("empty {}", timestamp.as_millis()));
        }

        fn on_notice(&mut self, notice: &Notice) {
            self.0.push(format!("notice {notice:?}"));
        }
    }

    #[test]
    fn events_arrive_in_routing_order_across_threads() {
        let (router, queue) = ResultRouter::channel();

        let producer = thread::spawn(move || {
            for ms in [10, 20, 30] {
                let timestamp = Duration::from_millis(ms);
                if ms == 20 {
                    router.route(DetectionEvent::Empty { timestamp });
                } else {
                    router.route(DetectionEvent::Detected {
                        timestamp,
                        boxes: vec![BoundingBox::from_corners(0.0, 0.0, 1.0, 1.0, 0.9, 0, "x")],
                        inference_time: Duration::from_millis(4),
                    });
                }
            }
        });

        let mut log = Log::default();
        queue.run(&mut log);
        producer.join().unwrap();

        assert_eq!(log.0, vec!["detect 10 1", "empty 20", "detect 30 1"]);
    }

    #[test]
    fn route_reports_closed_presentation() {
        let (router, queue) = ResultRouter::channel();
        drop(queue);
        assert!(!router.route(DetectionEvent::Empty {
            timestamp: Duration::ZERO
        }));
    }

    #[test]
    fn convert_errors_map_to_notices() {
        assert_eq!(
            Notice::from(ConvertError::UnsupportedFormat(PixelFormat::Other(3))),
            Notice::UnsupportedFormat(PixelFormat::Other(3))
        );
        let mut log = Log::default();
        let (router, queue) = ResultRouter::channel();
        router.notify(Notice::DetectorUnavailable(DetectorError::Unavailable));
        assert_eq!(queue.drain(&mut log), 1);
        assert_eq!(log.0.len(), 1);
    }
}
