use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::error::TransportError;
use crate::models::Frame;

pub type TransportErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// Outbound half of a socket. Connections and the router write frames here;
/// the socket writer task drains them.
#[derive(Clone)]
pub struct Outbox {
    tx: UnboundedSender<Frame>,
    reporter: TransportReporter,
}

impl Outbox {
    pub fn new(tx: UnboundedSender<Frame>) -> Self {
        Self {
            tx,
            reporter: TransportReporter::default(),
        }
    }

    /// Called for every frame that could not be queued or written to the
    /// socket. A failed send never tears the connection down on its own.
    pub fn on_error(mut self, callback: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.reporter.on_error = Some(Arc::new(callback));
        self
    }

    /// Handle for the socket writer, which reports its own send failures
    /// through the same callback.
    pub fn reporter(&self) -> TransportReporter {
        self.reporter.clone()
    }

    pub fn push(&self, frame: Frame) -> bool {
        let topic = frame.topic.clone();
        let event = frame.event.clone();
        if self.tx.send(frame).is_ok() {
            return true;
        }
        self.reporter.report(TransportError {
            topic,
            event,
            reason: "socket writer closed".to_string(),
        });
        false
    }
}

#[derive(Clone, Default)]
pub struct TransportReporter {
    on_error: Option<TransportErrorCallback>,
}

impl TransportReporter {
    pub fn report(&self, error: TransportError) {
        warn!(error = %error, "dropping outbound frame");
        if let Some(callback) = &self.on_error {
            callback(&error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[test]
    fn failed_send_reports_through_callback() {
        let (tx, rx) = mpsc::unbounded_channel();
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let outbox = Outbox::new(tx).on_error(move |e| {
            assert_eq!(e.event, "diff");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let frame = Frame::push(None, "lv:1", "diff", json!({}));
        assert!(outbox.push(frame.clone()));
        drop(rx);
        assert!(!outbox.push(frame));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reporter_shares_the_outbox_callback() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let outbox = Outbox::new(tx).on_error(move |e| {
            assert_eq!(e.reason, "connection reset");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        outbox.reporter().report(TransportError {
            topic: "lv:1".to_string(),
            event: "diff".to_string(),
            reason: "connection reset".to_string(),
        });
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }
}
