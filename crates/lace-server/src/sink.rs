use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::SendError;

/// Output side of one SSE connection.
///
/// `enqueue` must not block: the manager calls it while fanning a frame out to
/// every connection. Any `Err` marks the connection dead.
pub trait EventSink: Send + Sync {
    fn enqueue(&self, frame: Bytes) -> Result<(), SendError>;

    /// Release the underlying stream. Called at most once per connection.
    fn close(&self);

    /// Notification that the connection is being torn down because of `reason`.
    fn error(&self, reason: &str) {
        tracing::debug!(reason, "event sink error");
    }
}

/// Sink backed by a bounded channel whose receiver feeds an HTTP response body.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl ChannelSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl EventSink for ChannelSink {
    fn enqueue(&self, frame: Bytes) -> Result<(), SendError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(SendError::Closed)?;
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn close(&self) {
        // Dropping the sender ends the receiver once buffered frames drain.
        self.tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_order() {
        let (sink, mut rx) = ChannelSink::channel(4);
        sink.enqueue(Bytes::from_static(b"one")).unwrap();
        sink.enqueue(Bytes::from_static(b"two")).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"two"));
    }

    #[test]
    fn full_queue_is_an_error() {
        let (sink, _rx) = ChannelSink::channel(1);
        sink.enqueue(Bytes::from_static(b"a")).unwrap();
        assert_eq!(sink.enqueue(Bytes::from_static(b"b")), Err(SendError::Full));
    }

    #[test]
    fn dropped_receiver_is_closed() {
        let (sink, rx) = ChannelSink::channel(4);
        drop(rx);
        assert_eq!(sink.enqueue(Bytes::from_static(b"a")), Err(SendError::Closed));
    }

    #[test]
    fn close_drains_then_ends() {
        let (sink, mut rx) = ChannelSink::channel(4);
        sink.enqueue(Bytes::from_static(b"last")).unwrap();
        sink.close();

        assert_eq!(sink.enqueue(Bytes::from_static(b"late")), Err(SendError::Closed));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"last"));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
