use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use lace_core::ids::ConnectionId;
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};

use crate::frame;
use crate::manager::EventStreamManager;

/// Unregisters the connection when the response body is dropped, i.e. when
/// the browser goes away.
struct ConnectionGuard {
    manager: Arc<EventStreamManager>,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.remove_connection(&self.id);
    }
}

pin_project! {
    /// Response body of one SSE connection: queued frames, interleaved with
    /// keep-alive comments while idle. Ends when the manager closes the sink.
    pub struct ConnectionStream {
        #[pin]
        frames: ReceiverStream<Bytes>,
        #[pin]
        heartbeat: IntervalStream,
        guard: ConnectionGuard,
    }
}

impl ConnectionStream {
    pub fn new(
        rx: mpsc::Receiver<Bytes>,
        heartbeat: Duration,
        manager: Arc<EventStreamManager>,
        id: ConnectionId,
    ) -> Self {
        let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            frames: ReceiverStream::new(rx),
            heartbeat: IntervalStream::new(ticker),
            guard: ConnectionGuard { manager, id },
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.guard.id
    }
}

impl Stream for ConnectionStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.frames.poll_next(cx) {
            Poll::Ready(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }
        match this.heartbeat.poll_next(cx) {
            Poll::Ready(Some(_)) => Poll::Ready(Some(Ok(frame::keepalive_frame()))),
            _ => Poll::Pending,
        }
    }
}
