//! Console fan-out for engine output.
//!
//! Each instance owns one [`ConsoleHub`]. Engine stdout/stderr, the serial
//! console socket and adapter lifecycle notes are published into it; any
//! number of [`ConsoleStream`]s can attach and detach at will. A late
//! subscriber first receives the retained backlog.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tracing::trace;

/// Maximum bytes retained for late subscribers.
const BACKLOG_BYTES: usize = 64 * 1024;
/// Per-subscriber queue depth (chunks). Must hold a full backlog replay.
const SUBSCRIBER_QUEUE: usize = 512;

#[derive(Default)]
struct HubState {
    backlog: VecDeque<Bytes>,
    backlog_bytes: usize,
    subscribers: Vec<mpsc::Sender<Bytes>>,
    closed: bool,
}

/// Multi-subscriber console buffer for one instance.
#[derive(Clone, Default)]
pub struct ConsoleHub {
    inner: Arc<Mutex<HubState>>,
}

impl ConsoleHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish a chunk of console output.
    pub fn publish(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.closed {
            return;
        }

        state.backlog_bytes += chunk.len();
        state.backlog.push_back(chunk.clone());
        while state.backlog_bytes > BACKLOG_BYTES || state.backlog.len() > SUBSCRIBER_QUEUE {
            match state.backlog.pop_front() {
                Some(old) => state.backlog_bytes -= old.len(),
                None => break,
            }
        }

        state.subscribers.retain(|tx| match tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("console subscriber lagging, dropping chunk");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Publish a broker note as its own line.
    pub fn note(&self, line: &str) {
        self.publish(Bytes::from(format!("[virserver] {line}\n")));
    }

    /// Attach a new reader. It sees the backlog, then live output.
    pub fn subscribe(&self) -> ConsoleStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut state = self.lock();
        for chunk in &state.backlog {
            let _ = tx.try_send(chunk.clone());
        }
        if !state.closed {
            state.subscribers.push(tx);
        }
        ConsoleStream {
            rx,
            pending: Bytes::new(),
        }
    }

    /// End every stream. Further output is discarded.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Number of currently attached readers.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

impl std::fmt::Debug for ConsoleHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ConsoleHub")
            .field("backlog_bytes", &state.backlog_bytes)
            .field("subscribers", &state.subscribers.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// A reader attached to an instance console.
///
/// Yields chunks through [`recv`](ConsoleStream::recv) or bytes through
/// [`AsyncRead`]. Reaches end-of-stream when the instance is destroyed.
#[derive(Debug)]
pub struct ConsoleStream {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl ConsoleStream {
    /// Next chunk of output, or `None` once the console is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if !self.pending.is_empty() {
            return Some(std::mem::take(&mut self.pending));
        }
        self.rx.recv().await
    }
}

impl AsyncRead for ConsoleStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_late_subscriber_sees_backlog() {
        let hub = ConsoleHub::new();
        hub.publish(Bytes::from_static(b"boot\n"));
        let mut stream = hub.subscribe();
        hub.publish(Bytes::from_static(b"ready\n"));

        assert_eq!(stream.recv().await.as_deref(), Some(&b"boot\n"[..]));
        assert_eq!(stream.recv().await.as_deref(), Some(&b"ready\n"[..]));
    }

    #[tokio::test]
    async fn test_detach_does_not_affect_other_readers() {
        let hub = ConsoleHub::new();
        let first = hub.subscribe();
        let mut second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        drop(first);
        hub.publish(Bytes::from_static(b"still here"));
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(second.recv().await.as_deref(), Some(&b"still here"[..]));
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let hub = ConsoleHub::new();
        let mut stream = hub.subscribe();
        hub.note("powered off");
        hub.close();

        let mut text = String::new();
        stream
            .read_to_string(&mut text)
            .await
            .expect("read console");
        assert_eq!(text, "[virserver] powered off\n");
    }

    #[test]
    fn test_backlog_is_bounded() {
        let hub = ConsoleHub::new();
        for _ in 0..100 {
            hub.publish(Bytes::from(vec![b'x'; 4096]));
        }
        let state = hub.lock();
        assert!(state.backlog_bytes <= BACKLOG_BYTES);
    }
}
