use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Bounded frame channel with a drop-oldest overflow policy. Producers never
/// block: pushing into a full queue evicts the oldest frame, favoring recency
/// over completeness on the real-time paths.
pub(crate) fn frame_queue(capacity: usize) -> (FrameSender, FrameReceiver) {
    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity),
        state: Mutex::new(CloseState::Open),
        readable: Notify::new(),
        senders: AtomicUsize::new(1),
    });
    (
        FrameSender {
            shared: shared.clone(),
        },
        FrameReceiver { shared },
    )
}

enum CloseState {
    Open,
    Eof,
    Failed(io::ErrorKind, String),
}

struct Shared {
    queue: ArrayQueue<BytesMut>,
    state: Mutex<CloseState>,
    readable: Notify,
    senders: AtomicUsize,
}

impl Shared {
    fn is_open(&self) -> bool {
        matches!(*self.state.lock(), CloseState::Open)
    }
}

pub(crate) struct FrameSender {
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Enqueues a frame, evicting the oldest one if the queue is full.
    /// Returns `Err` with the frame if the receiving side is already closed.
    pub(crate) fn push(&self, frame: BytesMut) -> Result<(), BytesMut> {
        if !self.shared.is_open() {
            return Err(frame);
        }
        if let Some(evicted) = self.shared.queue.force_push(frame) {
            log::trace!("frame queue full, dropped oldest frame ({} bytes)", evicted.len());
        }
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Marks clean end-of-stream. Frames already queued are still delivered.
    pub(crate) fn close(&self) {
        let mut state = self.shared.state.lock();
        if matches!(*state, CloseState::Open) {
            *state = CloseState::Eof;
        }
        drop(state);
        self.shared.readable.notify_one();
    }

    /// Closes the queue with an error that the receiver observes after
    /// draining the frames already queued.
    pub(crate) fn close_with(&self, error: io::Error) {
        let mut state = self.shared.state.lock();
        if matches!(*state, CloseState::Open) {
            *state = CloseState::Failed(error.kind(), error.to_string());
        }
        drop(state);
        self.shared.readable.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        !self.shared.is_open()
    }
}

impl Clone for FrameSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        FrameSender {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last sender gone without an explicit close means the producing
            // task died; surface that as an error rather than hanging.
            let mut state = self.shared.state.lock();
            if matches!(*state, CloseState::Open) {
                *state = CloseState::Failed(
                    io::ErrorKind::UnexpectedEof,
                    "frame producer dropped".into(),
                );
            }
            drop(state);
            self.shared.readable.notify_one();
        }
    }
}

pub(crate) struct FrameReceiver {
    shared: Arc<Shared>,
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        // A vanished consumer turns further pushes into errors.
        let mut state = self.shared.state.lock();
        if matches!(*state, CloseState::Open) {
            *state = CloseState::Failed(io::ErrorKind::BrokenPipe, "frame consumer dropped".into());
        }
    }
}

impl FrameReceiver {
    /// Dequeues the next frame. `Ok(None)` is clean end-of-stream; an error
    /// is only reported once every queued frame has been drained.
    pub(crate) async fn pop(&self) -> io::Result<Option<BytesMut>> {
        loop {
            let notified = self.shared.readable.notified();
            if let Some(frame) = self.shared.queue.pop() {
                return Ok(Some(frame));
            }
            match &*self.shared.state.lock() {
                CloseState::Open => {}
                CloseState::Eof => return Ok(None),
                CloseState::Failed(kind, message) => {
                    return Err(io::Error::new(*kind, message.clone()))
                }
            }
            notified.await;
        }
    }
}
