//! Pull-style buffer between the websocket transport and ingestion.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Source of raw combined-stream envelopes.
///
/// `pop` never blocks: `None` means nothing is ready and the caller should
/// idle briefly before polling again.
pub trait FeedBuffer: Send + Sync {
    fn pop(&self) -> Option<String>;

    /// Messages received but not yet popped (the backlog).
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the producer has stopped for good.
    fn is_closed(&self) -> bool;
}

/// FIFO shared by every transport connection and the ingestion loop.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    queue: Mutex<VecDeque<String>>,
    closed: AtomicBool,
    pushed: AtomicU64,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: String) {
        self.queue.lock().push_back(message);
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop accepting the buffer as live; queued messages can still be popped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn total_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

impl FeedBuffer for StreamBuffer {
    fn pop(&self) -> Option<String> {
        self.queue.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_close() {
        let buffer = StreamBuffer::new();
        assert!(buffer.pop().is_none());

        buffer.push("a".into());
        buffer.push("b".into());
        assert_eq!(buffer.len(), 2);
        buffer.close();

        assert!(buffer.is_closed());
        assert_eq!(buffer.pop().as_deref(), Some("a"));
        assert_eq!(buffer.pop().as_deref(), Some("b"));
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_pushed(), 2);
    }
}
