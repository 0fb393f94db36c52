// portsplice/src/queue.rs
//
// Per-connection egress queue: an ordered FIFO of pending outbound chunks
// with a partial-send offset on the head. Bytes land here when a peer's
// socket (or TLS session) cannot take them right now; the owning writer task
// drains the queue on write-readiness.
//
// The queue is byte-bounded. Crossing the ceiling is reported to the caller,
// which applies the configured overflow policy (stall the reader, or drop
// the flow). The chunk that crosses the line is still accepted so no bytes
// are ever silently discarded.

use std::collections::VecDeque;

use bytes::Bytes;

struct Chunk {
    data: Bytes,
    off:  usize,
}

pub struct XmitQueue {
    chunks: VecDeque<Chunk>,
    queued: usize,
    limit:  usize,
}

/// Result of appending to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// Accepted, but the queue is now at or over its ceiling.
    Over,
}

impl XmitQueue {
    pub fn new(limit: usize) -> Self {
        Self { chunks: VecDeque::new(), queued: 0, limit }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes currently parked.
    pub fn queued_bytes(&self) -> usize {
        self.queued
    }

    pub fn over_limit(&self) -> bool {
        self.queued >= self.limit
    }

    pub fn push(&mut self, data: Bytes) -> Push {
        self.queued += data.len();
        self.chunks.push_back(Chunk { data, off: 0 });
        if self.over_limit() { Push::Over } else { Push::Queued }
    }

    /// The unsent remainder of the head chunk. The returned `Bytes` is a
    /// cheap refcounted slice, so callers can release the queue lock borrow
    /// before attempting the send.
    pub fn head(&self) -> Option<Bytes> {
        self.chunks.front().map(|c| c.data.slice(c.off..))
    }

    /// Record `n` bytes of the head as sent, popping it once exhausted.
    pub fn advance(&mut self, n: usize) {
        let done = {
            let head = self.chunks.front_mut().expect("advance on empty queue");
            debug_assert!(n <= head.data.len() - head.off);
            head.off += n;
            head.off == head.data.len()
        };
        self.queued -= n;
        if done {
            self.chunks.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.queued = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_with_partial_sends() {
        let mut q = XmitQueue::new(1024);
        q.push(Bytes::from_static(b"hello "));
        q.push(Bytes::from_static(b"world"));
        assert_eq!(q.queued_bytes(), 11);

        // Partial send of the head keeps the remainder in front.
        assert_eq!(&q.head().unwrap()[..], b"hello ");
        q.advance(3);
        assert_eq!(&q.head().unwrap()[..], b"lo ");
        q.advance(3);

        assert_eq!(&q.head().unwrap()[..], b"world");
        q.advance(5);
        assert!(q.is_empty());
        assert_eq!(q.queued_bytes(), 0);
    }

    #[test]
    fn ceiling_is_reported_not_enforced() {
        let mut q = XmitQueue::new(8);
        assert_eq!(q.push(Bytes::from_static(b"1234")), Push::Queued);
        assert_eq!(q.push(Bytes::from_static(b"56789")), Push::Over);
        // The crossing chunk was still accepted.
        assert_eq!(q.queued_bytes(), 9);
        assert!(q.over_limit());

        q.advance(4);
        q.advance(5);
        assert!(!q.over_limit());
        assert!(q.is_empty());
    }

    #[test]
    fn clear_resets_accounting() {
        let mut q = XmitQueue::new(16);
        q.push(Bytes::from_static(b"abc"));
        q.advance(1);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.queued_bytes(), 0);
        assert!(q.head().is_none());
    }
}
