use std::collections::VecDeque;

use crate::{
    buffer::Segment,
    endpoint::Endpoint,
    error::{Error, Result},
    event::QueueContext,
};

/// What a push into the queue latched, for the session to announce after
/// releasing its lock. `apply_flow_control` asks the driver to disarm
/// readability until the consumer catches up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    pub fire_low: bool,
    pub fire_high: bool,
    pub apply_flow_control: bool,
}

/// Bytes (or one whole message) handed to the consumer, plus what the
/// delivery un-latched.
#[derive(Debug, PartialEq, Eq)]
pub struct TakeOutcome {
    pub bytes: Vec<u8>,
    pub endpoint: Option<Endpoint>,
    /// Flow control released by this call: the driver re-arms readability
    /// and the session announces the relaxed event.
    pub relax_flow_control: bool,
}

enum Store {
    Stream { chunks: VecDeque<Segment>, head_offset: usize },
    Datagram { messages: VecDeque<(Segment, Option<Endpoint>)> },
}

/// Incoming bytes buffered between the socket and the consumer.
///
/// Stream mode accumulates a byte sequence; datagram mode holds discrete
/// messages with their senders, and `take` never fragments one. Delivery
/// obeys the low watermark; crossing the high watermark latches flow
/// control until the consumer drains back to the low mark.
pub struct ReceiveQueue {
    store: Store,
    size: usize,
    low_watermark: usize,
    high_watermark: usize,
    low_wanted: bool,
    flow_controlled: bool,
}

impl ReceiveQueue {
    pub fn new_stream(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            store: Store::Stream { chunks: VecDeque::new(), head_offset: 0 },
            size: 0,
            low_watermark: low_watermark.min(high_watermark),
            high_watermark,
            low_wanted: true,
            flow_controlled: false,
        }
    }

    pub fn new_datagram(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            store: Store::Datagram { messages: VecDeque::new() },
            size: 0,
            low_watermark: low_watermark.min(high_watermark),
            high_watermark,
            low_wanted: true,
            flow_controlled: false,
        }
    }

    pub fn set_watermarks(&mut self, low: usize, high: usize) -> Result<()> {
        if low > high {
            return Err(Error::Invalid);
        }
        self.low_watermark = low;
        self.high_watermark = high;
        Ok(())
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    pub fn is_flow_controlled(&self) -> bool {
        self.flow_controlled
    }

    pub fn context(&self) -> QueueContext {
        QueueContext {
            size: self.size,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self.store, Store::Datagram { .. })
    }

    /// Appends bytes read off a stream socket.
    pub fn push_segment(&mut self, segment: Segment) -> PushOutcome {
        debug_assert!(!segment.is_empty());
        let Store::Stream { chunks, .. } = &mut self.store else {
            return PushOutcome::default();
        };
        self.size += segment.len();
        chunks.push_back(segment);
        self.after_push()
    }

    /// Appends one datagram with its sender.
    pub fn push_message(&mut self, segment: Segment, sender: Option<Endpoint>) -> PushOutcome {
        let Store::Datagram { messages } = &mut self.store else {
            return PushOutcome::default();
        };
        self.size += segment.len();
        messages.push_back((segment, sender));
        self.after_push()
    }

    fn after_push(&mut self) -> PushOutcome {
        let mut outcome = PushOutcome::default();

        if self.low_wanted && self.size >= self.low_watermark {
            self.low_wanted = false;
            outcome.fire_low = true;
        }
        if !self.flow_controlled && self.size >= self.high_watermark {
            self.flow_controlled = true;
            outcome.fire_high = true;
            outcome.apply_flow_control = true;
        }
        outcome
    }

    /// Delivers between `min` and `max` bytes once available, or a whole
    /// message in datagram mode. `half_closed` relaxes the minimum so
    /// residue drains after the peer shut down; an empty queue then reports
    /// `Eof` instead of `WouldBlock`.
    pub fn take(&mut self, min: usize, max: usize, half_closed: bool) -> Result<TakeOutcome> {
        if self.size == 0 {
            return Err(if half_closed { Error::Eof } else { Error::WouldBlock });
        }

        let outcome = match &mut self.store {
            Store::Stream { chunks, head_offset } => {
                if self.size < min && !half_closed {
                    return Err(Error::WouldBlock);
                }
                let want = self.size.min(max);
                let mut bytes = Vec::with_capacity(want);
                while bytes.len() < want {
                    let Some(front) = chunks.front() else { break };
                    let available = &front.as_slice()[*head_offset..];
                    let take = available.len().min(want - bytes.len());
                    bytes.extend_from_slice(&available[..take]);
                    if take == available.len() {
                        chunks.pop_front();
                        *head_offset = 0;
                    } else {
                        *head_offset += take;
                    }
                }
                self.size -= bytes.len();
                TakeOutcome { bytes, endpoint: None, relax_flow_control: false }
            }
            Store::Datagram { messages } => {
                // Whole messages only; min/max never split a datagram.
                let Some((segment, sender)) = messages.pop_front() else {
                    return Err(Error::WouldBlock);
                };
                self.size -= segment.len();
                TakeOutcome {
                    bytes: segment.as_slice().to_vec(),
                    endpoint: sender,
                    relax_flow_control: false,
                }
            }
        };

        let mut outcome = outcome;
        if self.size < self.low_watermark {
            self.low_wanted = true;
        }
        if self.flow_controlled && self.size <= self.low_watermark {
            self.flow_controlled = false;
            outcome.relax_flow_control = true;
        }
        Ok(outcome)
    }

    /// Drops everything buffered; returns the byte count discarded. Used
    /// when a full close abandons undelivered residue.
    pub fn discard(&mut self) -> usize {
        let dropped = self.size;
        match &mut self.store {
            Store::Stream { chunks, head_offset } => {
                chunks.clear();
                *head_offset = 0;
            }
            Store::Datagram { messages } => messages.clear(),
        }
        self.size = 0;
        dropped
    }

    /// A half-closed queue is drained only once its residue is gone.
    pub fn is_drained(&self, recv_shut: bool) -> bool {
        recv_shut && self.size == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(bytes: &[u8]) -> Segment {
        Segment::from_slice(bytes)
    }

    #[test]
    fn low_watermark_gates_delivery() {
        let mut queue = ReceiveQueue::new_stream(4, 1024);

        let outcome = queue.push_segment(segment(b"ab"));
        assert!(!outcome.fire_low);
        assert_eq!(queue.take(4, 1024, false), Err(Error::WouldBlock));

        let outcome = queue.push_segment(segment(b"cd"));
        assert!(outcome.fire_low);

        let taken = queue.take(4, 1024, false).unwrap();
        assert_eq!(taken.bytes, b"abcd");
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn ready_event_fires_once_per_crossing() {
        let mut queue = ReceiveQueue::new_stream(1, 1024);
        assert!(queue.push_segment(segment(b"a")).fire_low);
        // Still above the low mark: no second event.
        assert!(!queue.push_segment(segment(b"b")).fire_low);

        queue.take(1, 64, false).unwrap();
        queue.take(1, 64, false).unwrap();
        // Drained below the mark: the next crossing announces again.
        assert!(queue.push_segment(segment(b"c")).fire_low);
    }

    #[test]
    fn flow_control_applies_and_relaxes() {
        let mut queue = ReceiveQueue::new_stream(2, 8);

        let outcome = queue.push_segment(segment(b"0123456789"));
        assert!(outcome.fire_high);
        assert!(outcome.apply_flow_control);
        assert!(queue.is_flow_controlled());

        // Drain down to the low mark: exactly one relax.
        let taken = queue.take(1, 8, false).unwrap();
        assert_eq!(taken.bytes.len(), 8);
        assert!(taken.relax_flow_control);
        assert!(!queue.is_flow_controlled());

        let taken = queue.take(1, 8, false).unwrap();
        assert!(!taken.relax_flow_control);
    }

    #[test]
    fn exact_transfer_bounds() {
        // min == max must deliver exactly that many bytes whenever
        // available.
        let mut queue = ReceiveQueue::new_stream(1, 1024);
        queue.push_segment(segment(b"abcdefgh"));

        for expected in [b"abcd".as_slice(), b"efgh".as_slice()] {
            let taken = queue.take(4, 4, false).unwrap();
            assert_eq!(taken.bytes, expected);
        }
        assert_eq!(queue.take(4, 4, false), Err(Error::WouldBlock));
    }

    #[test]
    fn half_closed_residue_still_delivers() {
        let mut queue = ReceiveQueue::new_stream(64, 1024);
        queue.push_segment(segment(b"tail"));

        // Below the low watermark, but the peer is gone: residue drains.
        let taken = queue.take(64, 1024, true).unwrap();
        assert_eq!(taken.bytes, b"tail");
        assert!(queue.is_drained(true));
        assert_eq!(queue.take(1, 64, true), Err(Error::Eof));
    }

    #[test]
    fn datagrams_never_fragment() {
        let mut queue = ReceiveQueue::new_datagram(1, 1024);
        let from: Endpoint = "127.0.0.1:5353".parse().unwrap();
        queue.push_message(segment(b"first-message"), Some(from.clone()));
        queue.push_message(segment(b"second"), None);

        let taken = queue.take(1, 4, false).unwrap();
        assert_eq!(taken.bytes, b"first-message");
        assert_eq!(taken.endpoint, Some(from));

        let taken = queue.take(1, 1024, false).unwrap();
        assert_eq!(taken.bytes, b"second");
        assert_eq!(taken.endpoint, None);
    }

    #[test]
    fn discard_reports_dropped_bytes() {
        let mut queue = ReceiveQueue::new_stream(1, 1024);
        queue.push_segment(segment(b"abc"));
        queue.push_segment(segment(b"defg"));
        assert_eq!(queue.discard(), 7);
        assert!(queue.is_empty());
    }

    #[test]
    fn partial_chunk_consumption_keeps_order() {
        let mut queue = ReceiveQueue::new_stream(1, 1024);
        queue.push_segment(segment(b"abcdef"));
        queue.push_segment(segment(b"ghij"));

        assert_eq!(queue.take(1, 4, false).unwrap().bytes, b"abcd");
        assert_eq!(queue.take(1, 4, false).unwrap().bytes, b"efgh");
        assert_eq!(queue.take(1, 4, false).unwrap().bytes, b"ij");
    }
}
