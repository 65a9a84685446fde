use std::{collections::VecDeque, io::IoSlice};

use manifold_timing::Nanos;
use manifold_utils::safe_assert;

use crate::{
    buffer::{Data, GatherLimits},
    endpoint::Endpoint,
    error::{Error, Result},
    event::QueueContext,
    options::SendOptions,
};

/// Outcome record delivered to a send callback: what was attempted, when
/// it was enqueued, how long it sat, and what (if anything) killed it.
#[derive(Debug)]
pub struct SendContext {
    pub id: u64,
    pub enqueue_time: Nanos,
    pub latency: Nanos,
    pub error: Option<Error>,
}

pub type SendCallback = Box<dyn FnOnce(SendContext) + Send>;

/// A callback plus the context it must be fired with. Collected under the
/// queue lock, fired strictly after every lock is released.
pub type SendCompletion = (SendCallback, SendContext);

pub(crate) struct SendQueueEntry {
    pub id: u64,
    pub data: Data,
    /// Bytes of `data` already handed to the kernel.
    pub offset: usize,
    pub endpoint: Option<Endpoint>,
    pub deadline: Option<Nanos>,
    pub token: Option<u64>,
    pub enqueue_time: Nanos,
    pub callback: Option<SendCallback>,
    pub zero_copy: bool,
}

impl SendQueueEntry {
    #[inline]
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// Shape of the contiguous batch the caller should pass to one
/// scatter/gather syscall.
#[derive(Debug)]
pub struct BatchInfo {
    pub bytes: usize,
    pub entries: usize,
    pub endpoint: Option<Endpoint>,
    pub zero_copy: bool,
}

/// Ordered outgoing entries with latched, strictly alternating watermark
/// events.
///
/// `size` tracks untransmitted bytes and moves atomically with every list
/// mutation. `high_wanted` starts armed; the high event re-arms only after
/// the low event fires, so a consumer can never observe two highs (or two
/// lows) in a row.
pub struct SendQueue {
    entries: VecDeque<SendQueueEntry>,
    size: usize,
    low_watermark: usize,
    high_watermark: usize,
    high_wanted: bool,
    low_wanted: bool,
    next_id: u64,
}

impl SendQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            low_watermark: low_watermark.min(high_watermark),
            high_watermark,
            high_wanted: true,
            low_wanted: false,
            next_id: 1,
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
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn context(&self) -> QueueContext {
        QueueContext {
            size: self.size,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }

    /// Earliest entry deadline still pending, for timer arming.
    pub fn earliest_deadline(&self) -> Option<Nanos> {
        self.entries.iter().filter_map(|entry| entry.deadline).min()
    }

    /// Appends an entry. Returns its id and whether the high-watermark
    /// event latched; the caller delivers that event after it has let go
    /// of every lock, never synchronously into the enqueuer.
    pub fn enqueue(
        &mut self,
        data: Data,
        options: &SendOptions,
        callback: Option<SendCallback>,
        now: Nanos,
    ) -> (u64, bool) {
        let id = self.next_id;
        self.next_id += 1;

        self.size += data.len();
        self.entries.push_back(SendQueueEntry {
            id,
            data,
            offset: 0,
            endpoint: options.endpoint.clone(),
            deadline: options.deadline,
            token: options.token,
            enqueue_time: now,
            callback,
            zero_copy: options.zero_copy,
        });

        let fire_high = self.high_wanted && self.size >= self.high_watermark;
        if fire_high {
            self.high_wanted = false;
            self.low_wanted = true;
        }
        (id, fire_high)
    }

    /// Gathers the head entry plus the leading run of entries that can
    /// share a syscall with it: same destination, same zero-copy posture,
    /// within the buffer and byte caps. Only the head may be partially
    /// transmitted; its sent prefix is skipped.
    pub fn batch<'a>(
        &'a self,
        limits: &GatherLimits,
        out: &mut Vec<IoSlice<'a>>,
    ) -> Option<BatchInfo> {
        self.batch_limited(limits, usize::MAX, out)
    }

    /// Head entry only. Datagram sockets use this: coalescing entries
    /// would merge message boundaries.
    pub fn batch_head<'a>(
        &'a self,
        limits: &GatherLimits,
        out: &mut Vec<IoSlice<'a>>,
    ) -> Option<BatchInfo> {
        self.batch_limited(limits, 1, out)
    }

    fn batch_limited<'a>(
        &'a self,
        limits: &GatherLimits,
        max_entries: usize,
        out: &mut Vec<IoSlice<'a>>,
    ) -> Option<BatchInfo> {
        out.clear();
        let head = self.entries.front()?;

        let mut bytes = 0;
        let mut count = 0;
        for entry in &self.entries {
            if count >= max_entries {
                break;
            }
            if count > 0 &&
                (entry.endpoint != head.endpoint || entry.zero_copy != head.zero_copy)
            {
                break;
            }
            let skip = if count == 0 { entry.offset } else { 0 };
            let complete = entry.data.gather(skip, limits, &mut bytes, out);
            count += 1;
            if !complete {
                break;
            }
        }

        if out.is_empty() {
            return None;
        }
        Some(BatchInfo {
            bytes,
            entries: count,
            endpoint: head.endpoint.clone(),
            zero_copy: head.zero_copy,
        })
    }

    /// Fails the head entry (a datagram the kernel refused, for example)
    /// and reports whether the low watermark fired as a result.
    pub fn fail_front(
        &mut self,
        error: Error,
        now: Nanos,
        completions: &mut Vec<SendCompletion>,
    ) -> bool {
        if let Some(entry) = self.entries.pop_front() {
            self.size -= entry.remaining();
            if let Some(callback) = entry.callback {
                completions.push((callback, SendContext {
                    id: entry.id,
                    enqueue_time: entry.enqueue_time,
                    latency: now.saturating_sub(entry.enqueue_time),
                    error: Some(error),
                }));
            }
        }
        self.check_low()
    }

    /// Accounts `n` transmitted bytes against the queue front. Completed
    /// entries produce success completions. Returns true iff the low
    /// watermark event fires (size fell to/under the low mark while the
    /// low event was armed); the high side re-arms with it.
    pub fn acknowledge(
        &mut self,
        mut n: usize,
        now: Nanos,
        completions: &mut Vec<SendCompletion>,
    ) -> bool {
        while n > 0 {
            let Some(front) = self.entries.front_mut() else { break };
            let take = front.remaining().min(n);
            front.offset += take;
            self.size -= take;
            n -= take;

            if front.remaining() == 0 {
                if let Some(entry) = self.entries.pop_front() {
                    if let Some(callback) = entry.callback {
                        completions.push((callback, SendContext {
                            id: entry.id,
                            enqueue_time: entry.enqueue_time,
                            latency: now.saturating_sub(entry.enqueue_time),
                            error: None,
                        }));
                    }
                }
            }
        }
        safe_assert!(n == 0, "acknowledged more bytes than were queued");
        self.check_low()
    }

    /// Fails every still-queued entry whose deadline has passed with
    /// `Timeout`. The partially-transmitted head is exempt; its bytes are
    /// already on the wire.
    pub fn fail_expired(
        &mut self,
        now: Nanos,
        completions: &mut Vec<SendCompletion>,
    ) -> bool {
        self.remove_where(now, completions, Error::Timeout, |entry| {
            entry.deadline.is_some_and(|deadline| deadline <= now)
        })
    }

    /// Cancels entries carrying `token`. Idempotent; O(n) by design, queue
    /// depths stay small.
    pub fn cancel(
        &mut self,
        token: u64,
        now: Nanos,
        completions: &mut Vec<SendCompletion>,
    ) -> bool {
        self.remove_where(now, completions, Error::Canceled, |entry| entry.token == Some(token))
    }

    fn remove_where(
        &mut self,
        now: Nanos,
        completions: &mut Vec<SendCompletion>,
        error: Error,
        predicate: impl Fn(&SendQueueEntry) -> bool,
    ) -> bool {
        let mut index = 0;
        while index < self.entries.len() {
            let in_flight = index == 0 && self.entries[index].offset > 0;
            if !in_flight && predicate(&self.entries[index]) {
                if let Some(entry) = self.entries.remove(index) {
                    self.size -= entry.remaining();
                    if let Some(callback) = entry.callback {
                        completions.push((callback, SendContext {
                            id: entry.id,
                            enqueue_time: entry.enqueue_time,
                            latency: now.saturating_sub(entry.enqueue_time),
                            error: Some(error),
                        }));
                    }
                }
            } else {
                index += 1;
            }
        }
        self.check_low()
    }

    /// Empties the queue, failing everything with `error`. Used on
    /// shutdown-for-send and on socket-fatal errors; the caller announces
    /// the discard event, not a watermark.
    pub fn fail_all(
        &mut self,
        error: Error,
        now: Nanos,
        completions: &mut Vec<SendCompletion>,
    ) -> usize {
        let count = self.entries.len();
        while let Some(entry) = self.entries.pop_front() {
            if let Some(callback) = entry.callback {
                completions.push((callback, SendContext {
                    id: entry.id,
                    enqueue_time: entry.enqueue_time,
                    latency: now.saturating_sub(entry.enqueue_time),
                    error: Some(error),
                }));
            }
        }
        self.size = 0;
        count
    }

    fn check_low(&mut self) -> bool {
        if self.low_wanted && self.size <= self.low_watermark {
            self.low_wanted = false;
            self.high_wanted = true;
            return true;
        }
        false
    }
}
