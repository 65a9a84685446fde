use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
};

use manifold_timing::Nanos;
use tracing::debug;

pub type TimerId = u64;

/// Handed to a timer callback at fire time. `drift` is how late the fire
/// is; never negative, since a timer only fires once `now >= deadline`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerContext {
    pub now: Nanos,
    pub deadline: Nanos,
    pub drift: Nanos,
}

pub type TimerCallback = Box<dyn FnMut(TimerContext) + Send>;

/// Periodicity and reporting flags for one timer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerOptions {
    /// A periodic timer reschedules itself atomically with firing, from
    /// the old deadline (not from `now`, so drift does not accumulate).
    pub period: Option<Nanos>,
    /// Log fires that happen measurably late.
    pub drift_report: bool,
}

struct TimerEntry {
    deadline: Nanos,
    options: TimerOptions,
    // Matches the heap key generation; stale heap keys are skipped.
    generation: u64,
    callback: TimerCallback,
}

/// Deadline-ordered timers for one driver thread.
///
/// Not shared: the owning driver is the only accessor, and cross-thread
/// scheduling posts a functor to that driver instead. Cancellation is lazy;
/// a cancelled entry's heap key is skipped when it surfaces.
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Nanos, u64, TimerId)>>,
    entries: HashMap<TimerId, TimerEntry>,
    next_generation: u64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), entries: HashMap::new(), next_generation: 0 }
    }

    /// Inserts a timer under a caller-allocated id. O(log n).
    pub fn schedule(
        &mut self,
        id: TimerId,
        deadline: Nanos,
        options: TimerOptions,
        callback: TimerCallback,
    ) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(id, TimerEntry { deadline, options, generation, callback });
        self.heap.push(Reverse((deadline, generation, id)));
    }

    /// Cancels a scheduled timer. Idempotent; returns true iff the timer
    /// was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Earliest live deadline, for the driver's wait timeout. Pops stale
    /// heap keys on the way.
    pub fn next_deadline(&mut self) -> Option<Nanos> {
        while let Some(Reverse((deadline, generation, id))) = self.heap.peek().copied() {
            match self.entries.get(&id) {
                Some(entry) if entry.generation == generation => return Some(deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Fires every timer with `deadline <= now`, up to `max` of them
    /// (zero meaning unlimited). Periodic timers are rescheduled before
    /// their callback runs; a rescheduled deadline still `<= now` fires
    /// again within the same drain, which is how same-tick reschedules are
    /// honoured up to the driver's cycle bound.
    pub fn drain_due(&mut self, now: Nanos, max: usize) -> usize {
        let mut fired = 0;

        while max == 0 || fired < max {
            let Some(Reverse((deadline, generation, id))) = self.heap.peek().copied() else {
                break;
            };
            if deadline > now {
                break;
            }
            self.heap.pop();

            match self.entries.get(&id) {
                Some(entry) if entry.generation == generation => {}
                _ => continue,
            }
            let Some(mut entry) = self.entries.remove(&id) else { continue };
            let context =
                TimerContext { now, deadline, drift: now.saturating_sub(deadline) };
            if entry.options.drift_report && context.drift > Nanos::ZERO {
                debug!(timer = id, drift = %context.drift, "timer fired late");
            }

            if let Some(period) = entry.options.period {
                let next = deadline.saturating_add(period);
                entry.deadline = next;
                entry.generation = self.next_generation;
                self.next_generation += 1;
                self.heap.push(Reverse((next, entry.generation, id)));
                (entry.callback)(context);
                // Re-inserted before the callback ran; only keep it if the
                // callback's thread of control did not cancel via a posted
                // functor (which runs later anyway).
                self.entries.insert(id, entry);
            } else {
                (entry.callback)(context);
            }

            fired += 1;
        }

        fired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn recording_callback(log: &Arc<Mutex<Vec<TimerContext>>>) -> TimerCallback {
        let log = Arc::clone(log);
        Box::new(move |context| log.lock().unwrap().push(context))
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.schedule(2, Nanos(200), TimerOptions::default(), recording_callback(&log));
        queue.schedule(1, Nanos(100), TimerOptions::default(), recording_callback(&log));
        queue.schedule(3, Nanos(300), TimerOptions::default(), recording_callback(&log));

        assert_eq!(queue.next_deadline(), Some(Nanos(100)));
        assert_eq!(queue.drain_due(Nanos(250), 0), 2);

        let contexts = log.lock().unwrap();
        assert_eq!(contexts[0].deadline, Nanos(100));
        assert_eq!(contexts[0].drift, Nanos(150));
        assert_eq!(contexts[1].deadline, Nanos(200));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_is_lazy_and_idempotent() {
        let mut queue = TimerQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.schedule(7, Nanos(100), TimerOptions::default(), recording_callback(&log));
        assert!(queue.cancel(7));
        assert!(!queue.cancel(7));

        assert_eq!(queue.next_deadline(), None);
        assert_eq!(queue.drain_due(Nanos(1000), 0), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn periodic_reschedules_from_deadline() {
        let mut queue = TimerQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let options = TimerOptions { period: Some(Nanos(100)), drift_report: false };
        queue.schedule(1, Nanos(100), options, recording_callback(&log));

        // Three periods elapsed at once: all fire within one drain.
        assert_eq!(queue.drain_due(Nanos(320), 0), 3);
        let deadlines: Vec<Nanos> = log.lock().unwrap().iter().map(|c| c.deadline).collect();
        assert_eq!(deadlines, vec![Nanos(100), Nanos(200), Nanos(300)]);
        assert_eq!(queue.next_deadline(), Some(Nanos(400)));
    }

    #[test]
    fn drain_cap_bounds_one_cycle() {
        let mut queue = TimerQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for id in 0..5 {
            queue.schedule(id, Nanos(10), TimerOptions::default(), recording_callback(&log));
        }
        assert_eq!(queue.drain_due(Nanos(10), 2), 2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain_due(Nanos(10), 0), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn reschedule_same_id_supersedes() {
        let mut queue = TimerQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.schedule(1, Nanos(100), TimerOptions::default(), recording_callback(&log));
        queue.schedule(1, Nanos(500), TimerOptions::default(), recording_callback(&log));

        // The stale generation for deadline 100 is skipped.
        assert_eq!(queue.drain_due(Nanos(200), 0), 0);
        assert_eq!(queue.next_deadline(), Some(Nanos(500)));
        assert_eq!(queue.drain_due(Nanos(500), 0), 1);
        assert_eq!(log.lock().unwrap()[0].drift, Nanos::ZERO);
    }
}
