use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use manifold_utils::safe_panic;

/// Deferred unit of work. Fire-and-forget: it runs once on the owning
/// driver thread and frees itself; nothing holds a handle to it.
pub type Task = Box<dyn FnOnce() + Send>;

/// Where a strand goes when it has work: the driver's ready list. The
/// driver wakes its multiplexer if it is parked in a wait.
pub trait Executor: Send + Sync {
    fn submit(&self, strand: Strand);
}

/// Single-consumer FIFO of functors pinned to one driver.
///
/// Functors execute in submission order; two functors submitted from the
/// same thread are never reordered. A drain runs only the functors present
/// when it started, so one cycle does bounded work. At most one thread
/// drains at a time, which is what makes the strand a per-socket lock
/// without a lock.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

struct StrandInner {
    queue: Mutex<VecDeque<Task>>,
    // True while some thread owns the drain or a submission is pending.
    running: AtomicBool,
    executor: Arc<dyn Executor>,
}

impl Strand {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                executor,
            }),
        }
    }

    /// Appends one functor; callable from any thread. Schedules the strand
    /// with its executor iff it was idle.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        let must_schedule = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            queue.push_back(Box::new(task));
            !self.inner.running.swap(true, Ordering::AcqRel)
        };
        if must_schedule {
            self.inner.executor.submit(self.clone());
        }
    }

    /// Atomically appends a batch of already-queued work followed by one
    /// functor, all under a single lock acquisition.
    pub fn move_and_execute(
        &self,
        batch: &mut VecDeque<Task>,
        task: impl FnOnce() + Send + 'static,
    ) {
        let must_schedule = {
            let mut queue = self.inner.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            queue.append(batch);
            queue.push_back(Box::new(task));
            !self.inner.running.swap(true, Ordering::AcqRel)
        };
        if must_schedule {
            self.inner.executor.submit(self.clone());
        }
    }

    /// Runs the functors queued at the start of the drain. Functors
    /// scheduled during the drain wait for the next cycle; if any remain,
    /// the strand resubmits itself.
    pub fn drain(&self) {
        let budget =
            self.inner.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len();

        for _ in 0..budget {
            let task = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop_front();
            match task {
                Some(task) => task(),
                None => {
                    safe_panic!("strand drained concurrently");
                    break;
                }
            }
        }

        // The idle transition must happen under the queue lock: a concurrent
        // execute() that pushed after our budget was taken either sees
        // running=true here (we resubmit below) or pushes after we go idle
        // and schedules the strand itself. Either way no wakeup is lost.
        let resubmit = {
            let queue = self.inner.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if queue.is_empty() {
                self.inner.running.store(false, Ordering::Release);
                false
            } else {
                true
            }
        };
        if resubmit {
            self.inner.executor.submit(self.clone());
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.inner.running.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand")
            .field("pending", &self.pending())
            .field("idle", &self.is_idle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Collects scheduled strands so a test drives drains by hand.
    #[derive(Default)]
    struct ManualExecutor {
        ready: Mutex<Vec<Strand>>,
    }

    impl Executor for ManualExecutor {
        fn submit(&self, strand: Strand) {
            self.ready.lock().unwrap().push(strand);
        }
    }

    impl ManualExecutor {
        fn run_all(&self) {
            loop {
                let ready: Vec<Strand> = std::mem::take(&mut *self.ready.lock().unwrap());
                if ready.is_empty() {
                    break;
                }
                for strand in ready {
                    strand.drain();
                }
            }
        }
    }

    #[test]
    fn submission_order_is_preserved() {
        let executor = Arc::new(ManualExecutor::default());
        let strand = Strand::new(executor.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            strand.execute(move || seen.lock().unwrap().push(i));
        }
        executor.run_all();

        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
        assert!(strand.is_idle());
    }

    #[test]
    fn schedules_once_while_busy() {
        let executor = Arc::new(ManualExecutor::default());
        let strand = Strand::new(executor.clone());

        strand.execute(|| {});
        strand.execute(|| {});
        strand.execute(|| {});

        // One submission covers all three functors.
        assert_eq!(executor.ready.lock().unwrap().len(), 1);
        executor.run_all();
        assert_eq!(strand.pending(), 0);
    }

    #[test]
    fn drain_runs_only_the_starting_snapshot() {
        let executor = Arc::new(ManualExecutor::default());
        let strand = Strand::new(executor.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let strand_again = strand.clone();
            let seen = Arc::clone(&seen);
            strand.execute(move || {
                seen.lock().unwrap().push("first");
                let seen = Arc::clone(&seen);
                strand_again.execute(move || seen.lock().unwrap().push("second"));
            });
        }

        let first_round: Vec<Strand> = std::mem::take(&mut *executor.ready.lock().unwrap());
        for strand in first_round {
            strand.drain();
        }
        assert_eq!(*seen.lock().unwrap(), vec!["first"]);

        // The strand resubmitted itself for the functor queued mid-drain.
        executor.run_all();
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn move_and_execute_appends_batch_in_order() {
        let executor = Arc::new(ManualExecutor::default());
        let strand = Strand::new(executor.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut batch: VecDeque<Task> = VecDeque::new();
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            batch.push_back(Box::new(move || seen.lock().unwrap().push(i)));
        }
        {
            let seen = Arc::clone(&seen);
            strand.move_and_execute(&mut batch, move || seen.lock().unwrap().push(99));
        }
        assert!(batch.is_empty());

        executor.run_all();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 99]);
    }
}
