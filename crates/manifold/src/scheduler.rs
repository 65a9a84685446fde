use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use manifold_timing::Nanos;
use manifold_utils::{ThreadPriority, thread_boot};
use tracing::{Level, debug, info, span, warn};

use crate::{
    config::SchedulerConfig,
    error::Result,
    reactor::Reactor,
};

/// How long a driver thread parks in its wait when there is nothing else
/// to bound it. Wakeups cut this short.
const IDLE_WAIT: Nanos = Nanos::from_millis(100);

/// Attach pressure that justifies another driver thread: one thread per
/// this many placed sockets, until the pool reaches `max_threads`.
const SOCKETS_PER_THREAD_TARGET: usize = 250;

/// Elastic pool of driver threads, sized between `min_threads` and
/// `max_threads`.
///
/// Static regime (the default): one reactor per thread; each socket is
/// pinned to the reactor chosen at attach time, so that reactor's thread
/// is the only one invoking its callbacks. Dynamic regime: one reactor
/// polled leader/follower by every thread, with per-socket ordering
/// preserved by strands.
///
/// The pool starts at `min_threads` and adds one driver at a time as
/// placements pass the per-thread target. Threads pin to the configured
/// cores round-robin and take the configured priority as they boot.
pub struct Scheduler {
    config: SchedulerConfig,
    reactors: Mutex<Vec<Arc<Reactor>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    next: AtomicUsize,
    placed: AtomicUsize,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;

        let reactor_count = if config.dynamic_load_balancing { 1 } else { config.min_threads };
        let mut reactors = Vec::with_capacity(reactor_count);
        for _ in 0..reactor_count {
            reactors.push(Reactor::new(config.reactor)?);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(config.min_threads);
        for index in 0..config.min_threads {
            let reactor =
                Arc::clone(&reactors[if config.dynamic_load_balancing { 0 } else { index }]);
            threads.push(spawn_driver(
                index,
                reactor,
                Arc::clone(&stop),
                config.core_for(index),
                config.thread_priority,
            ));
        }

        Ok(Self {
            config,
            reactors: Mutex::new(reactors),
            threads: Mutex::new(threads),
            stop,
            next: AtomicUsize::new(0),
            placed: AtomicUsize::new(0),
        })
    }

    /// The reactor to attach the next socket to: round-robin across the
    /// pool in the static regime, the shared one in the dynamic regime.
    /// Every placement counts as attach pressure and may grow the pool.
    pub fn reactor(&self) -> Arc<Reactor> {
        let placed = self.placed.fetch_add(1, Ordering::Relaxed) + 1;
        self.maybe_grow(placed);

        let reactors = self.lock_reactors();
        let index = self.next.fetch_add(1, Ordering::Relaxed) % reactors.len();
        Arc::clone(&reactors[index])
    }

    pub fn reactors(&self) -> Vec<Arc<Reactor>> {
        self.lock_reactors().clone()
    }

    pub fn threads(&self) -> usize {
        self.lock_threads().len()
    }

    /// Adds one driver once every running thread is past the per-thread
    /// socket target, never past `max_threads`. Best effort: if the new
    /// reactor cannot be stood up, the pool stays as it was.
    fn maybe_grow(&self, placed: usize) {
        let mut threads = self.lock_threads();
        let current = threads.len();
        if current >= self.config.max_threads || placed <= current * SOCKETS_PER_THREAD_TARGET {
            return;
        }

        let reactor = if self.config.dynamic_load_balancing {
            Arc::clone(&self.lock_reactors()[0])
        } else {
            match Reactor::new(self.config.reactor) {
                Ok(reactor) => {
                    self.lock_reactors().push(Arc::clone(&reactor));
                    reactor
                }
                Err(err) => {
                    warn!(?err, "couldn't grow the driver pool");
                    return;
                }
            }
        };

        info!(threads = current + 1, "driver pool growing");
        threads.push(spawn_driver(
            current,
            reactor,
            Arc::clone(&self.stop),
            self.config.core_for(current),
            self.config.thread_priority,
        ));
    }

    /// Stops every driver thread and joins them. Attached sockets stay
    /// registered; polling simply ceases.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for reactor in self.lock_reactors().iter() {
            reactor.wake();
        }
        for handle in self.lock_threads().drain(..) {
            let _ = handle.join();
        }
    }

    fn lock_reactors(&self) -> MutexGuard<'_, Vec<Arc<Reactor>>> {
        self.reactors.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_threads(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_driver(
    index: usize,
    reactor: Arc<Reactor>,
    stop: Arc<AtomicBool>,
    core: Option<usize>,
    priority: ThreadPriority,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let _span = span!(Level::INFO, "driver", thread = index).entered();
        thread_boot(core, priority);
        info!(driver = %reactor.driver(), "driver thread running");

        while !stop.load(Ordering::Relaxed) {
            if let Err(err) = reactor.poll(Some(IDLE_WAIT)) {
                debug!(?err, "driver wait failed");
            }
        }
        info!("driver thread stopped");
    })
}
