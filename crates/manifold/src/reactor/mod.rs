mod mux;

use std::{
    collections::HashMap,
    os::fd::RawFd,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use manifold_timing::Nanos;
use tracing::debug;

pub(crate) use self::mux::{InterestSet, Multiplexer, MuxEvent};
use crate::{
    buffer::BlobPool,
    config::{DriverName, ReactorConfig, TriggerMode},
    detach::DetachContext,
    error::{Error, Result},
    strand::{Executor, Strand},
    timer::{TimerCallback, TimerId, TimerOptions, TimerQueue},
};

/// Default size of pooled receive segments.
const RECEIVE_SEGMENT_SIZE: usize = 128 * 1024;

/// Readiness bits handed to one socket for one dispatch, post trigger and
/// one-shot filtering.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ReadinessEvent {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// What the reactor knows how to drive. Implemented by the per-socket
/// session (and by the proactor's completion sockets, which layer
/// submitted operations over the same readiness plumbing).
pub(crate) trait ReactorSocket: Send + Sync {
    /// Invoked on a driver thread with the socket's detach reference held.
    fn process_event(&self, event: ReadinessEvent);

    fn detach_context(&self) -> &DetachContext;

    /// Schedule the detach completion, then clear the registration.
    /// Called exactly once, by whichever thread retired the last reference.
    fn announce_detached(&self);
}

type DeferredTask = Box<dyn FnOnce(&mut TimerQueue) + Send>;

struct Registration {
    fd: RawFd,
    interest: InterestSet,
    mux_armed: bool,
    /// Bits already announced, for edge emulation over the level backends.
    announced: InterestSet,
    socket: Weak<dyn ReactorSocket>,
}

/// Reactor internals shared with attached sockets. Sessions hold this
/// strongly; the registration map holds sessions weakly, so ownership
/// never cycles and the detach protocol can flush the weak side.
pub(crate) struct ReactorShared {
    pub(crate) config: ReactorConfig,
    mux: Box<dyn Multiplexer>,
    registrations: Mutex<HashMap<usize, Registration>>,
    next_token: AtomicUsize,
    next_timer_id: AtomicU64,
    deferred: Mutex<Vec<DeferredTask>>,
    ready_strands: Mutex<Vec<Strand>>,
    pub(crate) pool: BlobPool,
}

impl Executor for ReactorShared {
    fn submit(&self, strand: Strand) {
        self.ready_strands
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(strand);
        self.mux.wake();
    }
}

impl ReactorShared {
    /// Creates the registration for a socket with the caller's initial
    /// interest. With `auto_attach` the backend stays disarmed until the
    /// first shown interest regardless.
    pub(crate) fn attach(
        &self,
        fd: RawFd,
        socket: Weak<dyn ReactorSocket>,
        initial: InterestSet,
    ) -> Result<usize> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let interest = if self.config.auto_attach { InterestSet::NONE } else { initial };

        let mut registration = Registration {
            fd,
            interest,
            mux_armed: false,
            announced: InterestSet::NONE,
            socket,
        };
        if registration.interest.any() {
            self.mux.register(fd, token, registration.interest)?;
            registration.mux_armed = true;
        }

        self.registrations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(token, registration);
        Ok(token)
    }

    pub(crate) fn show_readable(&self, token: usize) -> Result<()> {
        self.set_interest(token, |interest| interest.readable = true)
    }

    pub(crate) fn hide_readable(&self, token: usize) -> Result<()> {
        self.set_interest(token, |interest| interest.readable = false)
    }

    pub(crate) fn show_writable(&self, token: usize) -> Result<()> {
        self.set_interest(token, |interest| interest.writable = true)
    }

    pub(crate) fn hide_writable(&self, token: usize) -> Result<()> {
        self.set_interest(token, |interest| interest.writable = false)
    }

    fn set_interest(&self, token: usize, change: impl FnOnce(&mut InterestSet)) -> Result<()> {
        let mut registrations =
            self.registrations.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(registration) = registrations.get_mut(&token) else {
            return Err(Error::NotOpen);
        };

        let before = registration.interest;
        change(&mut registration.interest);
        if registration.interest == before {
            return Ok(());
        }

        // A re-shown bit is announceable again.
        if registration.interest.readable && !before.readable {
            registration.announced.readable = false;
        }
        if registration.interest.writable && !before.writable {
            registration.announced.writable = false;
        }

        self.apply_interest(token, registration)
    }

    fn apply_interest(&self, token: usize, registration: &mut Registration) -> Result<()> {
        if registration.interest.any() {
            if registration.mux_armed {
                self.mux.reregister(registration.fd, token, registration.interest)
            } else {
                self.mux.register(registration.fd, token, registration.interest)?;
                registration.mux_armed = true;
                Ok(())
            }
        } else if registration.mux_armed {
            // With auto_detach off, the level backends keep the descriptor
            // parked without interest (errors still surface); the scalable
            // backends cannot hold an interest-less registration.
            if !self.config.auto_detach && self.mux.is_level() {
                self.mux.reregister(registration.fd, token, registration.interest)
            } else {
                registration.mux_armed = false;
                self.mux.deregister(registration.fd)
            }
        } else {
            Ok(())
        }
    }

    /// Drops the registration. Called only after the detach completion has
    /// been scheduled.
    pub(crate) fn remove(&self, token: usize) {
        let removed = self
            .registrations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&token);
        if let Some(registration) = removed {
            if registration.mux_armed {
                let _ = self.mux.deregister(registration.fd);
            }
        }
    }

    /// Allocates the timer id synchronously and posts the insertion to the
    /// driver thread, which owns the timer structure.
    pub(crate) fn schedule_timer_at(
        &self,
        deadline: Nanos,
        options: TimerOptions,
        callback: TimerCallback,
    ) -> TimerId {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        self.post(move |timers| timers.schedule(id, deadline, options, callback));
        id
    }

    /// Cancellation is posted like scheduling; it is idempotent and loses
    /// the race against an in-flight fire by design.
    pub(crate) fn cancel_timer(&self, id: TimerId) {
        self.post(move |timers| {
            timers.cancel(id);
        });
    }

    fn post(&self, task: impl FnOnce(&mut TimerQueue) + Send + 'static) {
        self.deferred
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(Box::new(task));
        self.mux.wake();
    }

    pub(crate) fn wake(&self) {
        self.mux.wake();
    }

    fn has_deferred_work(&self) -> bool {
        !self.deferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner).is_empty() ||
            !self
                .ready_strands
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_empty()
    }
}

struct ReactorCore {
    timers: TimerQueue,
    events: Vec<MuxEvent>,
}

/// Readiness driver: multiplexes attached sockets over one OS event
/// source and runs `wait -> dispatch -> drain timers -> run deferred
/// functors` cycles.
///
/// Any thread may call [`poll`](Self::poll); concurrent pollers serialize
/// leader/follower style on the core lock, and per-socket callback
/// ordering is preserved by each socket's strand.
pub struct Reactor {
    shared: Arc<ReactorShared>,
    core: Mutex<ReactorCore>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let mux = mux::create(config.driver)?;
        Ok(Arc::new(Self {
            shared: Arc::new(ReactorShared {
                config,
                mux,
                registrations: Mutex::new(HashMap::new()),
                next_token: AtomicUsize::new(0),
                next_timer_id: AtomicU64::new(1),
                deferred: Mutex::new(Vec::new()),
                ready_strands: Mutex::new(Vec::new()),
                pool: BlobPool::new(RECEIVE_SEGMENT_SIZE),
            }),
            core: Mutex::new(ReactorCore { timers: TimerQueue::new(), events: Vec::new() }),
        }))
    }

    pub fn driver(&self) -> DriverName {
        self.shared.mux.name()
    }

    pub(crate) fn shared(&self) -> &Arc<ReactorShared> {
        &self.shared
    }

    /// Interrupts a concurrent [`poll`](Self::poll) from any thread.
    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Schedules a timer against this driver. Callable from any thread;
    /// insertion happens on the driver via a posted functor, under the id
    /// returned here.
    pub fn schedule_timer_at(
        &self,
        deadline: Nanos,
        options: TimerOptions,
        callback: TimerCallback,
    ) -> TimerId {
        self.shared.schedule_timer_at(deadline, options, callback)
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.shared.cancel_timer(id);
    }

    /// One driver cycle: wait for readiness (bounded by the configured
    /// event cap and the earliest timer deadline), dispatch to sessions,
    /// then run due timers and deferred functors for at most
    /// `max_cycles_per_wait` rounds. Returns the number of sockets
    /// dispatched.
    pub fn poll(&self, timeout: Option<Nanos>) -> Result<usize> {
        let mut core = self.core.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        // Settle cross-thread work first so the wait timeout sees fresh
        // deadlines.
        self.run_deferred(&mut core);

        let mut wait_timeout = timeout;
        if let Some(deadline) = core.timers.next_deadline() {
            let until = deadline.saturating_sub(Nanos::now());
            wait_timeout = Some(wait_timeout.map_or(until, |user| user.min(until)));
        }
        if self.shared.has_deferred_work() {
            wait_timeout = Some(Nanos::ZERO);
        }

        let max_events = self.shared.config.max_events_per_wait;
        let mut events = std::mem::take(&mut core.events);
        events.clear();
        self.shared.mux.wait(&mut events, wait_timeout, max_events)?;
        let dispatched = self.dispatch(&events);
        core.events = events;

        for _ in 0..self.shared.config.max_cycles_per_wait {
            let mut progressed = false;
            self.run_deferred(&mut core);

            let fired =
                core.timers.drain_due(Nanos::now(), self.shared.config.max_timers_per_wait);
            progressed |= fired > 0;
            progressed |= self.drain_strands() > 0;

            if !progressed {
                break;
            }
        }

        Ok(dispatched)
    }

    fn run_deferred(&self, core: &mut ReactorCore) {
        loop {
            let tasks: Vec<DeferredTask> = std::mem::take(
                &mut *self.shared.deferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner),
            );
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                task(&mut core.timers);
            }
        }
    }

    fn drain_strands(&self) -> usize {
        let ready: Vec<Strand> = std::mem::take(
            &mut *self
                .shared
                .ready_strands
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        let count = ready.len();
        for strand in ready {
            strand.drain();
        }
        count
    }

    fn dispatch(&self, events: &[MuxEvent]) -> usize {
        let trigger = self.shared.config.trigger;
        let one_shot = self.shared.config.one_shot;
        let emulate_edge = trigger == TriggerMode::Edge && self.shared.mux.is_level();

        let mut work: Vec<(Arc<dyn ReactorSocket>, ReadinessEvent)> =
            Vec::with_capacity(events.len());
        {
            let mut registrations =
                self.registrations_lock();

            if emulate_edge {
                // A condition that went quiet re-arms its edge.
                for (token, registration) in registrations.iter_mut() {
                    let reported = events.iter().find(|event| event.token == *token);
                    let readable_now = reported.is_some_and(|event| event.readable);
                    let writable_now = reported.is_some_and(|event| event.writable);
                    if !readable_now {
                        registration.announced.readable = false;
                    }
                    if !writable_now {
                        registration.announced.writable = false;
                    }
                }
            }

            for event in events {
                let Some(registration) = registrations.get_mut(&event.token) else {
                    continue;
                };
                let Some(socket) = registration.socket.upgrade() else {
                    debug!(token = event.token, "reactor: dropping stale registration");
                    if registration.mux_armed {
                        let _ = self.shared.mux.deregister(registration.fd);
                    }
                    registrations.remove(&event.token);
                    continue;
                };

                let mut readable = event.readable && registration.interest.readable;
                let mut writable = event.writable && registration.interest.writable;

                if emulate_edge {
                    if readable && registration.announced.readable {
                        readable = false;
                    }
                    if writable && registration.announced.writable {
                        writable = false;
                    }
                    if event.readable {
                        registration.announced.readable = true;
                    }
                    if event.writable {
                        registration.announced.writable = true;
                    }
                }

                if one_shot {
                    // Fired interest clears; the session re-arms explicitly.
                    let before = registration.interest;
                    if readable {
                        registration.interest.readable = false;
                    }
                    if writable {
                        registration.interest.writable = false;
                    }
                    if registration.interest != before {
                        let _ = self.shared.apply_interest(event.token, registration);
                    }
                }

                if readable || writable || event.error || event.hangup {
                    work.push((socket, ReadinessEvent {
                        readable,
                        writable,
                        error: event.error,
                        hangup: event.hangup,
                    }));
                }
            }
        }

        // Callbacks run outside the registration lock, bracketed by the
        // detach protocol.
        let mut dispatched = 0;
        for (socket, event) in work {
            let authorized = socket.detach_context().acquire();
            if authorized {
                socket.process_event(event);
                dispatched += 1;
            }
            if socket.detach_context().release() {
                socket.announce_detached();
            }
        }
        dispatched
    }

    fn registrations_lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Registration>> {
        self.shared.registrations.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").field("driver", &self.driver()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[test]
    fn timer_fires_through_poll() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fired = Arc::new(StdMutex::new(Vec::new()));

        let sink = Arc::clone(&fired);
        reactor.schedule_timer_at(
            Nanos::now().saturating_add(Nanos::from_millis(20)),
            TimerOptions::default(),
            Box::new(move |context| sink.lock().unwrap().push(context)),
        );

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while fired.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            reactor.poll(Some(Nanos::from_millis(50))).unwrap();
        }

        let contexts = fired.lock().unwrap();
        assert_eq!(contexts.len(), 1);
        assert!(contexts[0].now >= contexts[0].deadline);
        assert_eq!(contexts[0].drift, contexts[0].now.saturating_sub(contexts[0].deadline));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fired = Arc::new(StdMutex::new(0_usize));

        let sink = Arc::clone(&fired);
        let id = reactor.schedule_timer_at(
            Nanos::now().saturating_add(Nanos::from_millis(30)),
            TimerOptions::default(),
            Box::new(move |_| *sink.lock().unwrap() += 1),
        );
        reactor.cancel_timer(id);

        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(200);
        while std::time::Instant::now() < deadline {
            reactor.poll(Some(Nanos::from_millis(20))).unwrap();
        }
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn poll_returns_on_wake() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let waker = Arc::clone(reactor.shared());
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            waker.wake();
        });

        let start = std::time::Instant::now();
        reactor.poll(Some(Nanos::from_secs(10))).unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
        handle.join().unwrap();
    }
}
