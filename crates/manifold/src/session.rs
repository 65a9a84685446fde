use std::{
    os::fd::AsRawFd,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicUsize, Ordering},
    },
};

use manifold_timing::Nanos;
use tracing::debug;

use crate::{
    buffer::{Data, GatherLimits},
    config::SocketConfig,
    detach::DetachContext,
    endpoint::Endpoint,
    error::{Error, Result},
    event::{ConnectContext, DowngradeContext, ErrorContext, SessionEvent},
    handle::SocketHandle,
    options::{ReceiveOptions, SendOptions},
    queue::{ReceiveQueue, SendCallback, SendCompletion, SendQueue},
    reactor::{InterestSet, Reactor, ReactorSocket, ReadinessEvent},
    shutdown::{ShutdownDirection, ShutdownOrigin, ShutdownState},
    strand::{Executor, Strand},
    timer::TimerOptions,
};

/// Receives every event the session announces, on the session's strand.
pub type Observer = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Receives each accepted connection (handle plus peer), on the listening
/// session's strand.
pub type AcceptHandler = Arc<dyn Fn(SocketHandle, Endpoint) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionKind {
    Stream,
    Datagram,
    Listener,
}

struct SessionState {
    config: SocketConfig,
    send_queue: SendQueue,
    receive_queue: ReceiveQueue,
    shutdown: ShutdownState,
    connecting: bool,
    peer: Option<Endpoint>,
    failed: Option<Error>,
    detach_completion: Option<Box<dyn FnOnce() + Send>>,
}

/// Per-socket glue: owns the handle and queues, reacts to driver
/// readiness, and dispatches strictly ordered callbacks on its strand.
///
/// Exactly one driver registers a session; the registration holds only a
/// weak reference back, so dropping the last user `Arc` after detachment
/// releases everything.
pub struct SocketSession {
    weak_self: Weak<SocketSession>,
    shared: Arc<crate::reactor::ReactorShared>,
    handle: SocketHandle,
    kind: SessionKind,
    token: AtomicUsize,
    strand: Strand,
    observer: Observer,
    accept_handler: Option<AcceptHandler>,
    detach: DetachContext,
    state: Mutex<SessionState>,
}

impl Reactor {
    /// Attaches a stream (TCP or local-stream) socket.
    pub fn attach_stream(
        self: &Arc<Self>,
        handle: SocketHandle,
        config: SocketConfig,
        observer: Observer,
    ) -> Result<Arc<SocketSession>> {
        SocketSession::attach(self, handle, config, observer, SessionKind::Stream, None)
    }

    /// Attaches a datagram (UDP or local-datagram) socket.
    pub fn attach_datagram(
        self: &Arc<Self>,
        handle: SocketHandle,
        config: SocketConfig,
        observer: Observer,
    ) -> Result<Arc<SocketSession>> {
        SocketSession::attach(self, handle, config, observer, SessionKind::Datagram, None)
    }

    /// Attaches a listening socket; accepted connections surface through
    /// `on_accept` and are not themselves attached until the caller does
    /// so.
    pub fn attach_listener(
        self: &Arc<Self>,
        handle: SocketHandle,
        config: SocketConfig,
        observer: Observer,
        on_accept: AcceptHandler,
    ) -> Result<Arc<SocketSession>> {
        SocketSession::attach(self, handle, config, observer, SessionKind::Listener, Some(on_accept))
    }
}

impl SocketSession {
    fn attach(
        reactor: &Arc<Reactor>,
        handle: SocketHandle,
        config: SocketConfig,
        observer: Observer,
        kind: SessionKind,
        accept_handler: Option<AcceptHandler>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let shared = Arc::clone(reactor.shared());
        let executor: Arc<dyn Executor> = shared.clone();
        let strand = Strand::new(executor);
        let fd = handle.as_raw_fd();

        let receive_queue = if kind == SessionKind::Datagram {
            ReceiveQueue::new_datagram(config.read_queue_low_watermark, config.read_queue_high_watermark)
        } else {
            ReceiveQueue::new_stream(config.read_queue_low_watermark, config.read_queue_high_watermark)
        };

        let session = Arc::new_cyclic(|weak| SocketSession {
            weak_self: weak.clone(),
            shared: shared.clone(),
            handle,
            kind,
            token: AtomicUsize::new(usize::MAX),
            strand,
            observer,
            accept_handler,
            detach: DetachContext::new(),
            state: Mutex::new(SessionState {
                config,
                send_queue: SendQueue::new(
                    config.write_queue_low_watermark,
                    config.write_queue_high_watermark,
                ),
                receive_queue,
                shutdown: ShutdownState::new(),
                connecting: false,
                peer: None,
                failed: None,
                detach_completion: None,
            }),
        });

        // A stream socket with no peer yet would poll as hung up; it stays
        // disarmed until its connect completes.
        let initial = match kind {
            SessionKind::Listener | SessionKind::Datagram => InterestSet::READABLE,
            SessionKind::Stream => {
                if session.handle.peer_endpoint().is_ok() {
                    InterestSet::READABLE
                } else {
                    InterestSet::NONE
                }
            }
        };

        let weak: Weak<dyn ReactorSocket> = session.weak_self.clone();
        let token = shared.attach(fd, weak, initial)?;
        session.token.store(token, Ordering::Release);
        Ok(session)
    }

    #[inline]
    fn token(&self) -> usize {
        self.token.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Brackets a user-facing operation with the detach protocol.
    fn guarded<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let authorized = self.detach.acquire();
        let result = if authorized { op() } else { Err(Error::NotOpen) };
        if self.detach.release() {
            self.do_announce_detached();
        }
        result
    }

    fn emit(&self, event: SessionEvent) {
        let observer = Arc::clone(&self.observer);
        self.strand.execute(move || observer(event));
    }

    fn dispatch_completions(&self, completions: Vec<SendCompletion>) {
        for (callback, context) in completions {
            self.strand.execute(move || callback(context));
        }
    }

    // --- user surface -----------------------------------------------------

    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.handle.local_endpoint()
    }

    pub fn peer_endpoint(&self) -> Result<Endpoint> {
        self.handle.peer_endpoint()
    }

    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    pub fn write_queue_size(&self) -> usize {
        self.lock_state().send_queue.size()
    }

    pub fn read_queue_size(&self) -> usize {
        self.lock_state().receive_queue.size()
    }

    /// Validated synchronously; an inverted pair is rejected with
    /// `Invalid` and leaves the previous values in place.
    pub fn set_write_queue_watermarks(&self, low: usize, high: usize) -> Result<()> {
        let mut state = self.lock_state();
        state.send_queue.set_watermarks(low, high)?;
        state.config.write_queue_low_watermark = low;
        state.config.write_queue_high_watermark = high;
        Ok(())
    }

    pub fn set_read_queue_watermarks(&self, low: usize, high: usize) -> Result<()> {
        let mut state = self.lock_state();
        state.receive_queue.set_watermarks(low, high)?;
        state.config.read_queue_low_watermark = low;
        state.config.read_queue_high_watermark = high;
        Ok(())
    }

    /// Initiates a connection. `ConnectInitiated` is announced
    /// immediately; `ConnectComplete` follows on the strand once the
    /// driver reports the outcome.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<()> {
        self.guarded(|| {
            {
                let mut state = self.lock_state();
                if state.connecting {
                    return Err(Error::Invalid);
                }
                state.connecting = true;
            }
            self.emit(SessionEvent::ConnectInitiated(ConnectContext {
                endpoint: Some(endpoint.clone()),
                error: None,
            }));

            match self.handle.connect(endpoint) {
                Ok(true) => {
                    {
                        let mut state = self.lock_state();
                        state.connecting = false;
                        state.peer = Some(endpoint.clone());
                    }
                    self.shared.show_readable(self.token())?;
                    self.emit(SessionEvent::ConnectComplete(ConnectContext {
                        endpoint: Some(endpoint.clone()),
                        error: None,
                    }));
                    Ok(())
                }
                Ok(false) => {
                    // Completion (or the pending error) arrives as
                    // writability.
                    self.shared.show_writable(self.token())?;
                    Ok(())
                }
                Err(error) => {
                    self.lock_state().connecting = false;
                    self.emit(SessionEvent::ConnectComplete(ConnectContext {
                        endpoint: Some(endpoint.clone()),
                        error: Some(error),
                    }));
                    Err(error)
                }
            }
        })
    }

    /// Enqueues data for transmission. Returns the entry id. The enqueue
    /// itself never blocks and never invokes callbacks synchronously; a
    /// latched high-watermark event is delivered on the strand after this
    /// returns.
    pub fn send(
        &self,
        data: Data,
        options: SendOptions,
        callback: Option<SendCallback>,
    ) -> Result<u64> {
        if data.is_empty() || self.kind == SessionKind::Listener {
            return Err(Error::Invalid);
        }
        self.guarded(|| {
            let now = Nanos::now();
            let deadline = options.deadline;
            let (id, fire_high, context) = {
                let mut state = self.lock_state();
                if let Some(error) = state.failed {
                    return Err(error);
                }
                if state.shutdown.is_send_shut() {
                    return Err(Error::Invalid);
                }
                let (id, fire_high) = state.send_queue.enqueue(data, &options, callback, now);
                (id, fire_high, state.send_queue.context())
            };

            self.shared.show_writable(self.token())?;

            if fire_high {
                self.emit(SessionEvent::WriteQueueHighWatermark(context));
                self.emit(SessionEvent::WriteQueueFlowControlApplied(context));
            }
            if let Some(deadline) = deadline {
                self.schedule_send_expiry(deadline);
            }
            Ok(id)
        })
    }

    /// Delivers between `options.min_size` and `options.max_size` buffered
    /// bytes, or one whole datagram with its sender. Non-blocking:
    /// `WouldBlock` when not enough has accumulated, `Eof` once a
    /// receive-shut queue is drained.
    pub fn receive(&self, options: &ReceiveOptions) -> Result<(Data, Option<Endpoint>)> {
        self.guarded(|| {
            let (outcome, context) = {
                let mut state = self.lock_state();
                let half_closed = state.shutdown.is_recv_shut();
                let min = options.min_size.max(1);
                let outcome =
                    state.receive_queue.take(min, options.effective_max(), half_closed)?;
                (outcome, state.receive_queue.context())
            };

            if outcome.relax_flow_control {
                let _ = self.shared.show_readable(self.token());
                self.emit(SessionEvent::ReadQueueFlowControlRelaxed(context));
            }
            Ok((Data::Bytes(outcome.bytes), outcome.endpoint))
        })
    }

    /// Cancels queued sends carrying `token`. Idempotent; already
    /// transmitted (or in-flight) data is unaffected, and a socket that is
    /// already detached has nothing left to cancel.
    pub fn cancel(&self, token: u64) -> Result<()> {
        let result = self.guarded(|| {
            let mut completions = Vec::new();
            let (fired_low, context) = {
                let mut state = self.lock_state();
                let fired =
                    state.send_queue.cancel(token, Nanos::now(), &mut completions);
                (fired, state.send_queue.context())
            };
            self.dispatch_completions(completions);
            if fired_low {
                self.emit(SessionEvent::WriteQueueLowWatermark(context));
                self.emit(SessionEvent::WriteQueueFlowControlRelaxed(context));
            }
            Ok(())
        });
        match result {
            Err(Error::NotOpen) => Ok(()),
            other => other,
        }
    }

    /// Drives the shutdown state machine. Idempotent per direction; a
    /// socket already shut down (and detached) reports success as a no-op.
    pub fn shutdown(&self, direction: ShutdownDirection) -> Result<()> {
        let result = self.guarded(|| {
            self.apply_shutdown(ShutdownOrigin::Source, direction);
            Ok(())
        });
        match result {
            Err(Error::NotOpen) => Ok(()),
            other => other,
        }
    }

    /// Full close: both directions shut, then detachment.
    pub fn close(&self) -> Result<()> {
        self.shutdown(ShutdownDirection::Both)
    }

    /// Requests detachment from the driver. The completion runs exactly
    /// once, on this session's strand, after every thread processing the
    /// socket has released it.
    pub fn detach(&self, completion: Option<Box<dyn FnOnce() + Send>>) -> Result<()> {
        if let Some(completion) = completion {
            self.lock_state().detach_completion = Some(completion);
        }
        match self.detach.request() {
            Ok(()) => {
                self.do_announce_detached();
                Ok(())
            }
            Err(Error::WouldBlock) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Relays an encryption-engine teardown milestone to the observer.
    /// The engine itself lives outside the runtime.
    pub fn announce_downgrade_initiated(&self, context: DowngradeContext) {
        self.emit(SessionEvent::DowngradeInitiated(context));
    }

    pub fn announce_downgrade_complete(&self, context: DowngradeContext) {
        self.emit(SessionEvent::DowngradeComplete(context));
    }

    // --- driver-side processing -------------------------------------------

    fn process_readable(&self) {
        match self.kind {
            SessionKind::Stream => self.pump_stream_reads(),
            SessionKind::Datagram => self.pump_datagram_reads(),
            SessionKind::Listener => self.pump_accepts(),
        }
    }

    fn pump_stream_reads(&self) {
        loop {
            {
                let state = self.lock_state();
                if state.shutdown.is_recv_shut() || state.receive_queue.is_flow_controlled() {
                    return;
                }
            }

            let mut segment = self.shared.pool.segment();
            let cap = {
                let state = self.lock_state();
                state.config.max_incoming_transfer.min(segment.capacity())
            };

            match self.handle.recv(&mut segment.spare_mut()[..cap]) {
                Ok(0) => {
                    self.handle_remote_shutdown();
                    return;
                }
                Ok(n) => {
                    segment.advance(n);
                    let (outcome, context) = {
                        let mut state = self.lock_state();
                        let outcome = state.receive_queue.push_segment(segment);
                        (outcome, state.receive_queue.context())
                    };
                    if outcome.fire_low {
                        self.emit(SessionEvent::ReadQueueLowWatermark(context));
                    }
                    if outcome.fire_high {
                        self.emit(SessionEvent::ReadQueueHighWatermark(context));
                    }
                    if outcome.apply_flow_control {
                        let _ = self.shared.hide_readable(self.token());
                        self.emit(SessionEvent::ReadQueueFlowControlApplied(context));
                        return;
                    }
                }
                Err(Error::WouldBlock) => return,
                Err(Error::Interrupted) => {}
                Err(error) => {
                    self.fail(error);
                    return;
                }
            }
        }
    }

    fn pump_datagram_reads(&self) {
        loop {
            {
                let state = self.lock_state();
                if state.shutdown.is_recv_shut() || state.receive_queue.is_flow_controlled() {
                    return;
                }
            }

            let mut segment = self.shared.pool.segment();
            match self.handle.recv_from(segment.spare_mut()) {
                Ok((n, sender)) => {
                    segment.advance(n);
                    let (outcome, context) = {
                        let mut state = self.lock_state();
                        let outcome = state.receive_queue.push_message(segment, sender);
                        (outcome, state.receive_queue.context())
                    };
                    if outcome.fire_low {
                        self.emit(SessionEvent::ReadQueueLowWatermark(context));
                    }
                    if outcome.fire_high {
                        self.emit(SessionEvent::ReadQueueHighWatermark(context));
                    }
                    if outcome.apply_flow_control {
                        let _ = self.shared.hide_readable(self.token());
                        self.emit(SessionEvent::ReadQueueFlowControlApplied(context));
                        return;
                    }
                }
                Err(Error::WouldBlock) => return,
                Err(Error::Interrupted) => {}
                Err(error) => {
                    self.fail(error);
                    return;
                }
            }
        }
    }

    fn pump_accepts(&self) {
        let Some(handler) = &self.accept_handler else { return };
        loop {
            match self.handle.accept() {
                Ok((accepted, peer)) => {
                    let handler = Arc::clone(handler);
                    self.strand.execute(move || handler(accepted, peer));
                }
                Err(Error::WouldBlock) => return,
                // The connection died between readiness and accept; keep
                // draining the backlog.
                Err(Error::Interrupted) | Err(Error::ConnectionReset) => {}
                Err(error) => {
                    debug!(?error, "listener: accept failed");
                    self.emit(SessionEvent::Error(ErrorContext { error }));
                    return;
                }
            }
        }
    }

    fn process_writable(&self) {
        let finishing_connect = {
            let mut state = self.lock_state();
            if state.connecting {
                state.connecting = false;
                true
            } else {
                false
            }
        };

        if finishing_connect {
            match self.handle.take_error() {
                Ok(None) => {
                    let endpoint = self.handle.peer_endpoint().ok();
                    self.lock_state().peer = endpoint.clone();
                    let _ = self.shared.show_readable(self.token());
                    self.emit(SessionEvent::ConnectComplete(ConnectContext {
                        endpoint,
                        error: None,
                    }));
                }
                Ok(Some(error)) | Err(error) => {
                    self.emit(SessionEvent::ConnectComplete(ConnectContext {
                        endpoint: None,
                        error: Some(error),
                    }));
                    self.fail(error);
                    return;
                }
            }
        }

        self.drain_send_queue();
    }

    fn drain_send_queue(&self) {
        let limits = GatherLimits::default();

        enum Step {
            Continue,
            KeepArmed,
            Disarm,
            Fatal(Error),
        }

        loop {
            let now = Nanos::now();
            let mut completions = Vec::new();
            let mut fired_low = false;

            let (step, context) = {
                let mut state = self.lock_state();
                fired_low |= state.send_queue.fail_expired(now, &mut completions);

                let attempt = {
                    let mut iovecs = Vec::new();
                    let batch = if self.kind == SessionKind::Datagram {
                        state.send_queue.batch_head(&limits, &mut iovecs)
                    } else {
                        state.send_queue.batch(&limits, &mut iovecs)
                    };
                    batch.map(|info| {
                        (self.handle.send_vectored(&iovecs, info.endpoint.as_ref(), false), info)
                    })
                };

                let step = match attempt {
                    None => Step::Disarm,
                    Some((Ok(n), _)) => {
                        fired_low |= state.send_queue.acknowledge(n, now, &mut completions);
                        Step::Continue
                    }
                    Some((Err(Error::WouldBlock), _)) => Step::KeepArmed,
                    Some((Err(Error::Interrupted), _)) => Step::Continue,
                    Some((Err(error), _))
                        if self.kind == SessionKind::Datagram && !error.is_fatal() =>
                    {
                        // One undeliverable message; the rest of the queue
                        // is still good.
                        fired_low |=
                            state.send_queue.fail_front(error, now, &mut completions);
                        Step::Continue
                    }
                    Some((Err(error), _)) => Step::Fatal(error),
                };
                (step, state.send_queue.context())
            };

            self.dispatch_completions(completions);
            if fired_low {
                self.emit(SessionEvent::WriteQueueLowWatermark(context));
                self.emit(SessionEvent::WriteQueueFlowControlRelaxed(context));
            }

            match step {
                Step::Continue => {}
                Step::KeepArmed => return,
                Step::Disarm => {
                    let _ = self.shared.hide_writable(self.token());
                    return;
                }
                Step::Fatal(error) => {
                    self.fail(error);
                    return;
                }
            }
        }
    }

    fn handle_remote_shutdown(&self) {
        // A hangup on a socket whose connect is still pending is a connect
        // failure, not a peer shutdown.
        let connecting = {
            let mut state = self.lock_state();
            let connecting = state.connecting;
            state.connecting = false;
            connecting
        };
        if connecting {
            let error = match self.handle.take_error() {
                Ok(Some(error)) | Err(error) => error,
                Ok(None) => Error::ConnectionRefused,
            };
            self.emit(SessionEvent::ConnectComplete(ConnectContext {
                endpoint: None,
                error: Some(error),
            }));
            self.fail(error);
            return;
        }
        self.apply_shutdown(ShutdownOrigin::Destination, ShutdownDirection::Receive);
    }

    fn process_error(&self) {
        let error = match self.handle.take_error() {
            Ok(Some(error)) => error,
            Ok(None) => return,
            Err(error) => error,
        };
        let was_connecting = {
            let mut state = self.lock_state();
            let connecting = state.connecting;
            state.connecting = false;
            connecting
        };
        if was_connecting {
            self.emit(SessionEvent::ConnectComplete(ConnectContext {
                endpoint: None,
                error: Some(error),
            }));
        }
        self.fail(error);
    }

    /// Runs the shutdown pipeline: state machine first, then socket-level
    /// shutdowns and interest changes, then events in taxonomy order, all
    /// callbacks strictly after the state lock is released.
    fn apply_shutdown(&self, origin: ShutdownOrigin, direction: ShutdownDirection) {
        let mut completions = Vec::new();
        let (context, write_context, read_context, failed_sends, discarded_reads) = {
            let mut state = self.lock_state();
            let keep_half_open = state.config.keep_half_open;
            let context = state.shutdown.apply(origin, direction, keep_half_open);

            let mut failed_sends = 0;
            if context.send {
                failed_sends =
                    state.send_queue.fail_all(Error::Canceled, Nanos::now(), &mut completions);
            }
            // A user-requested receive shutdown abandons buffered bytes;
            // a peer-initiated one leaves residue deliverable.
            let mut discarded_reads = 0;
            if context.receive && origin == ShutdownOrigin::Source {
                discarded_reads = state.receive_queue.discard();
            }
            (
                context,
                state.send_queue.context(),
                state.receive_queue.context(),
                failed_sends,
                discarded_reads,
            )
        };

        if !(context.initiated || context.send || context.receive || context.completed) {
            return;
        }

        if context.receive {
            let _ = self.shared.hide_readable(self.token());
            if origin == ShutdownOrigin::Source {
                let _ = self.handle.shutdown(ShutdownDirection::Receive);
            }
        }
        if context.send {
            let _ = self.shared.hide_writable(self.token());
            let _ = self.handle.shutdown(ShutdownDirection::Send);
        }

        if context.initiated {
            self.emit(SessionEvent::ShutdownInitiated(context));
        }
        if context.receive {
            self.emit(SessionEvent::ShutdownReceive(context));
            if discarded_reads > 0 {
                self.emit(SessionEvent::ReadQueueDiscarded(read_context));
            }
        }
        if context.send {
            if failed_sends > 0 {
                self.emit(SessionEvent::WriteQueueDiscarded(write_context));
            }
            self.emit(SessionEvent::ShutdownSend(context));
        }
        self.dispatch_completions(completions);

        if context.completed {
            self.emit(SessionEvent::ShutdownComplete(context));
            self.initiate_detach();
        }
    }

    /// Socket-fatal path: fail everything queued, announce the error,
    /// force a full shutdown with origin `Destination`.
    fn fail(&self, error: Error) {
        {
            let mut state = self.lock_state();
            if state.failed.is_some() {
                return;
            }
            state.failed = Some(error);
        }
        self.emit(SessionEvent::Error(ErrorContext { error }));

        let mut completions = Vec::new();
        let (context, write_context, read_context, failed_sends, discarded_reads) = {
            let mut state = self.lock_state();
            let context =
                state.shutdown.apply(ShutdownOrigin::Destination, ShutdownDirection::Both, true);
            let failed_sends =
                state.send_queue.fail_all(error, Nanos::now(), &mut completions);
            let discarded_reads = state.receive_queue.discard();
            (
                context,
                state.send_queue.context(),
                state.receive_queue.context(),
                failed_sends,
                discarded_reads,
            )
        };

        let _ = self.shared.hide_readable(self.token());
        let _ = self.shared.hide_writable(self.token());
        let _ = self.handle.shutdown(ShutdownDirection::Both);

        if context.initiated {
            self.emit(SessionEvent::ShutdownInitiated(context));
        }
        if context.receive {
            self.emit(SessionEvent::ShutdownReceive(context));
            if discarded_reads > 0 {
                self.emit(SessionEvent::ReadQueueDiscarded(read_context));
            }
        }
        if context.send {
            if failed_sends > 0 {
                self.emit(SessionEvent::WriteQueueDiscarded(write_context));
            }
            self.emit(SessionEvent::ShutdownSend(context));
        }
        self.dispatch_completions(completions);
        if context.completed {
            self.emit(SessionEvent::ShutdownComplete(context));
            self.initiate_detach();
        }
    }

    fn schedule_send_expiry(&self, deadline: Nanos) {
        let weak = self.weak_self.clone();
        self.shared.schedule_timer_at(
            deadline,
            TimerOptions::default(),
            Box::new(move |_context| {
                if let Some(session) = weak.upgrade() {
                    session.expire_sends();
                }
            }),
        );
    }

    fn expire_sends(&self) {
        let authorized = self.detach.acquire();
        if authorized {
            let mut completions = Vec::new();
            let (fired_low, context, drained) = {
                let mut state = self.lock_state();
                let fired = state.send_queue.fail_expired(Nanos::now(), &mut completions);
                (fired, state.send_queue.context(), state.send_queue.is_empty())
            };
            self.dispatch_completions(completions);
            if fired_low {
                self.emit(SessionEvent::WriteQueueLowWatermark(context));
                self.emit(SessionEvent::WriteQueueFlowControlRelaxed(context));
            }
            if drained {
                let _ = self.shared.hide_writable(self.token());
            }
        }
        if self.detach.release() {
            self.do_announce_detached();
        }
    }

    fn initiate_detach(&self) {
        match self.detach.request() {
            Ok(()) => self.do_announce_detached(),
            // WouldBlock: some thread (possibly this one) still holds a
            // reference and will announce on release. Invalid: already
            // requested.
            Err(_) => {}
        }
    }

    /// Schedules the detach completion on the strand, then clears the
    /// driver registration. Reached exactly once per detach.
    fn do_announce_detached(&self) {
        let completion = self.lock_state().detach_completion.take();
        if let Some(completion) = completion {
            self.strand.execute(completion);
        }
        self.shared.remove(self.token());
    }

    /// Re-adds the interest bits this session still wants after a
    /// one-shot fire.
    fn rearm_after_one_shot(&self) {
        let (want_read, want_write) = {
            let state = self.lock_state();
            let want_read = !state.shutdown.is_recv_shut() &&
                !state.receive_queue.is_flow_controlled() &&
                !state.shutdown.is_closed();
            let want_write =
                state.connecting || (!state.send_queue.is_empty() && !state.shutdown.is_send_shut());
            (want_read, want_write)
        };
        if want_read {
            let _ = self.shared.show_readable(self.token());
        }
        if want_write {
            let _ = self.shared.show_writable(self.token());
        }
    }
}

impl ReactorSocket for SocketSession {
    fn process_event(&self, event: ReadinessEvent) {
        if event.error {
            self.process_error();
        }
        if event.readable {
            self.process_readable();
        }
        if event.writable {
            self.process_writable();
        }
        if event.hangup && self.kind != SessionKind::Listener {
            // Residue was pumped above; now drive the state machine.
            self.handle_remote_shutdown();
        }
        if self.shared.config.one_shot {
            self.rearm_after_one_shot();
        }
    }

    fn detach_context(&self) -> &DetachContext {
        &self.detach
    }

    fn announce_detached(&self) {
        self.do_announce_detached();
    }
}

impl std::fmt::Debug for SocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketSession")
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .finish()
    }
}
