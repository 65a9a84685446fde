use std::{
    collections::VecDeque,
    os::fd::AsRawFd,
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use manifold_timing::Nanos;
use tracing::debug;

use crate::{
    buffer::{Data, GatherLimits},
    config::{DriverName, ReactorConfig, SocketConfig},
    detach::DetachContext,
    endpoint::Endpoint,
    error::{Error, Result},
    event::{
        Notification, TimestampKind, TimestampNotification, ZeroCopyNotification, ZeroCopyType,
    },
    handle::SocketHandle,
    options::SendOptions,
    reactor::{InterestSet, Reactor, ReactorShared, ReactorSocket, ReadinessEvent},
    strand::{Executor, Strand},
    timer::TimerOptions,
};

/// Kind of a submitted operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Accept,
    Connect,
    Send,
    Recv,
    Detach,
}

/// Completion record: what was attempted, what was accomplished, and what
/// (if anything) terminated it.
#[derive(Debug)]
pub struct Completion {
    pub opcode: OpCode,
    pub user_tag: u64,
    pub bytes_transferred: usize,
    pub endpoint: Option<Endpoint>,
    pub data: Option<Vec<u8>>,
    pub accepted: Option<(SocketHandle, Endpoint)>,
    pub error: Option<Error>,
}

impl Completion {
    fn bare(opcode: OpCode, user_tag: u64) -> Self {
        Self {
            opcode,
            user_tag,
            bytes_transferred: 0,
            endpoint: None,
            data: None,
            accepted: None,
            error: None,
        }
    }

    fn failed(opcode: OpCode, user_tag: u64, error: Error) -> Self {
        Self { error: Some(error), ..Self::bare(opcode, user_tag) }
    }
}

pub type OpCallback = Box<dyn FnOnce(Completion) + Send>;

/// Receives proactor side-channel records (transmit timestamps, zero-copy
/// completions), on the socket's strand.
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

struct PendingAccept {
    user_tag: u64,
    callback: OpCallback,
}

struct PendingConnect {
    user_tag: u64,
    endpoint: Endpoint,
    callback: OpCallback,
}

struct PendingSend {
    op: u64,
    user_tag: u64,
    data: Data,
    offset: usize,
    endpoint: Option<Endpoint>,
    zero_copy: bool,
    last_seq: Option<u32>,
    callback: OpCallback,
}

struct PendingRecv {
    op: u64,
    user_tag: u64,
    max: usize,
    callback: OpCallback,
}

/// Tracks buffers owned by the kernel during zero-copy transmits. An
/// entry is released only when the error-queue notification covering its
/// sequence number arrives; the completion of the send operation itself
/// does not return ownership.
struct ZeroCopyLedger {
    enabled: bool,
    next_seq: u32,
    inflight: Vec<(u32, Data)>,
}

impl ZeroCopyLedger {
    fn release_covered(&mut self, notification: &ZeroCopyNotification) -> usize {
        let before = self.inflight.len();
        self.inflight.retain(|(seq, _)| !notification.covers(*seq));
        before - self.inflight.len()
    }
}

struct OpState {
    config: SocketConfig,
    accepts: VecDeque<PendingAccept>,
    connect: Option<PendingConnect>,
    connect_in_progress: bool,
    sends: VecDeque<PendingSend>,
    recvs: VecDeque<PendingRecv>,
    ledger: ZeroCopyLedger,
    detach_completion: Option<(u64, OpCallback)>,
    failed: Option<Error>,
}

/// Completion driver: submitted `{accept, connect, send, recv, detach}`
/// operations are performed by the driver thread as the underlying
/// readiness backend allows, and reported as completions.
///
/// This is the portable encoding of the completion model: operations own
/// their buffers while in flight, completions dispatch under the same
/// acquire/release discipline as the reactor, and zero-copy transmits are
/// confirmed through the notification stream.
pub struct Proactor {
    reactor: Arc<Reactor>,
}

impl Proactor {
    pub fn new(config: ReactorConfig) -> Result<Self> {
        Ok(Self { reactor: Reactor::new(config)? })
    }

    pub fn driver(&self) -> DriverName {
        self.reactor.driver()
    }

    /// One completion cycle; see [`Reactor::poll`].
    pub fn poll(&self, timeout: Option<Nanos>) -> Result<usize> {
        self.reactor.poll(timeout)
    }

    pub fn wake(&self) {
        self.reactor.wake();
    }

    /// Attaches a socket for completion-mode I/O. Interest starts fully
    /// disarmed; submitting operations arms what they need.
    pub fn attach(
        &self,
        handle: SocketHandle,
        config: SocketConfig,
        notifications: Option<NotificationHandler>,
    ) -> Result<Arc<ProactorSocket>> {
        config.validate()?;

        let zero_copy_enabled =
            config.zero_copy_threshold > 0 && handle.set_zero_copy(true).is_ok();

        let shared = Arc::clone(self.reactor.shared());
        let executor: Arc<dyn Executor> = shared.clone();
        let strand = Strand::new(executor);
        let fd = handle.as_raw_fd();

        let socket = Arc::new_cyclic(|weak| ProactorSocket {
            weak_self: weak.clone(),
            shared: shared.clone(),
            handle,
            token: AtomicUsize::new(usize::MAX),
            next_op: AtomicU64::new(1),
            strand,
            detach: DetachContext::new(),
            notifications,
            state: Mutex::new(OpState {
                config,
                accepts: VecDeque::new(),
                connect: None,
                connect_in_progress: false,
                sends: VecDeque::new(),
                recvs: VecDeque::new(),
                ledger: ZeroCopyLedger { enabled: zero_copy_enabled, next_seq: 0, inflight: Vec::new() },
                detach_completion: None,
                failed: None,
            }),
        });

        // No standing interest: operations arm what they need.
        let weak: Weak<dyn ReactorSocket> = socket.weak_self.clone();
        let token = shared.attach(fd, weak, InterestSet::NONE)?;
        socket.token.store(token, Ordering::Release);
        Ok(socket)
    }
}

/// One socket attached to a [`Proactor`], with its queues of in-flight
/// operations.
pub struct ProactorSocket {
    weak_self: Weak<ProactorSocket>,
    shared: Arc<ReactorShared>,
    handle: SocketHandle,
    token: AtomicUsize,
    next_op: AtomicU64,
    strand: Strand,
    detach: DetachContext,
    notifications: Option<NotificationHandler>,
    state: Mutex<OpState>,
}

impl ProactorSocket {
    pub fn handle(&self) -> &SocketHandle {
        &self.handle
    }

    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    #[inline]
    fn token(&self) -> usize {
        self.token.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, OpState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn guarded<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let authorized = self.detach.acquire();
        let result = if authorized { op() } else { Err(Error::NotOpen) };
        if self.detach.release() {
            self.do_announce_detached();
        }
        result
    }

    fn complete(&self, callback: OpCallback, completion: Completion) {
        self.strand.execute(move || callback(completion));
    }

    fn notify(&self, notification: Notification) {
        if let Some(handler) = &self.notifications {
            let handler = Arc::clone(handler);
            self.strand.execute(move || handler(notification));
        }
    }

    fn next_op(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::Relaxed)
    }

    /// Submits an accept. Completes with an owned handle and peer
    /// endpoint; the new socket is not attached anywhere yet.
    pub fn submit_accept(&self, user_tag: u64, callback: OpCallback) -> Result<()> {
        self.guarded(|| {
            {
                let mut state = self.lock_state();
                if let Some(error) = state.failed {
                    return Err(error);
                }
                state.accepts.push_back(PendingAccept { user_tag, callback });
            }
            self.shared.show_readable(self.token())
        })
    }

    /// Submits a connect. At most one may be in flight.
    pub fn submit_connect(
        &self,
        endpoint: Endpoint,
        user_tag: u64,
        callback: OpCallback,
    ) -> Result<()> {
        self.guarded(|| {
            {
                let mut state = self.lock_state();
                if let Some(error) = state.failed {
                    return Err(error);
                }
                if state.connect.is_some() {
                    return Err(Error::Invalid);
                }
                state.connect =
                    Some(PendingConnect { user_tag, endpoint: endpoint.clone(), callback });
            }

            match self.handle.connect(&endpoint) {
                Ok(true) => {
                    self.finish_connect(None);
                    Ok(())
                }
                Ok(false) => {
                    self.lock_state().connect_in_progress = true;
                    self.shared.show_writable(self.token())
                }
                Err(error) => {
                    self.finish_connect(Some(error));
                    Ok(())
                }
            }
        })
    }

    /// Submits a send. The operation owns `data` while in flight. A large
    /// enough payload on a zero-copy enabled socket is handed to the
    /// kernel without copying; its buffers stay retained in the ledger
    /// past the operation's completion, until the notification stream
    /// confirms the transmit.
    pub fn submit_send(
        &self,
        data: Data,
        options: SendOptions,
        user_tag: u64,
        callback: OpCallback,
    ) -> Result<()> {
        if data.is_empty() {
            return Err(Error::Invalid);
        }
        self.guarded(|| {
            let deadline = options.deadline;
            let op = {
                let mut state = self.lock_state();
                if let Some(error) = state.failed {
                    return Err(error);
                }
                let zero_copy = state.ledger.enabled &&
                    (options.zero_copy || data.len() >= state.config.zero_copy_threshold);
                let op = self.next_op();
                state.sends.push_back(PendingSend {
                    op,
                    user_tag,
                    data,
                    offset: 0,
                    endpoint: options.endpoint.clone(),
                    zero_copy,
                    last_seq: None,
                    callback,
                });
                op
            };

            self.notify(Notification::Timestamp(TimestampNotification {
                id: user_tag,
                kind: TimestampKind::Scheduled,
                time: Nanos::now(),
            }));
            if let Some(deadline) = deadline {
                self.schedule_expiry(OpCode::Send, op, deadline);
            }
            self.shared.show_writable(self.token())
        })
    }

    /// Submits a receive of up to `max` bytes (one whole message on a
    /// datagram socket).
    pub fn submit_recv(
        &self,
        max: usize,
        deadline: Option<Nanos>,
        user_tag: u64,
        callback: OpCallback,
    ) -> Result<()> {
        if max == 0 {
            return Err(Error::Invalid);
        }
        self.guarded(|| {
            let op = {
                let mut state = self.lock_state();
                if let Some(error) = state.failed {
                    return Err(error);
                }
                let op = self.next_op();
                state.recvs.push_back(PendingRecv { op, user_tag, max, callback });
                op
            };
            if let Some(deadline) = deadline {
                self.schedule_expiry(OpCode::Recv, op, deadline);
            }
            self.shared.show_readable(self.token())
        })
    }

    /// Initiates detachment: in-flight operations are drained with
    /// `Canceled`, and once every processing thread has released the
    /// socket the completion fires (exactly once, on the strand) with
    /// opcode `Detach`.
    pub fn detach(&self, user_tag: u64, callback: OpCallback) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.detach_completion.is_some() {
                return Err(Error::Invalid);
            }
            state.detach_completion = Some((user_tag, callback));
        }
        self.cancel_all(Error::Canceled);

        match self.detach.request() {
            Ok(()) => {
                self.do_announce_detached();
                Ok(())
            }
            Err(Error::WouldBlock) => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn cancel_all(&self, error: Error) {
        let mut cancelled: Vec<(OpCallback, Completion)> = Vec::new();
        {
            let mut state = self.lock_state();
            for pending in state.accepts.drain(..) {
                cancelled.push((
                    pending.callback,
                    Completion::failed(OpCode::Accept, pending.user_tag, error),
                ));
            }
            if let Some(pending) = state.connect.take() {
                state.connect_in_progress = false;
                cancelled.push((
                    pending.callback,
                    Completion::failed(OpCode::Connect, pending.user_tag, error),
                ));
            }
            for pending in state.sends.drain(..) {
                cancelled.push((
                    pending.callback,
                    Completion::failed(OpCode::Send, pending.user_tag, error),
                ));
            }
            for pending in state.recvs.drain(..) {
                cancelled.push((
                    pending.callback,
                    Completion::failed(OpCode::Recv, pending.user_tag, error),
                ));
            }
        }
        for (callback, completion) in cancelled {
            self.complete(callback, completion);
        }
        let _ = self.shared.hide_readable(self.token());
        let _ = self.shared.hide_writable(self.token());
    }

    fn schedule_expiry(&self, opcode: OpCode, op: u64, deadline: Nanos) {
        let weak = self.weak_self.clone();
        self.shared.schedule_timer_at(
            deadline,
            TimerOptions::default(),
            Box::new(move |_context| {
                if let Some(socket) = weak.upgrade() {
                    socket.expire_op(opcode, op);
                }
            }),
        );
    }

    fn expire_op(&self, opcode: OpCode, op: u64) {
        let authorized = self.detach.acquire();
        if authorized {
            let expired: Option<(OpCallback, Completion)> = {
                let mut state = self.lock_state();
                match opcode {
                    OpCode::Send => state
                        .sends
                        .iter()
                        .position(|pending| pending.op == op && pending.offset == 0)
                        .and_then(|index| state.sends.remove(index))
                        .map(|pending| {
                            (
                                pending.callback,
                                Completion::failed(OpCode::Send, pending.user_tag, Error::Timeout),
                            )
                        }),
                    OpCode::Recv => state
                        .recvs
                        .iter()
                        .position(|pending| pending.op == op)
                        .and_then(|index| state.recvs.remove(index))
                        .map(|pending| {
                            (
                                pending.callback,
                                Completion::failed(OpCode::Recv, pending.user_tag, Error::Timeout),
                            )
                        }),
                    _ => None,
                }
            };
            if let Some((callback, completion)) = expired {
                self.complete(callback, completion);
            }
        }
        if self.detach.release() {
            self.do_announce_detached();
        }
    }

    // --- driver-side servicing --------------------------------------------

    fn service_accepts(&self) {
        loop {
            {
                let state = self.lock_state();
                if state.accepts.is_empty() {
                    return;
                }
            }
            match self.handle.accept() {
                Ok((accepted, peer)) => {
                    let Some(pending) = self.lock_state().accepts.pop_front() else { return };
                    let mut completion = Completion::bare(OpCode::Accept, pending.user_tag);
                    completion.endpoint = Some(peer.clone());
                    completion.accepted = Some((accepted, peer));
                    self.complete(pending.callback, completion);
                }
                Err(Error::WouldBlock) => return,
                Err(Error::Interrupted) | Err(Error::ConnectionReset) => {}
                Err(error) => {
                    self.fail(error);
                    return;
                }
            }
        }
    }

    fn finish_connect(&self, error: Option<Error>) {
        let finished = {
            let mut state = self.lock_state();
            state.connect_in_progress = false;
            state.connect.take()
        };
        let Some(pending) = finished else { return };

        let mut completion = Completion::bare(OpCode::Connect, pending.user_tag);
        completion.endpoint = Some(pending.endpoint);
        completion.error = error;
        self.complete(pending.callback, completion);
    }

    fn service_connect(&self) {
        let in_progress = self.lock_state().connect_in_progress;
        if !in_progress {
            return;
        }
        match self.handle.take_error() {
            Ok(None) => self.finish_connect(None),
            Ok(Some(error)) | Err(error) => self.finish_connect(Some(error)),
        }
    }

    fn service_sends(&self) {
        loop {
            let mut finished: Option<PendingSend> = None;
            let mut fatal: Option<Error> = None;

            // The syscall happens under the state lock (it never blocks);
            // only completions and notifications wait for release.
            let keep_going = {
                let mut state = self.lock_state();
                let attempt = {
                    let Some(front) = state.sends.front() else {
                        drop(state);
                        let _ = self.shared.hide_writable(self.token());
                        return;
                    };
                    let use_zero_copy = front.zero_copy && cfg!(target_os = "linux");
                    let mut iovecs = Vec::new();
                    let mut gathered = 0;
                    front.data.gather(
                        front.offset,
                        &GatherLimits::default(),
                        &mut gathered,
                        &mut iovecs,
                    );
                    (
                        self.handle.send_vectored(&iovecs, front.endpoint.as_ref(), use_zero_copy),
                        use_zero_copy,
                    )
                };

                match attempt {
                    (Ok(n), use_zero_copy) => {
                        let seq = if use_zero_copy {
                            let seq = state.ledger.next_seq;
                            state.ledger.next_seq = state.ledger.next_seq.wrapping_add(1);
                            Some(seq)
                        } else {
                            None
                        };
                        if let Some(front) = state.sends.front_mut() {
                            front.offset += n;
                            if seq.is_some() {
                                front.last_seq = seq;
                            }
                            if front.offset >= front.data.len() {
                                finished = state.sends.pop_front();
                            }
                        }
                        true
                    }
                    (Err(Error::WouldBlock), _) => false,
                    (Err(Error::Interrupted), _) => true,
                    (Err(error), _) => {
                        fatal = Some(error);
                        false
                    }
                }
            };

            if let Some(pending) = finished {
                let total_len = pending.data.len();
                let used_zero_copy = pending.last_seq.is_some();
                self.finish_send(pending, total_len, used_zero_copy);
            }
            if let Some(error) = fatal {
                self.fail(error);
                return;
            }
            if !keep_going {
                return;
            }
        }
    }

    fn finish_send(&self, pending: PendingSend, total_len: usize, used_zero_copy: bool) {
        let user_tag = pending.user_tag;
        let wants_release_notice = pending.zero_copy;

        if used_zero_copy {
            if let Some(last_seq) = pending.last_seq {
                // Kernel still references the buffers; park them in the
                // ledger until the error queue confirms the range.
                self.lock_state().ledger.inflight.push((last_seq, pending.data));
            }
        } else if wants_release_notice {
            // Zero copy was requested but unavailable: a deep copy was
            // made, so ownership returns now and the stream says so.
            self.notify(Notification::ZeroCopy(ZeroCopyNotification {
                from_seq: 0,
                thru_seq: 0,
                kind: ZeroCopyType::Deferred,
            }));
        }

        self.notify(Notification::Timestamp(TimestampNotification {
            id: user_tag,
            kind: TimestampKind::Sent,
            time: Nanos::now(),
        }));

        let mut completion = Completion::bare(OpCode::Send, user_tag);
        completion.bytes_transferred = total_len;
        self.complete(pending.callback, completion);
    }

    fn service_recvs(&self) {
        loop {
            let max = {
                let state = self.lock_state();
                match state.recvs.front() {
                    Some(pending) => pending.max,
                    None => {
                        drop(state);
                        if self.lock_state().accepts.is_empty() {
                            let _ = self.shared.hide_readable(self.token());
                        }
                        return;
                    }
                }
            };

            let mut segment = self.shared.pool.segment();
            let cap = max.min(segment.capacity());
            match self.handle.recv_from(&mut segment.spare_mut()[..cap]) {
                Ok((0, _)) if self.handle.transport().is_stream() => {
                    // Orderly peer shutdown: every queued receive observes
                    // end of stream.
                    let drained: Vec<PendingRecv> =
                        self.lock_state().recvs.drain(..).collect();
                    for pending in drained {
                        self.complete(
                            pending.callback,
                            Completion::failed(OpCode::Recv, pending.user_tag, Error::Eof),
                        );
                    }
                    let _ = self.shared.hide_readable(self.token());
                    return;
                }
                Ok((n, sender)) => {
                    segment.advance(n);
                    let Some(pending) = self.lock_state().recvs.pop_front() else { return };
                    let mut completion = Completion::bare(OpCode::Recv, pending.user_tag);
                    completion.bytes_transferred = n;
                    completion.endpoint = sender;
                    completion.data = Some(segment.as_slice().to_vec());
                    self.complete(pending.callback, completion);
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

    /// Error-queue servicing: zero-copy confirmations first, then real
    /// pending errors.
    fn process_error(&self) {
        #[cfg(target_os = "linux")]
        {
            let has_inflight = !self.lock_state().ledger.inflight.is_empty();
            if has_inflight {
                self.drain_zero_copy_queue();
                return;
            }
        }
        match self.handle.take_error() {
            Ok(Some(error)) => self.fail(error),
            Ok(None) => {}
            Err(error) => self.fail(error),
        }
    }

    #[cfg(target_os = "linux")]
    fn drain_zero_copy_queue(&self) {
        for notification in errqueue::drain(&self.handle) {
            let released = self.lock_state().ledger.release_covered(&notification);
            debug!(
                from = notification.from_seq,
                thru = notification.thru_seq,
                kind = ?notification.kind,
                released,
                "zero-copy range confirmed"
            );
            self.notify(Notification::ZeroCopy(notification));
        }
    }

    fn fail(&self, error: Error) {
        {
            let mut state = self.lock_state();
            if state.failed.is_some() {
                return;
            }
            state.failed = Some(error);
        }
        self.cancel_all(error);
    }

    fn do_announce_detached(&self) {
        let completion = self.lock_state().detach_completion.take();
        if let Some((user_tag, callback)) = completion {
            self.complete(callback, Completion::bare(OpCode::Detach, user_tag));
        }
        self.shared.remove(self.token());
    }
}

impl ReactorSocket for ProactorSocket {
    fn process_event(&self, event: ReadinessEvent) {
        if event.error {
            self.process_error();
        }
        if event.readable || event.hangup {
            self.service_accepts();
            self.service_recvs();
        }
        if event.writable {
            self.service_connect();
            self.service_sends();
        }
    }

    fn detach_context(&self) -> &DetachContext {
        &self.detach
    }

    fn announce_detached(&self) {
        self.do_announce_detached();
    }
}

impl std::fmt::Debug for ProactorSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProactorSocket").field("handle", &self.handle).finish()
    }
}

/// MSG_ERRQUEUE parsing for zero-copy transmit confirmations.
#[cfg(target_os = "linux")]
mod errqueue {
    use std::os::fd::AsRawFd;

    use crate::{
        event::{ZeroCopyNotification, ZeroCopyType},
        handle::SocketHandle,
    };

    // Kernel ABI constants for struct sock_extended_err.
    const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
    const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

    pub(super) fn drain(handle: &SocketHandle) -> Vec<ZeroCopyNotification> {
        let mut notifications = Vec::new();

        loop {
            let mut control = [0_u8; 256];
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = control.len() as _;

            let n = unsafe {
                libc::recvmsg(handle.as_raw_fd(), &mut msg, libc::MSG_ERRQUEUE)
            };
            if n < 0 {
                break;
            }

            let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
            while !cmsg.is_null() {
                let header = unsafe { &*cmsg };
                let is_recverr = (header.cmsg_level == libc::SOL_IP &&
                    header.cmsg_type == libc::IP_RECVERR) ||
                    (header.cmsg_level == libc::SOL_IPV6 &&
                        header.cmsg_type == libc::IPV6_RECVERR);
                if is_recverr {
                    let err = unsafe {
                        &*(libc::CMSG_DATA(cmsg).cast::<libc::sock_extended_err>())
                    };
                    if err.ee_errno == 0 && err.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                        let kind = if err.ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0 {
                            ZeroCopyType::Deferred
                        } else {
                            ZeroCopyType::Avoided
                        };
                        notifications.push(ZeroCopyNotification {
                            from_seq: err.ee_info,
                            thru_seq: err.ee_data,
                            kind,
                        });
                    }
                }
                cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
            }
        }

        notifications
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(len: usize) -> Data {
        Data::Bytes(vec![0_u8; len])
    }

    #[test]
    fn ledger_releases_covered_ranges() {
        let mut ledger = ZeroCopyLedger { enabled: true, next_seq: 0, inflight: Vec::new() };
        ledger.inflight.push((0, data(10)));
        ledger.inflight.push((1, data(10)));
        ledger.inflight.push((5, data(10)));

        let released = ledger.release_covered(&ZeroCopyNotification {
            from_seq: 0,
            thru_seq: 1,
            kind: ZeroCopyType::Avoided,
        });
        assert_eq!(released, 2);
        assert_eq!(ledger.inflight.len(), 1);
        assert_eq!(ledger.inflight[0].0, 5);
    }

    #[test]
    fn ledger_survives_sequence_wrap() {
        let mut ledger = ZeroCopyLedger { enabled: true, next_seq: 0, inflight: Vec::new() };
        ledger.inflight.push((u32::MAX, data(1)));
        ledger.inflight.push((0, data(1)));

        let released = ledger.release_covered(&ZeroCopyNotification {
            from_seq: u32::MAX,
            thru_seq: 0,
            kind: ZeroCopyType::Deferred,
        });
        assert_eq!(released, 2);
        assert!(ledger.inflight.is_empty());
    }
}
