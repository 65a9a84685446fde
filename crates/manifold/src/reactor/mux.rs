use std::{
    collections::HashMap,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::Mutex,
};

use manifold_timing::Nanos;
use mio::unix::SourceFd;
use tracing::debug;

use crate::{
    config::DriverName,
    error::{Error, Result},
};

/// Token value reserved for the cross-thread waker. `usize::MAX` itself is
/// reserved by the scalable backends.
pub(crate) const WAKER_TOKEN: usize = usize::MAX - 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct InterestSet {
    pub readable: bool,
    pub writable: bool,
}

impl InterestSet {
    pub const NONE: InterestSet = InterestSet { readable: false, writable: false };
    pub const READABLE: InterestSet = InterestSet { readable: true, writable: false };

    #[inline]
    pub fn any(&self) -> bool {
        self.readable || self.writable
    }
}

/// Raw readiness reported by a backend for one token.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct MuxEvent {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// One OS readiness primitive behind a uniform surface. Registration
/// changes may come from any thread; `wait` sees a snapshot taken at entry.
pub(crate) trait Multiplexer: Send + Sync {
    fn name(&self) -> DriverName;

    /// Level backends re-report a persistent condition every wait; the
    /// scalable backends report transitions only.
    fn is_level(&self) -> bool;

    fn register(&self, fd: RawFd, token: usize, interest: InterestSet) -> Result<()>;
    fn reregister(&self, fd: RawFd, token: usize, interest: InterestSet) -> Result<()>;
    fn deregister(&self, fd: RawFd) -> Result<()>;

    /// Blocks up to `timeout` (forever when `None`) and appends at most
    /// `max_events` readiness records to `out`.
    fn wait(&self, out: &mut Vec<MuxEvent>, timeout: Option<Nanos>, max_events: usize)
    -> Result<()>;

    /// Interrupts a concurrent `wait`, from any thread.
    fn wake(&self);
}

pub(crate) fn create(driver: DriverName) -> Result<Box<dyn Multiplexer>> {
    if !driver.is_supported() {
        return Err(Error::Invalid);
    }
    match driver {
        DriverName::Select => Ok(Box::new(SelectMux::new()?)),
        DriverName::Poll => Ok(Box::new(PollMux::new()?)),
        DriverName::Epoll | DriverName::Kqueue => Ok(Box::new(MioMux::new(driver)?)),
        _ => Err(Error::Invalid),
    }
}

// --- mio backend (epoll / kqueue) -----------------------------------------

struct MioMux {
    name: DriverName,
    // Poll and its event buffer travel together: whichever thread wins the
    // wait owns both for that cycle.
    poll: Mutex<(mio::Poll, mio::Events)>,
    registry: mio::Registry,
    waker: mio::Waker,
}

impl MioMux {
    fn new(name: DriverName) -> Result<Self> {
        let poll = mio::Poll::new().map_err(Error::from)?;
        let registry = poll.registry().try_clone().map_err(Error::from)?;
        let waker = mio::Waker::new(poll.registry(), mio::Token(WAKER_TOKEN)).map_err(Error::from)?;
        Ok(Self {
            name,
            poll: Mutex::new((poll, mio::Events::with_capacity(1024))),
            registry,
            waker,
        })
    }

    fn to_mio(interest: InterestSet) -> mio::Interest {
        match (interest.readable, interest.writable) {
            (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
            (false, true) => mio::Interest::WRITABLE,
            // Callers never pass NONE; they deregister instead.
            _ => mio::Interest::READABLE,
        }
    }
}

impl Multiplexer for MioMux {
    fn name(&self) -> DriverName {
        self.name
    }

    fn is_level(&self) -> bool {
        false
    }

    fn register(&self, fd: RawFd, token: usize, interest: InterestSet) -> Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), mio::Token(token), Self::to_mio(interest))
            .map_err(Error::from)
    }

    fn reregister(&self, fd: RawFd, token: usize, interest: InterestSet) -> Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), mio::Token(token), Self::to_mio(interest))
            .map_err(Error::from)
    }

    fn deregister(&self, fd: RawFd) -> Result<()> {
        self.registry.deregister(&mut SourceFd(&fd)).map_err(Error::from)
    }

    fn wait(
        &self,
        out: &mut Vec<MuxEvent>,
        timeout: Option<Nanos>,
        max_events: usize,
    ) -> Result<()> {
        let mut guard = self.poll.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let (poll, events) = &mut *guard;

        match poll.poll(events, timeout.map(Into::into)) {
            Ok(()) => {}
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        for event in events.iter().take(max_events) {
            if event.token().0 == WAKER_TOKEN {
                continue;
            }
            out.push(MuxEvent {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                error: event.is_error(),
                hangup: event.is_read_closed(),
            });
        }
        Ok(())
    }

    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            debug!(?err, "mux: waker failed");
        }
    }
}

// --- self-pipe waker shared by the libc backends --------------------------

struct PipeWaker {
    read_end: OwnedFd,
    write_end: OwnedFd,
}

impl PipeWaker {
    fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::last_os_error());
        }
        let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        for fd in [&read_end, &write_end] {
            unsafe {
                let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
                libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self { read_end, write_end })
    }

    fn wake(&self) {
        let byte = 1_u8;
        unsafe {
            libc::write(self.write_end.as_raw_fd(), (&raw const byte).cast(), 1);
        }
    }

    fn drain(&self) {
        let mut buf = [0_u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_end.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn read_fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }
}

fn timeout_millis(timeout: Option<Nanos>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(nanos) => nanos.as_millis_u64().min(i32::MAX as u64) as libc::c_int,
    }
}

// --- poll(2) backend ------------------------------------------------------

struct PollMux {
    registrations: Mutex<HashMap<RawFd, (usize, InterestSet)>>,
    waker: PipeWaker,
}

impl PollMux {
    fn new() -> Result<Self> {
        Ok(Self { registrations: Mutex::new(HashMap::new()), waker: PipeWaker::new()? })
    }
}

impl Multiplexer for PollMux {
    fn name(&self) -> DriverName {
        DriverName::Poll
    }

    fn is_level(&self) -> bool {
        true
    }

    fn register(&self, fd: RawFd, token: usize, interest: InterestSet) -> Result<()> {
        self.registrations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(fd, (token, interest));
        self.wake();
        Ok(())
    }

    fn reregister(&self, fd: RawFd, token: usize, interest: InterestSet) -> Result<()> {
        self.register(fd, token, interest)
    }

    fn deregister(&self, fd: RawFd) -> Result<()> {
        self.registrations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&fd);
        self.wake();
        Ok(())
    }

    fn wait(
        &self,
        out: &mut Vec<MuxEvent>,
        timeout: Option<Nanos>,
        max_events: usize,
    ) -> Result<()> {
        // Snapshot: changes made during the wait surface next cycle.
        let mut fds: Vec<libc::pollfd> =
            vec![libc::pollfd { fd: self.waker.read_fd(), events: libc::POLLIN, revents: 0 }];
        let mut tokens: Vec<usize> = vec![WAKER_TOKEN];
        {
            let registrations =
                self.registrations.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for (fd, (token, interest)) in registrations.iter() {
                let mut events = 0;
                if interest.readable {
                    events |= libc::POLLIN;
                }
                if interest.writable {
                    events |= libc::POLLOUT;
                }
                fds.push(libc::pollfd { fd: *fd, events, revents: 0 });
                tokens.push(*token);
            }
        }

        let ret = unsafe {
            libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_millis(timeout))
        };
        if ret < 0 {
            let err = Error::last_os_error();
            return if err.is_transient() { Ok(()) } else { Err(err) };
        }

        for (pollfd, token) in fds.iter().zip(tokens) {
            if pollfd.revents == 0 {
                continue;
            }
            if token == WAKER_TOKEN {
                self.waker.drain();
                continue;
            }
            if out.len() >= max_events {
                break;
            }
            out.push(MuxEvent {
                token,
                readable: (pollfd.revents & libc::POLLIN) != 0,
                writable: (pollfd.revents & libc::POLLOUT) != 0,
                error: (pollfd.revents & (libc::POLLERR | libc::POLLNVAL)) != 0,
                hangup: (pollfd.revents & libc::POLLHUP) != 0,
            });
        }
        Ok(())
    }

    fn wake(&self) {
        self.waker.wake();
    }
}

// --- select(2) backend ----------------------------------------------------

struct SelectMux {
    registrations: Mutex<HashMap<RawFd, (usize, InterestSet)>>,
    waker: PipeWaker,
}

impl SelectMux {
    fn new() -> Result<Self> {
        Ok(Self { registrations: Mutex::new(HashMap::new()), waker: PipeWaker::new()? })
    }
}

impl Multiplexer for SelectMux {
    fn name(&self) -> DriverName {
        DriverName::Select
    }

    fn is_level(&self) -> bool {
        true
    }

    fn register(&self, fd: RawFd, token: usize, interest: InterestSet) -> Result<()> {
        // select cannot watch descriptors past its fixed set size.
        if fd as usize >= libc::FD_SETSIZE as usize {
            return Err(Error::Invalid);
        }
        self.registrations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(fd, (token, interest));
        self.wake();
        Ok(())
    }

    fn reregister(&self, fd: RawFd, token: usize, interest: InterestSet) -> Result<()> {
        self.register(fd, token, interest)
    }

    fn deregister(&self, fd: RawFd) -> Result<()> {
        self.registrations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&fd);
        self.wake();
        Ok(())
    }

    fn wait(
        &self,
        out: &mut Vec<MuxEvent>,
        timeout: Option<Nanos>,
        max_events: usize,
    ) -> Result<()> {
        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut error_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut error_set);
        }

        let wake_fd = self.waker.read_fd();
        unsafe { libc::FD_SET(wake_fd, &mut read_set) };
        let mut nfds = wake_fd;

        let snapshot: Vec<(RawFd, usize, InterestSet)> = {
            let registrations =
                self.registrations.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            registrations.iter().map(|(fd, (token, interest))| (*fd, *token, *interest)).collect()
        };
        for (fd, _, interest) in &snapshot {
            unsafe {
                if interest.readable {
                    libc::FD_SET(*fd, &mut read_set);
                }
                if interest.writable {
                    libc::FD_SET(*fd, &mut write_set);
                }
                libc::FD_SET(*fd, &mut error_set);
            }
            nfds = nfds.max(*fd);
        }

        let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
        let tv_ptr = match timeout {
            None => std::ptr::null_mut(),
            Some(nanos) => {
                let millis = nanos.as_millis_u64();
                tv.tv_sec = (millis / 1000) as _;
                tv.tv_usec = ((millis % 1000) * 1000) as _;
                &raw mut tv
            }
        };

        let ret = unsafe {
            libc::select(nfds + 1, &mut read_set, &mut write_set, &mut error_set, tv_ptr)
        };
        if ret < 0 {
            let err = Error::last_os_error();
            return if err.is_transient() { Ok(()) } else { Err(err) };
        }

        if unsafe { libc::FD_ISSET(wake_fd, &read_set) } {
            self.waker.drain();
        }

        for (fd, token, _) in snapshot {
            if out.len() >= max_events {
                break;
            }
            let readable = unsafe { libc::FD_ISSET(fd, &read_set) };
            let writable = unsafe { libc::FD_ISSET(fd, &write_set) };
            let error = unsafe { libc::FD_ISSET(fd, &error_set) };
            if readable || writable || error {
                out.push(MuxEvent { token, readable, writable, error, hangup: false });
            }
        }
        Ok(())
    }

    fn wake(&self) {
        self.waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{SocketHandle, Transport};

    fn exercise_backend(driver: DriverName) {
        let mux = create(driver).unwrap();
        assert_eq!(mux.name(), driver);

        // A UDP socket with a queued datagram reports readable.
        let receiver = SocketHandle::open(Transport::Udp4).unwrap();
        receiver.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = receiver.local_endpoint().unwrap();

        let sender = SocketHandle::open(Transport::Udp4).unwrap();
        sender
            .send_vectored(&[std::io::IoSlice::new(b"ping")], Some(&addr), false)
            .unwrap();

        mux.register(receiver.as_raw_fd(), 7, InterestSet::READABLE).unwrap();

        let mut events = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while events.is_empty() && std::time::Instant::now() < deadline {
            mux.wait(&mut events, Some(Nanos::from_millis(50)), 64).unwrap();
        }
        assert!(events.iter().any(|event| event.token == 7 && event.readable));

        mux.deregister(receiver.as_raw_fd()).unwrap();
    }

    #[test]
    fn poll_backend_reports_readable() {
        exercise_backend(DriverName::Poll);
    }

    #[test]
    fn select_backend_reports_readable() {
        exercise_backend(DriverName::Select);
    }

    #[test]
    fn default_backend_reports_readable() {
        exercise_backend(DriverName::platform_default());
    }

    #[test]
    fn wake_interrupts_wait() {
        let mux = create(DriverName::Poll).unwrap();
        let start = std::time::Instant::now();
        mux.wake();
        let mut events = Vec::new();
        mux.wait(&mut events, Some(Nanos::from_secs(5)), 64).unwrap();
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
        assert!(events.is_empty());
    }
}
