use std::{
    fmt,
    io::IoSlice,
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{
    endpoint::{Endpoint, IpEndpoint, LocalName},
    error::{Error, Result},
    shutdown::ShutdownDirection,
};

/// Address family and socket type rolled into one, using the canonical
/// configuration strings (`tcp/ipv4`, `udp/ipv6`, `local/stream`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp4,
    Tcp6,
    Udp4,
    Udp6,
    LocalStream,
    LocalDatagram,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp4 => "tcp/ipv4",
            Transport::Tcp6 => "tcp/ipv6",
            Transport::Udp4 => "udp/ipv4",
            Transport::Udp6 => "udp/ipv6",
            Transport::LocalStream => "local/stream",
            Transport::LocalDatagram => "local/datagram",
        }
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        matches!(self, Transport::Tcp4 | Transport::Tcp6 | Transport::LocalStream)
    }

    #[inline]
    pub fn is_datagram(&self) -> bool {
        !self.is_stream()
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self, Transport::LocalStream | Transport::LocalDatagram)
    }

    fn domain(&self) -> libc::c_int {
        match self {
            Transport::Tcp4 | Transport::Udp4 => libc::AF_INET,
            Transport::Tcp6 | Transport::Udp6 => libc::AF_INET6,
            Transport::LocalStream | Transport::LocalDatagram => libc::AF_UNIX,
        }
    }

    fn socket_type(&self) -> libc::c_int {
        if self.is_stream() { libc::SOCK_STREAM } else { libc::SOCK_DGRAM }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp/ipv4" => Ok(Transport::Tcp4),
            "tcp/ipv6" => Ok(Transport::Tcp6),
            "udp/ipv4" => Ok(Transport::Udp4),
            "udp/ipv6" => Ok(Transport::Udp6),
            "local/stream" => Ok(Transport::LocalStream),
            "local/datagram" => Ok(Transport::LocalDatagram),
            _ => Err(Error::Invalid),
        }
    }
}

impl Serialize for Transport {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Transport {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(|_| de::Error::custom(format!("unknown transport '{text}'")))
    }
}

#[cfg(not(target_os = "linux"))]
const MSG_NOSIGNAL: libc::c_int = 0;
#[cfg(target_os = "linux")]
const MSG_NOSIGNAL: libc::c_int = libc::MSG_NOSIGNAL;

#[inline]
fn cvt(ret: isize) -> Result<usize> {
    if ret < 0 { Err(Error::last_os_error()) } else { Ok(ret as usize) }
}

#[inline]
fn cvt_i(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 { Err(Error::last_os_error()) } else { Ok(ret) }
}

/// Owns one OS descriptor; exactly one owner, dropping closes.
///
/// All descriptors are opened (and accepted) non-blocking and
/// close-on-exec; the drivers rely on `WouldBlock` to bound their work.
pub struct SocketHandle {
    fd: OwnedFd,
    transport: Transport,
}

impl SocketHandle {
    pub fn open(transport: Transport) -> Result<Self> {
        let raw = cvt_i(unsafe { libc::socket(transport.domain(), transport.socket_type(), 0) })?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let handle = Self { fd, transport };
        handle.set_cloexec()?;
        handle.set_blocking(false)?;
        #[cfg(target_vendor = "apple")]
        handle.set_opt(libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1 as libc::c_int)?;
        Ok(handle)
    }

    /// Adopts an already-open descriptor.
    ///
    /// # Safety
    /// `raw` must be a valid, open socket descriptor of the given transport
    /// that nothing else owns.
    pub unsafe fn acquire(raw: RawFd, transport: Transport) -> Self {
        Self { fd: unsafe { OwnedFd::from_raw_fd(raw) }, transport }
    }

    /// Relinquishes ownership, returning the raw descriptor unclosed.
    pub fn release(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    /// Explicit close; equivalent to drop but surfaces the OS result.
    pub fn close(self) -> Result<()> {
        cvt_i(unsafe { libc::close(self.fd.into_raw_fd()) })?;
        Ok(())
    }

    #[inline]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    fn set_cloexec(&self) -> Result<()> {
        cvt_i(unsafe { libc::fcntl(self.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
        Ok(())
    }

    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        let fd = self.as_raw_fd();
        let flags = cvt_i(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
        let flags =
            if blocking { flags & !libc::O_NONBLOCK } else { flags | libc::O_NONBLOCK };
        cvt_i(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) })?;
        Ok(())
    }

    pub fn bind(&self, endpoint: &Endpoint) -> Result<()> {
        let (storage, len) = addr::to_storage(endpoint)?;
        cvt_i(unsafe {
            libc::bind(self.as_raw_fd(), (&raw const storage).cast::<libc::sockaddr>(), len)
        })?;
        Ok(())
    }

    pub fn listen(&self, backlog: usize) -> Result<()> {
        cvt_i(unsafe { libc::listen(self.as_raw_fd(), backlog as libc::c_int) })?;
        Ok(())
    }

    /// Initiates a connection. `Ok(true)` means connected immediately,
    /// `Ok(false)` means in progress; completion is announced by
    /// writability (or a pending error) on the driver.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<bool> {
        let (storage, len) = addr::to_storage(endpoint)?;
        let ret = unsafe {
            libc::connect(self.as_raw_fd(), (&raw const storage).cast::<libc::sockaddr>(), len)
        };
        if ret == 0 {
            return Ok(true);
        }
        match Error::last_os_error() {
            Error::WouldBlock => Ok(false),
            err => Err(err),
        }
    }

    pub fn accept(&self) -> Result<(SocketHandle, Endpoint)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        #[cfg(target_os = "linux")]
        let raw = cvt_i(unsafe {
            libc::accept4(
                self.as_raw_fd(),
                (&raw mut storage).cast::<libc::sockaddr>(),
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        })?;
        #[cfg(not(target_os = "linux"))]
        let raw = cvt_i(unsafe {
            libc::accept(self.as_raw_fd(), (&raw mut storage).cast::<libc::sockaddr>(), &mut len)
        })?;

        let handle = Self { fd: unsafe { OwnedFd::from_raw_fd(raw) }, transport: self.transport };
        #[cfg(not(target_os = "linux"))]
        {
            handle.set_cloexec()?;
            handle.set_blocking(false)?;
        }

        let peer = addr::from_storage(&storage, len)?;
        Ok((handle, peer))
    }

    pub fn local_endpoint(&self) -> Result<Endpoint> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt_i(unsafe {
            libc::getsockname(self.as_raw_fd(), (&raw mut storage).cast::<libc::sockaddr>(), &mut len)
        })?;
        addr::from_storage(&storage, len)
    }

    pub fn peer_endpoint(&self) -> Result<Endpoint> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        cvt_i(unsafe {
            libc::getpeername(self.as_raw_fd(), (&raw mut storage).cast::<libc::sockaddr>(), &mut len)
        })?;
        addr::from_storage(&storage, len)
    }

    /// Scatter/gather send, optionally to an explicit destination
    /// (datagram sockets). `zero_copy` requests `MSG_ZEROCOPY` where the
    /// platform has it; completions then arrive on the error queue.
    pub fn send_vectored(
        &self,
        bufs: &[IoSlice<'_>],
        dest: Option<&Endpoint>,
        zero_copy: bool,
    ) -> Result<usize> {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        if let Some(endpoint) = dest {
            let (built, len) = addr::to_storage(endpoint)?;
            storage = built;
            msg.msg_name = (&raw mut storage).cast::<libc::c_void>();
            msg.msg_namelen = len;
        }

        // IoSlice is ABI-compatible with iovec.
        msg.msg_iov = bufs.as_ptr().cast_mut().cast::<libc::iovec>();
        msg.msg_iovlen = bufs.len() as _;

        let mut flags = MSG_NOSIGNAL;
        #[cfg(target_os = "linux")]
        if zero_copy {
            flags |= libc::MSG_ZEROCOPY;
        }
        #[cfg(not(target_os = "linux"))]
        let _ = zero_copy;

        cvt(unsafe { libc::sendmsg(self.as_raw_fd(), &msg, flags) })
    }

    /// Plain receive into `buf`. `Ok(0)` on a stream socket means the peer
    /// shut down its send side.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        cvt(unsafe { libc::recv(self.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), 0) })
    }

    /// Receive one message plus its sender, for unconnected datagram
    /// sockets.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Option<Endpoint>)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = cvt(unsafe {
            libc::recvfrom(
                self.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                (&raw mut storage).cast::<libc::sockaddr>(),
                &mut len,
            )
        })?;
        let sender = if len == 0 { None } else { addr::from_storage(&storage, len).ok() };
        Ok((n, sender))
    }

    /// Shuts down one or both directions. Succeeds as a no-op if the
    /// socket is already past the requested state.
    pub fn shutdown(&self, direction: ShutdownDirection) -> Result<()> {
        let how = match direction {
            ShutdownDirection::Send => libc::SHUT_WR,
            ShutdownDirection::Receive => libc::SHUT_RD,
            ShutdownDirection::Both => libc::SHUT_RDWR,
        };
        match cvt_i(unsafe { libc::shutdown(self.as_raw_fd(), how) }) {
            Ok(_) => Ok(()),
            Err(Error::NotOpen) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Consumes and returns the pending socket error, if any.
    pub fn take_error(&self) -> Result<Option<Error>> {
        let code: libc::c_int = self.get_opt(libc::SOL_SOCKET, libc::SO_ERROR)?;
        if code == 0 { Ok(None) } else { Ok(Some(Error::from_errno(code))) }
    }

    pub fn set_reuse_address(&self, enabled: bool) -> Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, enabled as libc::c_int)
    }

    pub fn set_keep_alive(&self, enabled: bool) -> Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, enabled as libc::c_int)
    }

    pub fn set_no_delay(&self, enabled: bool) -> Result<()> {
        if self.transport.is_local() {
            return Err(Error::Invalid);
        }
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, enabled as libc::c_int)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int)
    }

    pub fn send_buffer_size(&self) -> Result<usize> {
        self.get_opt::<libc::c_int>(libc::SOL_SOCKET, libc::SO_SNDBUF).map(|v| v as usize)
    }

    pub fn set_receive_buffer_size(&self, size: usize) -> Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int)
    }

    pub fn receive_buffer_size(&self) -> Result<usize> {
        self.get_opt::<libc::c_int>(libc::SOL_SOCKET, libc::SO_RCVBUF).map(|v| v as usize)
    }

    pub fn set_linger(&self, enabled: bool, secs: u32) -> Result<()> {
        let value = libc::linger { l_onoff: enabled as libc::c_int, l_linger: secs as libc::c_int };
        self.set_opt(libc::SOL_SOCKET, libc::SO_LINGER, value)
    }

    /// Opts the socket into zero-copy transmit completions.
    #[cfg(target_os = "linux")]
    pub fn set_zero_copy(&self, enabled: bool) -> Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_ZEROCOPY, enabled as libc::c_int)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn set_zero_copy(&self, _enabled: bool) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn set_opt<T: Copy>(&self, level: libc::c_int, name: libc::c_int, value: T) -> Result<()> {
        cvt_i(unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                level,
                name,
                (&raw const value).cast::<libc::c_void>(),
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    fn get_opt<T: Copy>(&self, level: libc::c_int, name: libc::c_int) -> Result<T> {
        let mut value: T = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<T>() as libc::socklen_t;
        cvt_i(unsafe {
            libc::getsockopt(
                self.as_raw_fd(),
                level,
                name,
                (&raw mut value).cast::<libc::c_void>(),
                &mut len,
            )
        })?;
        Ok(value)
    }
}

impl AsRawFd for SocketHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("fd", &self.as_raw_fd())
            .field("transport", &self.transport)
            .finish()
    }
}

mod addr {
    use super::*;

    fn sun_path_offset() -> usize {
        let un: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        let base = (&raw const un) as usize;
        let path = (&raw const un.sun_path) as usize;
        path - base
    }

    pub(crate) fn to_storage(
        endpoint: &Endpoint,
    ) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

        match endpoint {
            Endpoint::Ip(ep) => match ep.addr {
                std::net::IpAddr::V4(v4) => {
                    let sin = unsafe {
                        &mut *((&raw mut storage).cast::<libc::sockaddr_in>())
                    };
                    sin.sin_family = libc::AF_INET as libc::sa_family_t;
                    sin.sin_port = ep.port.to_be();
                    sin.sin_addr = libc::in_addr { s_addr: u32::from(v4).to_be() };
                    Ok((storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
                }
                std::net::IpAddr::V6(v6) => {
                    let sin6 = unsafe {
                        &mut *((&raw mut storage).cast::<libc::sockaddr_in6>())
                    };
                    sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    sin6.sin6_port = ep.port.to_be();
                    sin6.sin6_addr = libc::in6_addr { s6_addr: v6.octets() };
                    sin6.sin6_scope_id = ep.scope_id;
                    Ok((storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t))
                }
            },
            Endpoint::Local(name) => {
                let un = unsafe { &mut *((&raw mut storage).cast::<libc::sockaddr_un>()) };
                un.sun_family = libc::AF_UNIX as libc::sa_family_t;

                let offset = sun_path_offset();
                if name.is_unnamed() {
                    // Autobind (Linux) or an unbound source address.
                    return Ok((storage, offset as libc::socklen_t));
                }

                let bytes = name.bytes();
                if bytes.len() >= un.sun_path.len() {
                    return Err(Error::Invalid);
                }

                if name.is_abstract() {
                    // Leading null selects the abstract namespace; the name
                    // bytes follow without a terminator.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            bytes.as_ptr(),
                            un.sun_path.as_mut_ptr().add(1).cast::<u8>(),
                            bytes.len(),
                        );
                    }
                    Ok((storage, (offset + 1 + bytes.len()) as libc::socklen_t))
                } else {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            bytes.as_ptr(),
                            un.sun_path.as_mut_ptr().cast::<u8>(),
                            bytes.len(),
                        );
                    }
                    Ok((storage, (offset + bytes.len() + 1) as libc::socklen_t))
                }
            }
        }
    }

    pub(crate) fn from_storage(
        storage: &libc::sockaddr_storage,
        len: libc::socklen_t,
    ) -> Result<Endpoint> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*((storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>()) };
                let addr = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Ok(Endpoint::Ip(IpEndpoint::new(addr.into(), u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*((storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>()) };
                let addr = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(Endpoint::Ip(IpEndpoint {
                    addr: addr.into(),
                    port: u16::from_be(sin6.sin6_port),
                    scope_id: sin6.sin6_scope_id,
                }))
            }
            libc::AF_UNIX => {
                let un = unsafe { &*((storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_un>()) };
                let offset = sun_path_offset();
                let path_len = (len as usize).saturating_sub(offset);
                if path_len == 0 {
                    return Ok(Endpoint::Local(LocalName::unnamed()));
                }
                let bytes = unsafe {
                    std::slice::from_raw_parts(un.sun_path.as_ptr().cast::<u8>(), path_len)
                };
                #[cfg(target_os = "linux")]
                if bytes[0] == 0 {
                    return Ok(Endpoint::Local(LocalName::from_abstract(&bytes[1..])));
                }
                // Trailing null is not part of the name.
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                Ok(Endpoint::Local(LocalName::from_path(&bytes[..end])))
            }
            _ => Err(Error::Invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    #[test]
    fn transport_strings_roundtrip() {
        for text in
            ["tcp/ipv4", "tcp/ipv6", "udp/ipv4", "udp/ipv6", "local/stream", "local/datagram"]
        {
            assert_eq!(text.parse::<Transport>().unwrap().as_str(), text);
        }
        assert_eq!("sctp/ipv4".parse::<Transport>(), Err(Error::Invalid));
    }

    #[test]
    fn open_bind_reports_local_endpoint() {
        let handle = SocketHandle::open(Transport::Udp4).unwrap();
        handle.bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let local = handle.local_endpoint().unwrap();
        let ip = local.as_ip().unwrap();
        assert_eq!(ip.addr, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_ne!(ip.port, 0);
    }

    #[test]
    fn release_relinquishes_ownership() {
        let handle = SocketHandle::open(Transport::Udp4).unwrap();
        let raw = handle.release();
        // Still open after release: adopt and close it properly.
        let adopted = unsafe { SocketHandle::acquire(raw, Transport::Udp4) };
        adopted.close().unwrap();
    }

    #[test]
    fn buffer_size_option_roundtrips() {
        let handle = SocketHandle::open(Transport::Tcp4).unwrap();
        handle.set_send_buffer_size(64 * 1024).unwrap();
        // Kernels round the value; it must at least not shrink below the ask.
        assert!(handle.send_buffer_size().unwrap() >= 64 * 1024);
    }

    #[test]
    fn local_sockaddr_roundtrip() {
        let name = LocalName::from_path("/tmp/manifold-addr-test.sock");
        let (storage, len) = addr::to_storage(&Endpoint::Local(name.clone())).unwrap();
        let back = addr::from_storage(&storage, len).unwrap();
        assert_eq!(back, Endpoint::Local(name));
    }

    #[test]
    fn take_error_is_clean_on_fresh_socket() {
        let handle = SocketHandle::open(Transport::Tcp4).unwrap();
        assert_eq!(handle.take_error().unwrap(), None);
    }
}
