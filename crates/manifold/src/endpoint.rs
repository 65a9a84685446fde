use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::Error;

/// Transport-level address: an IP endpoint or a local (unix-domain) name.
///
/// The textual forms round-trip bit-exact: `a.b.c.d:port` for IPv4,
/// `[collapsed-v6%scope]:port` for IPv6 (RFC 5952 grouping, scope omitted
/// when zero) and a filesystem path for local names. Unnamed and abstract
/// local names are implementation-defined and do not round-trip through
/// text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ip(IpEndpoint),
    Local(LocalName),
}

impl Endpoint {
    #[inline]
    pub fn ip(addr: IpAddr, port: u16) -> Self {
        Endpoint::Ip(IpEndpoint::new(addr, port))
    }

    #[inline]
    pub fn is_ip(&self) -> bool {
        matches!(self, Endpoint::Ip(_))
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local(_))
    }

    pub fn as_ip(&self) -> Option<&IpEndpoint> {
        match self {
            Endpoint::Ip(ep) => Some(ep),
            Endpoint::Local(_) => None,
        }
    }

    pub fn as_local(&self) -> Option<&LocalName> {
        match self {
            Endpoint::Local(name) => Some(name),
            Endpoint::Ip(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(ep) => ep.fmt(f),
            Endpoint::Local(name) => name.fmt(f),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(ep) = s.parse::<IpEndpoint>() {
            return Ok(Endpoint::Ip(ep));
        }
        if s.is_empty() {
            return Err(Error::Invalid);
        }
        Ok(Endpoint::Local(LocalName::from_path(s)))
    }
}

impl From<IpEndpoint> for Endpoint {
    fn from(ep: IpEndpoint) -> Self {
        Endpoint::Ip(ep)
    }
}

impl From<LocalName> for Endpoint {
    fn from(name: LocalName) -> Self {
        Endpoint::Local(name)
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        let mut ep = IpEndpoint::new(addr.ip(), addr.port());
        if let std::net::SocketAddr::V6(v6) = addr {
            ep.scope_id = v6.scope_id();
        }
        Endpoint::Ip(ep)
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(|_| de::Error::custom(format!("invalid endpoint '{text}'")))
    }
}

/// IP address and port, with an IPv6 scope id for link-local addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IpEndpoint {
    pub addr: IpAddr,
    pub port: u16,
    pub scope_id: u32,
}

impl IpEndpoint {
    #[inline]
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port, scope_id: 0 }
    }

    #[inline]
    pub fn with_scope(addr: Ipv6Addr, port: u16, scope_id: u32) -> Self {
        Self { addr: IpAddr::V6(addr), port, scope_id }
    }

    /// The wildcard address with an ephemeral port, for binding.
    #[inline]
    pub fn any_v4() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    #[inline]
    pub fn any_v6() -> Self {
        Self::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }

    #[inline]
    pub fn loopback_v4(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[inline]
    pub fn is_v4(&self) -> bool {
        self.addr.is_ipv4()
    }

    #[inline]
    pub fn is_v6(&self) -> bool {
        self.addr.is_ipv6()
    }
}

impl fmt::Display for IpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(v4) => write!(f, "{}:{}", v4, self.port),
            IpAddr::V6(v6) => {
                if self.scope_id == 0 {
                    write!(f, "[{}]:{}", v6, self.port)
                } else {
                    write!(f, "[{}%{}]:{}", v6, self.scope_id, self.port)
                }
            }
        }
    }
}

impl FromStr for IpEndpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix('[') {
            // [v6%scope]:port
            let (inner, tail) = rest.split_once(']').ok_or(Error::Invalid)?;
            let port = tail.strip_prefix(':').ok_or(Error::Invalid)?;
            let port: u16 = port.parse().map_err(|_| Error::Invalid)?;

            let (addr, scope_id) = match inner.split_once('%') {
                Some((addr, scope)) => {
                    (addr, scope.parse::<u32>().map_err(|_| Error::Invalid)?)
                }
                None => (inner, 0),
            };
            let addr: Ipv6Addr = addr.parse().map_err(|_| Error::Invalid)?;
            return Ok(Self { addr: IpAddr::V6(addr), port, scope_id });
        }

        let (addr, port) = s.rsplit_once(':').ok_or(Error::Invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| Error::Invalid)?;
        let port: u16 = port.parse().map_err(|_| Error::Invalid)?;
        Ok(Self::new(IpAddr::V4(addr), port))
    }
}

impl From<std::net::SocketAddr> for IpEndpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(v4) => Self::new(IpAddr::V4(*v4.ip()), v4.port()),
            std::net::SocketAddr::V6(v6) => {
                Self { addr: IpAddr::V6(*v6.ip()), port: v6.port(), scope_id: v6.scope_id() }
            }
        }
    }
}

/// Name of a local (unix-domain) socket.
///
/// An unnamed endpoint (a socket that was never bound, or autobound) is
/// distinct from a name whose path is the empty string. Abstract names
/// exist only on Linux; the leading null of the abstract namespace is not
/// stored in the name bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LocalName {
    value: LocalValue,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
enum LocalValue {
    #[default]
    Unnamed,
    Path(Vec<u8>),
    Abstract(Vec<u8>),
}

impl LocalName {
    #[inline]
    pub fn unnamed() -> Self {
        Self { value: LocalValue::Unnamed }
    }

    pub fn from_path(path: impl AsRef<[u8]>) -> Self {
        Self { value: LocalValue::Path(path.as_ref().to_vec()) }
    }

    #[cfg(target_os = "linux")]
    pub fn from_abstract(name: impl AsRef<[u8]>) -> Self {
        Self { value: LocalValue::Abstract(name.as_ref().to_vec()) }
    }

    #[inline]
    pub fn is_unnamed(&self) -> bool {
        matches!(self.value, LocalValue::Unnamed)
    }

    #[inline]
    pub fn is_abstract(&self) -> bool {
        matches!(self.value, LocalValue::Abstract(_))
    }

    /// The name bytes; empty for unnamed endpoints.
    pub fn bytes(&self) -> &[u8] {
        match &self.value {
            LocalValue::Unnamed => &[],
            LocalValue::Path(bytes) | LocalValue::Abstract(bytes) => bytes,
        }
    }
}

impl fmt::Display for LocalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            LocalValue::Unnamed => write!(f, "(unnamed)"),
            LocalValue::Path(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            LocalValue::Abstract(bytes) => write!(f, "@{}", String::from_utf8_lossy(bytes)),
        }
    }
}
