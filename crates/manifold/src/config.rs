use std::{fmt, str::FromStr};

use manifold_utils::ThreadPriority;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::error::{Error, Result};

/// Readiness/completion backend selection. Which names are usable depends
/// on the platform; `validate` rejects the rest synchronously.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverName {
    Select,
    Poll,
    Epoll,
    Kqueue,
    Devpoll,
    Eventport,
    Pollset,
    Iocp,
}

impl DriverName {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverName::Select => "select",
            DriverName::Poll => "poll",
            DriverName::Epoll => "epoll",
            DriverName::Kqueue => "kqueue",
            DriverName::Devpoll => "devpoll",
            DriverName::Eventport => "eventport",
            DriverName::Pollset => "pollset",
            DriverName::Iocp => "iocp",
        }
    }

    /// The preferred driver for this platform.
    pub fn platform_default() -> Self {
        #[cfg(target_os = "linux")]
        {
            DriverName::Epoll
        }
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        {
            DriverName::Kqueue
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        )))]
        {
            DriverName::Poll
        }
    }

    pub fn is_supported(&self) -> bool {
        match self {
            DriverName::Select | DriverName::Poll => true,
            DriverName::Epoll => cfg!(target_os = "linux"),
            DriverName::Kqueue => cfg!(any(
                target_os = "macos",
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd"
            )),
            DriverName::Devpoll | DriverName::Eventport | DriverName::Pollset |
            DriverName::Iocp => false,
        }
    }
}

impl Default for DriverName {
    fn default() -> Self {
        Self::platform_default()
    }
}

impl fmt::Display for DriverName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "select" => Ok(DriverName::Select),
            "poll" => Ok(DriverName::Poll),
            "epoll" => Ok(DriverName::Epoll),
            "kqueue" => Ok(DriverName::Kqueue),
            "devpoll" => Ok(DriverName::Devpoll),
            "eventport" => Ok(DriverName::Eventport),
            "pollset" => Ok(DriverName::Pollset),
            "iocp" => Ok(DriverName::Iocp),
            _ => Err(Error::Invalid),
        }
    }
}

impl Serialize for DriverName {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DriverName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(|_| de::Error::custom(format!("unknown driver '{text}'")))
    }
}

/// How the reactor announces a persistent condition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Announced while the condition persists.
    #[default]
    Level,
    /// Announced on transitions; the session must drain until `WouldBlock`.
    Edge,
}

/// Per-socket queue tuning. Watermark pairs are validated, not silently
/// reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub write_queue_low_watermark: usize,
    pub write_queue_high_watermark: usize,
    pub read_queue_low_watermark: usize,
    pub read_queue_high_watermark: usize,
    pub min_incoming_transfer: usize,
    pub max_incoming_transfer: usize,
    pub keep_half_open: bool,
    pub zero_copy_threshold: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            write_queue_low_watermark: 0,
            write_queue_high_watermark: 64 * 1024 * 1024,
            read_queue_low_watermark: 1,
            read_queue_high_watermark: 512 * 1024 * 1024,
            min_incoming_transfer: 4096,
            max_incoming_transfer: 512 * 1024,
            keep_half_open: false,
            zero_copy_threshold: 10240,
        }
    }
}

impl SocketConfig {
    pub fn validate(&self) -> Result<()> {
        if self.write_queue_low_watermark > self.write_queue_high_watermark {
            return Err(Error::Invalid);
        }
        if self.read_queue_low_watermark > self.read_queue_high_watermark {
            return Err(Error::Invalid);
        }
        if self.min_incoming_transfer > self.max_incoming_transfer {
            return Err(Error::Invalid);
        }
        Ok(())
    }
}

/// Driver-level knobs shared by the reactor and the proactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    pub driver: DriverName,
    pub trigger: TriggerMode,
    pub one_shot: bool,
    pub auto_attach: bool,
    pub auto_detach: bool,
    pub max_events_per_wait: usize,
    /// Zero means unlimited.
    pub max_timers_per_wait: usize,
    pub max_cycles_per_wait: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            driver: DriverName::platform_default(),
            trigger: TriggerMode::default(),
            one_shot: false,
            auto_attach: false,
            auto_detach: false,
            max_events_per_wait: 128,
            max_timers_per_wait: 0,
            max_cycles_per_wait: 1,
        }
    }
}

impl ReactorConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.driver.is_supported() {
            return Err(Error::Invalid);
        }
        if self.max_events_per_wait == 0 || self.max_cycles_per_wait == 0 {
            return Err(Error::Invalid);
        }
        Ok(())
    }
}

/// Thread pool shape, placement and balancing regime. The pool starts at
/// `min_threads` and grows under attach pressure up to `max_threads`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub dynamic_load_balancing: bool,
    /// Cores the driver threads pin to, assigned round-robin as threads
    /// spawn. Empty means no pinning.
    pub cores: Vec<usize>,
    pub thread_priority: ThreadPriority,
    pub reactor: ReactorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 1,
            dynamic_load_balancing: false,
            cores: Vec::new(),
            thread_priority: ThreadPriority::default(),
            reactor: ReactorConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub const MAX_THREADS: usize = 128;

    pub fn validate(&self) -> Result<()> {
        if self.min_threads == 0 ||
            self.min_threads > self.max_threads ||
            self.max_threads > Self::MAX_THREADS
        {
            return Err(Error::Invalid);
        }
        self.reactor.validate()
    }

    /// Core assignment for the driver thread at `index`, cycling the
    /// configured list.
    pub fn core_for(&self, index: usize) -> Option<usize> {
        if self.cores.is_empty() { None } else { Some(self.cores[index % self.cores.len()]) }
    }
}
