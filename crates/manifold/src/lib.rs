//! Asynchronous sockets runtime: readiness and completion drivers
//! multiplexing many TCP/UDP/local sockets over a small pool of driver
//! threads, with per-socket queues, watermark backpressure, timers and an
//! orderly detach protocol.

pub mod buffer;
pub mod config;
pub mod detach;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod handle;
pub mod options;
pub mod proactor;
pub mod queue;
pub mod reactor;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod strand;
pub mod timer;

pub use buffer::{Blob, BlobPool, Data, GatherLimits, Segment};
pub use config::{DriverName, ReactorConfig, SchedulerConfig, SocketConfig, TriggerMode};
pub use endpoint::{Endpoint, IpEndpoint, LocalName};
pub use error::{Error, Result};
pub use event::{
    Notification, QueueContext, SessionEvent, TimestampKind, TimestampNotification,
    ZeroCopyNotification, ZeroCopyType,
};
pub use handle::{SocketHandle, Transport};
pub use manifold_utils::ThreadPriority;
pub use options::{ReceiveOptions, SendOptions};
pub use proactor::{Completion, OpCode, Proactor, ProactorSocket};
pub use queue::{SendCallback, SendContext};
pub use reactor::Reactor;
pub use scheduler::Scheduler;
pub use session::{AcceptHandler, Observer, SocketSession};
pub use shutdown::{ShutdownContext, ShutdownDirection, ShutdownOrigin, ShutdownPhase};
pub use strand::Strand;
pub use timer::{TimerContext, TimerId, TimerOptions};
