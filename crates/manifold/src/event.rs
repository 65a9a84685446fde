use manifold_timing::Nanos;

use crate::{endpoint::Endpoint, error::Error, shutdown::ShutdownContext};

/// Everything a session announces to its observer, in the order it
/// happened. Delivery is serialized on the socket's strand; no event is
/// dispatched while the session's internal lock is held.
#[derive(Debug)]
pub enum SessionEvent {
    ConnectInitiated(ConnectContext),
    ConnectComplete(ConnectContext),

    ReadQueueFlowControlRelaxed(QueueContext),
    ReadQueueFlowControlApplied(QueueContext),
    ReadQueueLowWatermark(QueueContext),
    ReadQueueHighWatermark(QueueContext),
    ReadQueueDiscarded(QueueContext),

    WriteQueueFlowControlRelaxed(QueueContext),
    WriteQueueFlowControlApplied(QueueContext),
    WriteQueueLowWatermark(QueueContext),
    WriteQueueHighWatermark(QueueContext),
    WriteQueueDiscarded(QueueContext),

    DowngradeInitiated(DowngradeContext),
    DowngradeComplete(DowngradeContext),

    ShutdownInitiated(ShutdownContext),
    ShutdownReceive(ShutdownContext),
    ShutdownSend(ShutdownContext),
    ShutdownComplete(ShutdownContext),

    Error(ErrorContext),
}

/// Queue state at the instant the event was latched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueContext {
    pub size: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectContext {
    pub endpoint: Option<Endpoint>,
    pub error: Option<Error>,
}

/// Teardown of an encryption session layered on the socket. The engine
/// itself lives outside the runtime; the session only relays the milestones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DowngradeContext {
    pub send: bool,
    pub receive: bool,
    pub error: Option<Error>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorContext {
    pub error: Error,
}

/// Side-channel record emitted by the proactor on platforms that report
/// transmit milestones out of band.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    Timestamp(TimestampNotification),
    ZeroCopy(ZeroCopyNotification),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimestampKind {
    Scheduled,
    Sent,
    Acknowledged,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampNotification {
    pub id: u64,
    pub kind: TimestampKind,
    pub time: Nanos,
}

/// Outcome of a `[from_seq, thru_seq]` range of zero-copy sends.
///
/// `Avoided` means the kernel transmitted straight from the application
/// buffers; `Deferred` means a deep copy still happened, nearer to
/// transmission time. Either way the application regains buffer ownership
/// only when this notification arrives, never at submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZeroCopyNotification {
    pub from_seq: u32,
    pub thru_seq: u32,
    pub kind: ZeroCopyType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroCopyType {
    Avoided,
    Deferred,
}

impl ZeroCopyNotification {
    /// True if `seq` falls inside this notification's closed interval,
    /// accounting for u32 wrap-around of the sequence counter.
    pub fn covers(&self, seq: u32) -> bool {
        let span = self.thru_seq.wrapping_sub(self.from_seq);
        seq.wrapping_sub(self.from_seq) <= span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_copy_interval_covers() {
        let n = ZeroCopyNotification { from_seq: 3, thru_seq: 5, kind: ZeroCopyType::Avoided };
        assert!(!n.covers(2));
        assert!(n.covers(3));
        assert!(n.covers(5));
        assert!(!n.covers(6));
    }

    #[test]
    fn zero_copy_interval_wraps() {
        let n = ZeroCopyNotification {
            from_seq: u32::MAX - 1,
            thru_seq: 1,
            kind: ZeroCopyType::Deferred,
        };
        assert!(n.covers(u32::MAX));
        assert!(n.covers(0));
        assert!(!n.covers(2));
    }
}
