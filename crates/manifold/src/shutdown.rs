use serde::{Deserialize, Serialize};

/// Which end started tearing the connection down. Latched by the first
/// transition and never rewritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownOrigin {
    /// This side of the connection.
    Source,
    /// The peer.
    Destination,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownDirection {
    Send,
    Receive,
    Both,
}

/// Lifetime phase of the connection, derived from the two half-close
/// flags. Transitions are monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPhase {
    Open,
    SendShut,
    RecvShut,
    BothShut,
    Closed,
}

/// What a shutdown request accomplished, in the order the performer must
/// act on it: announce initiation, shut the send side (failing queued
/// writes), shut the receive side, then complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownContext {
    pub origin: Option<ShutdownOrigin>,
    pub initiated: bool,
    pub send: bool,
    pub receive: bool,
    pub completed: bool,
}

/// Per-socket half-close/full-close state machine.
///
/// Each direction latches shut exactly once; requests against an already
/// shut direction are no-ops. `keep_half_open` false (the default) promotes
/// a remote receive-shutdown to a full close by also shutting send.
#[derive(Debug, Default)]
pub struct ShutdownState {
    origin: Option<ShutdownOrigin>,
    send_shut: bool,
    recv_shut: bool,
    closed: bool,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one request and reports which transitions happened now.
    pub fn apply(
        &mut self,
        origin: ShutdownOrigin,
        direction: ShutdownDirection,
        keep_half_open: bool,
    ) -> ShutdownContext {
        let mut context = ShutdownContext::default();

        let mut want_send = matches!(direction, ShutdownDirection::Send | ShutdownDirection::Both);
        let mut want_recv =
            matches!(direction, ShutdownDirection::Receive | ShutdownDirection::Both);

        if origin == ShutdownOrigin::Destination && want_recv && !keep_half_open {
            want_send = true;
        }
        if origin == ShutdownOrigin::Destination && want_send && !keep_half_open {
            want_recv = true;
        }

        if self.origin.is_none() && ((want_send && !self.send_shut) || (want_recv && !self.recv_shut))
        {
            self.origin = Some(origin);
            context.initiated = true;
        }

        if want_send && !self.send_shut {
            self.send_shut = true;
            context.send = true;
        }
        if want_recv && !self.recv_shut {
            self.recv_shut = true;
            context.receive = true;
        }

        if self.send_shut && self.recv_shut && !self.closed {
            self.closed = true;
            context.completed = true;
        }

        context.origin = self.origin;
        context
    }

    #[inline]
    pub fn phase(&self) -> ShutdownPhase {
        match (self.send_shut, self.recv_shut, self.closed) {
            (true, true, true) => ShutdownPhase::Closed,
            (true, true, false) => ShutdownPhase::BothShut,
            (true, false, _) => ShutdownPhase::SendShut,
            (false, true, _) => ShutdownPhase::RecvShut,
            (false, false, _) => ShutdownPhase::Open,
        }
    }

    #[inline]
    pub fn origin(&self) -> Option<ShutdownOrigin> {
        self.origin
    }

    #[inline]
    pub fn is_send_shut(&self) -> bool {
        self.send_shut
    }

    #[inline]
    pub fn is_recv_shut(&self) -> bool {
        self.recv_shut
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Snapshot of the accumulated state, for the completion event.
    pub fn context(&self) -> ShutdownContext {
        ShutdownContext {
            origin: self.origin,
            initiated: self.origin.is_some(),
            send: self.send_shut,
            receive: self.recv_shut,
            completed: self.closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_half_close_then_full() {
        let mut state = ShutdownState::new();
        assert_eq!(state.phase(), ShutdownPhase::Open);

        let first = state.apply(ShutdownOrigin::Source, ShutdownDirection::Send, true);
        assert!(first.initiated);
        assert!(first.send);
        assert!(!first.receive);
        assert!(!first.completed);
        assert_eq!(state.phase(), ShutdownPhase::SendShut);

        let second = state.apply(ShutdownOrigin::Source, ShutdownDirection::Receive, true);
        assert!(!second.initiated);
        assert!(second.receive);
        assert!(second.completed);
        assert_eq!(state.phase(), ShutdownPhase::Closed);
    }

    #[test]
    fn origin_latches_on_first_transition() {
        let mut state = ShutdownState::new();
        state.apply(ShutdownOrigin::Destination, ShutdownDirection::Receive, true);
        let late = state.apply(ShutdownOrigin::Source, ShutdownDirection::Send, true);
        assert_eq!(late.origin, Some(ShutdownOrigin::Destination));
        assert_eq!(state.origin(), Some(ShutdownOrigin::Destination));
    }

    #[test]
    fn remote_half_close_promotes_without_keep_half_open() {
        let mut state = ShutdownState::new();
        let context = state.apply(ShutdownOrigin::Destination, ShutdownDirection::Receive, false);
        assert!(context.initiated);
        assert!(context.receive);
        assert!(context.send);
        assert!(context.completed);
        assert_eq!(state.phase(), ShutdownPhase::Closed);
    }

    #[test]
    fn remote_half_close_holds_with_keep_half_open() {
        let mut state = ShutdownState::new();
        let context = state.apply(ShutdownOrigin::Destination, ShutdownDirection::Receive, true);
        assert!(context.receive);
        assert!(!context.send);
        assert!(!context.completed);
        assert_eq!(state.phase(), ShutdownPhase::RecvShut);
    }

    #[test]
    fn requests_are_idempotent_and_monotonic() {
        let mut state = ShutdownState::new();
        state.apply(ShutdownOrigin::Source, ShutdownDirection::Both, true);
        assert_eq!(state.phase(), ShutdownPhase::Closed);

        let repeat = state.apply(ShutdownOrigin::Source, ShutdownDirection::Both, true);
        assert!(!repeat.initiated);
        assert!(!repeat.send);
        assert!(!repeat.receive);
        assert!(!repeat.completed);
        assert_eq!(state.phase(), ShutdownPhase::Closed);
    }
}
