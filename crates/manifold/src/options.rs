use manifold_timing::Nanos;
use serde::{Deserialize, Serialize};

use crate::{buffer::GatherLimits, endpoint::Endpoint};

/// Caps and policies attached to one enqueued send.
///
/// `max_buffers`/`max_bytes` of zero mean "driver default". A `deadline`
/// fails the entry with `Timeout` if it is still queued when the deadline
/// passes; a `token` makes the entry cancelable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    pub endpoint: Option<Endpoint>,
    pub deadline: Option<Nanos>,
    pub token: Option<u64>,
    pub max_buffers: usize,
    pub max_bytes: usize,
    pub zero_copy: bool,
}

impl SendOptions {
    pub fn to(endpoint: Endpoint) -> Self {
        Self { endpoint: Some(endpoint), ..Self::default() }
    }

    pub fn with_deadline(mut self, deadline: Nanos) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_token(mut self, token: u64) -> Self {
        self.token = Some(token);
        self
    }

    pub fn with_zero_copy(mut self) -> Self {
        self.zero_copy = true;
        self
    }

    #[inline]
    pub fn gather_limits(&self) -> GatherLimits {
        GatherLimits { max_buffers: self.max_buffers, max_bytes: self.max_bytes }
    }
}

/// Bounds on one consumer call against the receive queue. `max_size` of
/// zero means unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub deadline: Option<Nanos>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self { min_size: 1, max_size: 0, deadline: None }
    }
}

impl ReceiveOptions {
    #[inline]
    pub fn effective_max(&self) -> usize {
        if self.max_size == 0 { usize::MAX } else { self.max_size }
    }
}
