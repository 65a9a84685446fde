use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::OnceCell;
use quanta::Mock;

use crate::Nanos;

pub type Clock = quanta::Clock;

/// Source of truth for [`Nanos::now`].
///
/// `Quanta` is installed by [`init_global_with_mock`] for deterministic
/// tests; otherwise the system clock is used and values are nanoseconds
/// since the unix epoch.
#[derive(Clone, Debug)]
pub enum RuntimeClock {
    Quanta(Clock),
    System,
}

impl RuntimeClock {
    pub fn raw(&self) -> u64 {
        match self {
            RuntimeClock::Quanta(clock) => clock.raw(),
            RuntimeClock::System => unsafe {
                SystemTime::now().duration_since(UNIX_EPOCH).unwrap_unchecked().as_nanos() as u64
            },
        }
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        Nanos(self.raw())
    }
}

// May be mocked; first access wins.
static GLOBAL_CLOCK: OnceCell<RuntimeClock> = OnceCell::new();

/// Installs a mock as the process-global clock and returns its controller.
/// Mocked raw values count nanoseconds directly, starting at 1.
///
/// Must run before anything reads the clock, and from a single thread.
#[inline]
pub fn init_global_with_mock() -> Arc<Mock> {
    let (mock, controller) = Clock::mock();
    let mock = GLOBAL_CLOCK.get_or_init(|| RuntimeClock::Quanta(mock));
    assert_eq!(mock.raw(), 0, "Do not initialize the global mock clock from 2 different threads");
    controller.increment(1);
    controller
}

#[inline]
pub fn global_clock() -> &'static RuntimeClock {
    GLOBAL_CLOCK.get_or_init(|| RuntimeClock::System)
}
