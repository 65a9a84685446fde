mod clock;
mod nanos;

pub use clock::{Clock, RuntimeClock, global_clock, init_global_with_mock};
pub use nanos::Nanos;
