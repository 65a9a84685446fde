pub mod receive;
pub mod send;

pub use receive::{PushOutcome, ReceiveQueue, TakeOutcome};
pub use send::{BatchInfo, SendCallback, SendCompletion, SendContext, SendQueue};
