// Session primitives — nonce tracking and liveness timers

pub mod nonce;
pub mod timer;

pub use nonce::{NonceCounter, ReplayError, ReplayGuard};
pub use timer::Timer;
