//! Retry policies and timeout/lease enforcement.

pub mod retry;
pub mod timeout;

pub use retry::RetryPolicy;
pub use timeout::{ClaimLease, TimeoutKind};
