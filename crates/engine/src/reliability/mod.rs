//! Reliability patterns for client delivery
//!
//! - [`RetryPolicy`] - exponential backoff with jitter for redelivery

mod retry;

pub(crate) use retry::{duration_millis, option_duration_millis};
pub use retry::RetryPolicy;
