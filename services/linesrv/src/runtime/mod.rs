//! Runtime helpers shared across peer links and background workers

pub mod retry;

pub use retry::{retry, RetryError, RetryPolicy, RetrySchedule};
