//! Reliability patterns for durable execution
//!
//! [`RetryPolicy`] drives both retries of executions that lost an append race
//! and redelivery of resume tasks.

mod retry;

pub use retry::RetryPolicy;
