//! Types shared by the pulsemon agent and server.
//!
//! [`types`] holds the metric model exchanged over HTTP, [`sign`] the keyed
//! body hash used to authenticate requests, and [`retry`] the Fibonacci
//! backoff both sides use around I/O that may fail transiently.

pub mod retry;
pub mod sign;
pub mod types;
