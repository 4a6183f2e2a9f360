//! Per-credential rate limiting for Conduit.
//!
//! Every credential with a configured limit owns a token bucket. Buckets are created lazily on
//! the first request, refilled continuously and checked synchronously; nothing in this crate
//! awaits. Credentials without a limit bypass the limiter entirely.

#![deny(missing_docs)]

mod bucket;
mod error;
mod limiter;

pub use bucket::TokenBucket;
pub use error::RateLimitError;
pub use limiter::{Admission, RateLimiter};
