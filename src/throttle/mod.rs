//! Outbound rate limiting: a [token_bucket::TokenBucket] gating a single consumer that drains a
//!  [rate_limited_queue::RateLimitedQueue] of deferred send operations.

pub mod token_bucket;
pub mod rate_limited_queue;
