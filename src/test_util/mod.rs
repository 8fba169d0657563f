//! Utilities for testing code built on channels: deterministic identities, a transport double,
//!  and a fully wired multiplexer. They are part of the regular (non-#[cfg(test)]) code so that
//!  applications can use them in their own tests.

pub mod event_loop;
pub mod node;
pub mod peer;
pub mod transport;
