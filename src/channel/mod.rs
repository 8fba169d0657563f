//! Virtual per-peer channels multiplexed over the node's shared transport.

pub mod handler;
pub mod peer_channel;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::sync::oneshot;

use crate::identity::PeerAddress;

pub use peer_channel::PeerChannel;

/// A channel's lifecycle. Transitions only go forward: `Open -> Connected -> Closed`, or
///  `Open -> Closed` for a channel that never got registered.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ChannelState {
    Open = 0,
    Connected = 1,
    Closed = 2,
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not yet connected")]
    NotYetConnected,
    #[error("channel is closed")]
    Closed,
    #[error("peer {0:?} is unreachable")]
    Unreachable(PeerAddress),
    #[error("sending failed: {0}")]
    SendFailed(String),
}

/// Resolves when a write was handed to the transport or to the peer channel in the same
///  process, or failed. Dropping it does not cancel the write.
#[must_use = "a write's failure is only reported through its completion"]
pub struct WriteCompletion {
    receiver: oneshot::Receiver<Result<(), ChannelError>>,
}
impl WriteCompletion {
    fn new(receiver: oneshot::Receiver<Result<(), ChannelError>>) -> WriteCompletion {
        WriteCompletion { receiver }
    }
}

impl Future for WriteCompletion {
    type Output = Result<(), ChannelError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(ChannelError::Closed)))
    }
}
