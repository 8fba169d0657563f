pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;

pub type WritabilityCallback = Box<dyn FnOnce() + Send>;

/// The shared datagram transport all channels of a node send through.
///
/// Writes must not block: a transport that can not accept more datagrams right now reports
///  itself as not writable, and calls registered callbacks once it is writable again.
#[cfg_attr(test, automock)]
pub trait DatagramTransport: Send + Sync {
    fn is_writable(&self) -> bool;

    /// Returns `Ok(false)` if the datagram was not accepted because the transport is not
    ///  writable. An `Err` is a hard failure of the transport.
    fn write(&self, endpoint: SocketAddr, datagram: Bytes) -> anyhow::Result<bool>;

    /// Called once per batch of writes.
    fn flush(&self);

    /// Registers a callback that is called once, as soon as the transport is writable. It may
    ///  be called right away if the transport is writable already.
    fn on_writable(&self, callback: WritabilityCallback);
}

#[async_trait::async_trait]
pub trait DatagramSource: Send + Sync {
    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()>;

    fn cancel_recv_loop(&self);
}

/// This trait decouples receiving datagrams from demultiplexing them to channels.
pub trait DatagramHandler: Send + Sync {
    fn on_datagram(&self, from: SocketAddr, datagram: Bytes);
}
