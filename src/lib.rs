//! Virtual per-peer channels for an overlay network node.
//!
//! A node owns one [identity::Identity] and talks to many peers over a single datagram
//!  transport. The [multiplexer::ChannelMultiplexer] presents each peer as a connection-like
//!  [channel::PeerChannel] with ordered delivery, inbound backpressure and optional outbound
//!  rate limiting. Peers living in the same process are served in memory, without touching
//!  the transport.
//!
//! Discovery of peers and paths, handshakes and encryption are not part of this crate. They
//!  plug in through [routing::PeerResolver], [routing::PeerActivityListener] and
//!  [transport::DatagramTransport].

pub mod atomic_map;
pub mod channel;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod event_loop;
pub mod identity;
pub mod inbound_buffer;
pub mod multiplexer;
pub mod routing;
pub mod throttle;
pub mod transport;
pub mod test_util;
