use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::channel::handler::{ChannelEvent, ForwardingInitializer};
use crate::config::MultiplexerConfig;
use crate::event_loop::EventLoopGroup;
use crate::identity::PeerAddress;
use crate::multiplexer::registry::IntraProcessRegistry;
use crate::multiplexer::{ChannelMultiplexer, MultiplexerContext};
use crate::routing::{PeerActivityListener, PeerPaths};
use crate::test_util::peer::test_identity;
use crate::test_util::transport::TrackingTransport;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_endpoint_from_number(number: u16) -> SocketAddr {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, number).into()
}

/// A multiplexer wired to a [TrackingTransport] and a [PeerPaths] table, with its channels'
///  callbacks forwarded to `channel_events`.
pub struct TestNode {
    pub multiplexer: Arc<ChannelMultiplexer>,
    pub transport: Arc<TrackingTransport>,
    pub paths: Arc<PeerPaths>,
    pub channel_events: mpsc::UnboundedReceiver<(PeerAddress, ChannelEvent)>,
}

impl TestNode {
    /// must be called on a tokio runtime
    pub fn new(number: u16, config: MultiplexerConfig, registry: Arc<IntraProcessRegistry>) -> TestNode {
        Self::with_activity_listener(number, config, registry, None)
    }

    /// `None` uses the node's path table as activity listener
    pub fn with_activity_listener(
        number: u16,
        config: MultiplexerConfig,
        registry: Arc<IntraProcessRegistry>,
        activity_listener: Option<Arc<dyn PeerActivityListener>>,
    ) -> TestNode {
        let transport = Arc::new(TrackingTransport::new());
        let paths = Arc::new(PeerPaths::new());
        let (initializer, channel_events) = ForwardingInitializer::new();

        let multiplexer = ChannelMultiplexer::bind(test_identity(number), config, MultiplexerContext {
            transport: transport.clone(),
            resolver: paths.clone(),
            activity_listener: activity_listener.unwrap_or_else(|| paths.clone() as Arc<dyn PeerActivityListener>),
            registry,
            event_loops: Arc::new(EventLoopGroup::new(2).unwrap()),
            initializer: Arc::new(initializer),
        }).unwrap();

        TestNode {
            multiplexer,
            transport,
            paths,
            channel_events,
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.multiplexer.address()
    }

    /// makes a peer reachable through the transport
    pub fn add_path(&self, peer: PeerAddress, endpoint: SocketAddr) {
        self.paths.add_path(peer, "test", 0, endpoint);
    }

    pub async fn next_event(&mut self) -> (PeerAddress, ChannelEvent) {
        tokio::time::timeout(EVENT_TIMEOUT, self.channel_events.recv()).await
            .expect("timeout waiting for a channel event")
            .expect("channel event sender was dropped")
    }

    pub async fn expect_event(&mut self, peer: PeerAddress, expected: ChannelEvent) {
        let (actual_peer, actual) = self.next_event().await;
        assert_eq!(actual_peer, peer);
        assert_eq!(actual, expected);
    }

    /// the payloads of the next `n` read events, skipping other events
    pub async fn next_reads(&mut self, n: usize) -> Vec<Bytes> {
        let mut result = Vec::new();
        while result.len() < n {
            if let (_, ChannelEvent::Read(payload)) = self.next_event().await {
                result.push(payload);
            }
        }
        result
    }

    pub fn assert_no_pending_event(&mut self) {
        if let Ok(event) = self.channel_events.try_recv() {
            panic!("unexpected event {:?}", event);
        }
    }
}
