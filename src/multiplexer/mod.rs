//! The node-level listener that owns the peer table and routes datagrams to channels.

pub mod events;
pub mod registry;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Context};
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, span, trace, Level};
use uuid::Uuid;

use crate::atomic_map::AtomicMap;
use crate::channel::handler::ChannelInitializer;
use crate::channel::PeerChannel;
use crate::clock::CachedClock;
use crate::config::MultiplexerConfig;
use crate::envelope::Envelope;
use crate::event_loop::EventLoopGroup;
use crate::identity::{Identity, PeerAddress};
use crate::multiplexer::events::{MultiplexerEvent, MultiplexerEventNotifier, PathChangedData};
use crate::multiplexer::registry::IntraProcessRegistry;
use crate::routing::{PathEvent, PeerActivityListener, PeerResolver};
use crate::throttle::rate_limited_queue::RateLimitedQueue;
use crate::transport::{DatagramHandler, DatagramTransport};

/// The collaborators a multiplexer works with. They are shared, so several multiplexers can
///  use the same event loops, registry or transport.
#[derive(Clone)]
pub struct MultiplexerContext {
    pub transport: Arc<dyn DatagramTransport>,
    pub resolver: Arc<dyn PeerResolver>,
    pub activity_listener: Arc<dyn PeerActivityListener>,
    pub registry: Arc<IntraProcessRegistry>,
    pub event_loops: Arc<EventLoopGroup>,
    pub initializer: Arc<dyn ChannelInitializer>,
}

/// Owns a node's identity and its channels, one per peer.
///
/// Channels are created on demand, either by the application or when a peer's first datagram
///  arrives. There is at most one channel per peer in the peer table: concurrent creation is
///  resolved by an atomic insert-if-absent, and the losing candidate is closed before anybody
///  sees it.
pub struct ChannelMultiplexer {
    identity: Identity,
    config: MultiplexerConfig,
    self_weak: Weak<ChannelMultiplexer>,

    channels: AtomicMap<PeerAddress, Arc<PeerChannel>>,
    next_channel_id: AtomicU64,

    transport: Arc<dyn DatagramTransport>,
    resolver: Arc<dyn PeerResolver>,
    activity_listener: Arc<dyn PeerActivityListener>,
    registry: Arc<IntraProcessRegistry>,
    event_loops: Arc<EventLoopGroup>,
    initializer: Arc<dyn ChannelInitializer>,

    clock: CachedClock,
    throttle: Option<RateLimitedQueue>,
    events: MultiplexerEventNotifier,
    closed: AtomicBool,
}

impl ChannelMultiplexer {
    /// Creates the multiplexer for an identity. This must be called on a tokio runtime.
    pub fn bind(identity: Identity, config: MultiplexerConfig, context: MultiplexerContext) -> anyhow::Result<Arc<ChannelMultiplexer>> {
        config.validate()?;
        let handle = Handle::try_current()
            .context("a multiplexer requires a tokio runtime")?;

        let throttle = config.max_outbound_messages_per_second
            .map(|rate| RateLimitedQueue::new(rate, handle.clone()))
            .transpose()?;
        let clock = CachedClock::start(&handle, config.cached_clock_interval);
        let events = MultiplexerEventNotifier::new(config.event_capacity);

        let multiplexer = Arc::new_cyclic(|self_weak| ChannelMultiplexer {
            identity,
            config,
            self_weak: self_weak.clone(),
            channels: AtomicMap::new(),
            next_channel_id: AtomicU64::new(1),
            transport: context.transport,
            resolver: context.resolver,
            activity_listener: context.activity_listener,
            registry: context.registry,
            event_loops: context.event_loops,
            initializer: context.initializer,
            clock,
            throttle,
            events,
            closed: AtomicBool::new(false),
        });

        if multiplexer.config.intra_process_discovery_enabled {
            multiplexer.registry.register(&multiplexer)?;
        }

        info!(address = ?multiplexer.address(), "multiplexer bound");
        Ok(multiplexer)
    }

    pub fn address(&self) -> PeerAddress {
        self.identity.address()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MultiplexerEvent> {
        self.events.subscribe()
    }

    pub fn channel(&self, peer: &PeerAddress) -> Option<Arc<PeerChannel>> {
        self.channels.get(peer)
    }

    pub fn channels(&self) -> Vec<Arc<PeerChannel>> {
        self.channels.values()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn DatagramTransport> {
        &self.transport
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn PeerResolver> {
        &self.resolver
    }

    pub(crate) fn activity_listener(&self) -> &Arc<dyn PeerActivityListener> {
        &self.activity_listener
    }

    pub(crate) fn clock(&self) -> &CachedClock {
        &self.clock
    }

    pub(crate) fn throttle(&self) -> Option<&RateLimitedQueue> {
        self.throttle.as_ref()
    }

    /// The peer's multiplexer if it lives in this process and in-process delivery is enabled.
    pub(crate) fn intra_process_peer(&self, peer: &PeerAddress) -> Option<Arc<ChannelMultiplexer>> {
        if !self.config.intra_process_discovery_enabled {
            return None;
        }
        self.registry.get(peer)
    }

    //-------------------------------------- channel creation

    /// Returns the channel for a peer, creating it if there is none. A new channel is
    ///  registered with its event loop asynchronously, see [ChannelMultiplexer::serve].
    pub fn get_or_create(&self, peer: PeerAddress) -> anyhow::Result<Arc<PeerChannel>> {
        if let Some(channel) = self.channels.get(&peer) {
            return Ok(channel);
        }
        if self.is_closed() {
            bail!("multiplexer {:?} is closed", self.address());
        }

        let candidate = self.new_channel(peer)?;
        self.install(candidate)
    }

    /// Returns the channel for a peer once it is connected.
    pub async fn serve(&self, peer: PeerAddress) -> anyhow::Result<Arc<PeerChannel>> {
        let channel = self.get_or_create(peer)?;
        channel.connected().await
            .map_err(|e| anyhow!("channel to {:?} did not connect: {}", peer, e))?;
        Ok(channel)
    }

    /// Creates a new channel for a peer, replacing and closing the existing one if there is one.
    pub fn open_channel(&self, peer: PeerAddress) -> anyhow::Result<Arc<PeerChannel>> {
        if self.is_closed() {
            bail!("multiplexer {:?} is closed", self.address());
        }

        let channel = self.new_channel(peer)?;
        if let Some(previous) = self.channels.replace(peer, channel.clone()) {
            debug!(?previous, "replacing channel");
            if let Err(e) = previous.request_close() {
                debug!(error = %e, "closing replaced channel");
            }
        }
        self.activate(&channel)?;
        Ok(channel)
    }

    fn new_channel(&self, peer: PeerAddress) -> anyhow::Result<Arc<PeerChannel>> {
        PeerChannel::new(
            self.next_channel_id.fetch_add(1, Ordering::Relaxed),
            self.address(),
            peer,
            &self.config,
            self.resolver.has_direct_path(&peer),
            self.event_loops.next(),
            self.self_weak.clone(),
        )
    }

    fn install(&self, candidate: Arc<PeerChannel>) -> anyhow::Result<Arc<PeerChannel>> {
        let peer = candidate.remote_address();
        match self.channels.insert_if_absent(peer, candidate.clone()) {
            Ok(()) => {
                self.activate(&candidate)?;
                Ok(candidate)
            }
            Err(existing) => {
                trace!(?peer, "concurrent channel creation - discarding candidate");
                candidate.close_unregistered();
                Ok(existing)
            }
        }
    }

    fn activate(&self, channel: &Arc<PeerChannel>) -> anyhow::Result<()> {
        channel.set_handler(self.initializer.init_channel(channel));
        self.events.send_event(MultiplexerEvent::ChannelCreated(channel.remote_address()));

        if let Err(e) = channel.register() {
            if let Err(close_error) = channel.request_close() {
                debug!(?channel, error = %close_error, "closing unregistered channel");
            }
            return Err(e.context(format!("registering channel to {:?}", channel.remote_address())));
        }

        // close() may have taken its snapshot of channels before this one was added
        if self.is_closed() {
            if let Err(e) = channel.request_close() {
                debug!(?channel, error = %e, "closing channel created during shutdown");
            }
        }
        Ok(())
    }

    pub(crate) fn on_channel_closed(&self, channel: &Arc<PeerChannel>) {
        let peer = channel.remote_address();
        let removed = self.channels.remove_if(&peer, |c| Arc::ptr_eq(c, channel));
        trace!(?channel, removed, "channel closed");

        if channel.has_handler() {
            self.events.send_event(MultiplexerEvent::ChannelClosed(peer));
        }
    }

    //-------------------------------------- inbound

    /// Demultiplexes a batch of datagrams to their channels. Every channel that received data
    ///  is triggered to read once, after the whole batch is buffered.
    pub fn on_datagrams(&self, batch: impl IntoIterator<Item = (SocketAddr, Bytes)>) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagrams_received", ?correlation_id);
        let _entered = span.enter();

        let mut readable: Vec<Arc<PeerChannel>> = Vec::new();
        for (from, datagram) in batch {
            if let Some(channel) = self.demultiplex(from, datagram) {
                if !readable.iter().any(|c| Arc::ptr_eq(c, &channel)) {
                    readable.push(channel);
                }
            }
        }

        for channel in readable {
            channel.finish_read();
        }
    }

    fn demultiplex(&self, from: SocketAddr, mut datagram: Bytes) -> Option<Arc<PeerChannel>> {
        let envelope = match Envelope::try_read(&mut datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(?from, error = %e, "dropping malformed datagram");
                return None;
            }
        };
        trace!(?from, ?envelope, len = datagram.len(), "received datagram");

        if envelope.to != self.address() {
            debug!(?from, to = ?envelope.to, "dropping datagram for another node");
            return None;
        }
        if !envelope.is_valid_for(&datagram) {
            debug!(?from, peer = ?envelope.from, "dropping datagram with checksum mismatch");
            return None;
        }

        let channel = match self.get_or_create(envelope.from) {
            Ok(channel) => channel,
            Err(e) => {
                debug!(peer = ?envelope.from, error = %e, "no channel for datagram - dropping");
                return None;
            }
        };

        if channel.is_read_buffer_full() {
            debug!(peer = ?envelope.from, "inbound buffer is full - dropping datagram");
            return None;
        }
        if !channel.queue_read(datagram) {
            return None;
        }
        Some(channel)
    }

    /// Reacts to a path change reported by discovery. Only the peer is taken from the event,
    ///  the resolver is asked for the current state.
    pub fn on_path_event(&self, event: PathEvent) {
        let peer = event.peer();
        let direct_path_present = self.resolver.has_direct_path(&peer);
        debug!(?peer, direct_path_present, "path changed");

        if let Some(channel) = self.channels.get(&peer) {
            channel.on_path_changed(direct_path_present);
        }
        self.events.send_event(MultiplexerEvent::PathChanged(PathChangedData {
            peer,
            direct_path_present,
        }));
    }

    //-------------------------------------- shutdown

    /// Closes all channels concurrently and waits for them. A failure to close one channel does
    ///  not keep the others from closing; failures are reported together at the end.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(address = ?self.address(), "closing multiplexer");

        self.registry.deregister(self);
        self.clock.stop();

        let mut join_set = JoinSet::new();
        for channel in self.channels.values() {
            join_set.spawn(async move {
                let peer = channel.remote_address();
                channel.close().await
                    .with_context(|| format!("closing channel to {:?}", peer))
            });
        }

        let mut num_channels = 0usize;
        let mut failures = Vec::new();
        while let Some(result) = join_set.join_next().await {
            num_channels += 1;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push(e),
                Err(e) => failures.push(anyhow!(e)),
            }
        }

        self.events.send_event(MultiplexerEvent::MultiplexerClosed);

        if failures.is_empty() {
            debug!(num_channels, "multiplexer closed");
            Ok(())
        }
        else {
            let causes = failures.iter()
                .map(|e| format!("{:#}", e))
                .collect::<Vec<_>>()
                .join("; ");
            bail!("{} of {} channels failed to close: {}", failures.len(), num_channels, causes)
        }
    }
}

impl DatagramHandler for ChannelMultiplexer {
    fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
        self.on_datagrams([(from, datagram)]);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use rstest::rstest;

    use crate::channel::handler::{ChannelEvent, ChannelHandler, ForwardingInitializer, MockChannelInitializer};
    use crate::channel::{ChannelError, ChannelState};
    use crate::config::ReadBufferWaterMark;
    use crate::routing::PeerPaths;
    use crate::test_util::event_loop::DetachedEventLoop;
    use crate::test_util::node::{test_endpoint_from_number, TestNode, EVENT_TIMEOUT};
    use crate::test_util::peer::{test_identity, test_peer_address_from_number};
    use crate::test_util::transport::TrackingTransport;

    use super::*;

    fn isolated_node(config: MultiplexerConfig) -> TestNode {
        TestNode::new(1, config, Arc::new(IntraProcessRegistry::new()))
    }

    fn datagram(from: u16, to: PeerAddress, payload: &[u8]) -> (SocketAddr, Bytes) {
        (test_endpoint_from_number(from), Envelope::wrap(test_peer_address_from_number(from), to, payload))
    }

    async fn next_mux_event(events: &mut broadcast::Receiver<MultiplexerEvent>) -> MultiplexerEvent {
        tokio::time::timeout(EVENT_TIMEOUT, events.recv()).await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create() {
        let node = isolated_node(MultiplexerConfig::new());
        let mut events = node.multiplexer.subscribe();
        let peer = test_peer_address_from_number(2);

        assert!(node.multiplexer.channel(&peer).is_none());
        let channel = node.multiplexer.get_or_create(peer).unwrap();
        assert!(Arc::ptr_eq(&channel, &node.multiplexer.get_or_create(peer).unwrap()));
        assert!(Arc::ptr_eq(&channel, &node.multiplexer.channel(&peer).unwrap()));
        assert_eq!(channel.local_address(), node.address());
        assert_eq!(channel.remote_address(), peer);

        assert_eq!(next_mux_event(&mut events).await, MultiplexerEvent::ChannelCreated(peer));
        channel.connected().await.unwrap();
        assert_eq!(node.multiplexer.channels().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create() {
        let (forwarding, _channel_events) = ForwardingInitializer::new();
        let num_initialized = Arc::new(AtomicUsize::new(0));

        let mut initializer = MockChannelInitializer::new();
        let cloned = num_initialized.clone();
        initializer.expect_init_channel()
            .returning(move |channel| {
                cloned.fetch_add(1, Ordering::SeqCst);
                forwarding.init_channel(channel)
            });

        let multiplexer = ChannelMultiplexer::bind(test_identity(1), MultiplexerConfig::new(), MultiplexerContext {
            transport: Arc::new(TrackingTransport::new()),
            resolver: Arc::new(PeerPaths::new()),
            activity_listener: Arc::new(PeerPaths::new()),
            registry: Arc::new(IntraProcessRegistry::new()),
            event_loops: Arc::new(EventLoopGroup::new(4).unwrap()),
            initializer: Arc::new(initializer),
        }).unwrap();

        let peer = test_peer_address_from_number(2);
        let threads = (0..8)
            .map(|_| {
                let multiplexer = multiplexer.clone();
                std::thread::spawn(move || multiplexer.get_or_create(peer).unwrap())
            })
            .collect::<Vec<_>>();
        let channels = threads.into_iter()
            .map(|t| t.join().unwrap())
            .collect::<Vec<_>>();

        for channel in &channels {
            assert!(Arc::ptr_eq(channel, &channels[0]));
        }
        assert_eq!(num_initialized.load(Ordering::SeqCst), 1);
        assert_eq!(multiplexer.channels().len(), 1);
        channels[0].connected().await.unwrap();
    }

    #[tokio::test]
    async fn test_losing_candidate_is_closed() {
        let node = isolated_node(MultiplexerConfig::new());
        let mut events = node.multiplexer.subscribe();
        let peer = test_peer_address_from_number(2);

        let first = node.multiplexer.new_channel(peer).unwrap();
        let second = node.multiplexer.new_channel(peer).unwrap();

        let winner = node.multiplexer.install(first.clone()).unwrap();
        let existing = node.multiplexer.install(second.clone()).unwrap();

        assert!(Arc::ptr_eq(&winner, &first));
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(second.state(), ChannelState::Closed);
        assert!(Arc::ptr_eq(&node.multiplexer.channel(&peer).unwrap(), &first));

        first.connected().await.unwrap();
        assert_eq!(next_mux_event(&mut events).await, MultiplexerEvent::ChannelCreated(peer));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_channel_replaces_previous() {
        let mut node = isolated_node(MultiplexerConfig::new());
        let peer = test_peer_address_from_number(2);
        node.add_path(peer, test_endpoint_from_number(2));

        let previous = node.multiplexer.serve(peer).await.unwrap();
        let unflushed = previous.write(Bytes::from_static(b"a")).unwrap();

        let replacement = node.multiplexer.open_channel(peer).unwrap();
        previous.closed().await;
        replacement.connected().await.unwrap();

        assert_eq!(unflushed.await, Err(ChannelError::Closed));
        assert!(Arc::ptr_eq(&node.multiplexer.channel(&peer).unwrap(), &replacement));
        assert_eq!(node.multiplexer.channels().len(), 1);

        // closing the replaced channel must not remove its successor
        replacement.write_and_flush(Bytes::from_static(b"b")).unwrap().await.unwrap();
        assert_eq!(node.transport.sent_payloads(), vec![(peer, Bytes::from_static(b"b"))]);

        node.expect_event(peer, ChannelEvent::Active).await;
        let mut remaining = vec![node.next_event().await.1, node.next_event().await.1];
        remaining.sort_by_key(|e| format!("{:?}", e));
        assert_eq!(remaining, vec![ChannelEvent::Active, ChannelEvent::Inactive]);
    }

    #[tokio::test]
    async fn test_inbound_datagram() {
        let mut node = isolated_node(MultiplexerConfig::new());
        let peer = test_peer_address_from_number(2);

        let (from, datagram) = datagram(2, node.address(), b"hello");
        node.multiplexer.on_datagram(from, datagram);

        node.expect_event(peer, ChannelEvent::Active).await;
        node.expect_event(peer, ChannelEvent::Read(Bytes::from_static(b"hello"))).await;
        node.expect_event(peer, ChannelEvent::ReadComplete).await;
        assert!(node.multiplexer.channel(&peer).unwrap().is_active());
    }

    #[tokio::test]
    async fn test_inbound_batch_reads_once_per_channel() {
        let mut node = isolated_node(MultiplexerConfig::new());
        let to = node.address();
        let peer_2 = test_peer_address_from_number(2);
        let peer_3 = test_peer_address_from_number(3);

        node.multiplexer.on_datagrams([
            datagram(2, to, b"a"),
            datagram(3, to, b"x"),
            datagram(2, to, b"b"),
            datagram(2, to, b"c"),
        ]);

        let mut events_2 = Vec::new();
        let mut events_3 = Vec::new();
        while events_2.len() < 5 || events_3.len() < 3 {
            let (peer, event) = node.next_event().await;
            if peer == peer_2 { events_2.push(event) } else if peer == peer_3 { events_3.push(event) }
        }

        assert_eq!(events_2, vec![
            ChannelEvent::Active,
            ChannelEvent::Read(Bytes::from_static(b"a")),
            ChannelEvent::Read(Bytes::from_static(b"b")),
            ChannelEvent::Read(Bytes::from_static(b"c")),
            ChannelEvent::ReadComplete,
        ]);
        assert_eq!(events_3, vec![
            ChannelEvent::Active,
            ChannelEvent::Read(Bytes::from_static(b"x")),
            ChannelEvent::ReadComplete,
        ]);
    }

    #[rstest]
    #[case::garbage(Bytes::from_static(b"garbage"))]
    #[case::other_recipient(Envelope::wrap(test_peer_address_from_number(2), test_peer_address_from_number(3), b"hi"))]
    #[case::checksum_mismatch({
        let mut raw = Envelope::wrap(test_peer_address_from_number(2), test_peer_address_from_number(1), b"hi").to_vec();
        *raw.last_mut().unwrap() ^= 1;
        Bytes::from(raw)
    })]
    #[tokio::test]
    async fn test_invalid_datagrams_are_dropped(#[case] datagram: Bytes) {
        let node = isolated_node(MultiplexerConfig::new());
        node.multiplexer.on_datagram(test_endpoint_from_number(2), datagram);
        assert!(node.multiplexer.channels().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_datagram_dropped_when_buffer_full() {
        let mut config = MultiplexerConfig::new();
        config.auto_read = false;
        config.read_buffer_water_mark = ReadBufferWaterMark::new(1, 4).unwrap();
        let node = isolated_node(config);
        let to = node.address();
        let peer = test_peer_address_from_number(2);

        node.multiplexer.on_datagrams([datagram(2, to, b"12345"), datagram(2, to, b"6")]);

        let channel = node.multiplexer.channel(&peer).unwrap();
        assert!(channel.is_read_buffer_full());
        assert_eq!(channel.pending_reads(), 1);
    }

    #[tokio::test]
    async fn test_path_event() {
        let mut node = isolated_node(MultiplexerConfig::new());
        let mut events = node.multiplexer.subscribe();
        let peer = test_peer_address_from_number(2);

        let channel = node.multiplexer.serve(peer).await.unwrap();
        assert!(!channel.is_direct_path_present());
        node.expect_event(peer, ChannelEvent::Active).await;
        assert_eq!(next_mux_event(&mut events).await, MultiplexerEvent::ChannelCreated(peer));

        let event = node.paths.add_path(peer, "lan", 0, test_endpoint_from_number(2)).unwrap();
        node.multiplexer.on_path_event(event);
        assert!(channel.is_direct_path_present());
        node.expect_event(peer, ChannelEvent::PathChanged { direct_path_present: true }).await;
        assert_eq!(next_mux_event(&mut events).await, MultiplexerEvent::PathChanged(PathChangedData { peer, direct_path_present: true }));

        // repeated notification without an actual change is not passed to the channel
        node.multiplexer.on_path_event(event);
        let event = node.paths.remove_path(peer, "lan").unwrap();
        node.multiplexer.on_path_event(event);
        node.expect_event(peer, ChannelEvent::PathChanged { direct_path_present: false }).await;
        assert!(!channel.is_direct_path_present());
    }

    #[tokio::test]
    async fn test_new_channel_picks_up_direct_path() {
        let node = isolated_node(MultiplexerConfig::new());
        let peer = test_peer_address_from_number(2);
        node.add_path(peer, test_endpoint_from_number(2));

        assert!(node.multiplexer.get_or_create(peer).unwrap().is_direct_path_present());
    }

    #[tokio::test]
    async fn test_close() {
        let registry = Arc::new(IntraProcessRegistry::new());
        let mut node = TestNode::new(1, MultiplexerConfig::new(), registry.clone());
        let mut events = node.multiplexer.subscribe();
        assert!(registry.get(&node.address()).is_some());

        let peers = (2..5).map(test_peer_address_from_number).collect::<Vec<_>>();
        let mut channels = Vec::new();
        for peer in &peers {
            channels.push(node.multiplexer.serve(*peer).await.unwrap());
        }

        node.multiplexer.close().await.unwrap();
        node.multiplexer.close().await.unwrap();

        for channel in &channels {
            assert!(channel.is_closed());
        }
        assert!(node.multiplexer.channels().is_empty());
        assert!(node.multiplexer.is_closed());
        assert!(registry.get(&node.address()).is_none());
        assert!(node.multiplexer.get_or_create(peers[0]).is_err());
        assert!(node.multiplexer.open_channel(peers[0]).is_err());

        let mut num_inactive = 0;
        while num_inactive < peers.len() {
            if let (_, ChannelEvent::Inactive) = node.next_event().await {
                num_inactive += 1;
            }
        }

        let mut closed_event_received = false;
        while let Ok(event) = events.try_recv() {
            closed_event_received = event == MultiplexerEvent::MultiplexerClosed;
        }
        assert!(closed_event_received);
    }

    #[tokio::test]
    async fn test_close_continues_after_child_failure() {
        let node = isolated_node(MultiplexerConfig::new());
        let mut events = node.multiplexer.subscribe();
        let failing_peer = test_peer_address_from_number(2);

        let detached = DetachedEventLoop::start().unwrap();
        let failing = PeerChannel::new(
            1000,
            node.address(),
            failing_peer,
            node.multiplexer.config(),
            false,
            detached.event_loop(),
            node.multiplexer.self_weak.clone(),
        ).unwrap();
        let failing = node.multiplexer.install(failing).unwrap();
        failing.connected().await.unwrap();

        let mut healthy = Vec::new();
        for n in 3..5 {
            healthy.push(node.multiplexer.serve(test_peer_address_from_number(n)).await.unwrap());
        }

        detached.terminate().unwrap();

        let error = node.multiplexer.close().await.unwrap_err();
        let message = format!("{:#}", error);
        assert!(message.contains("1 of 3 channels failed to close"), "{}", message);
        assert!(message.contains(&format!("{:?}", failing_peer)), "{}", message);

        // the failing channel is closed in place
        assert!(failing.is_closed());
        for channel in &healthy {
            assert!(channel.is_closed());
        }
        assert!(node.multiplexer.channels().is_empty());
        assert!(node.multiplexer.is_closed());

        let mut closed_event_received = false;
        while let Ok(event) = events.try_recv() {
            closed_event_received = event == MultiplexerEvent::MultiplexerClosed;
        }
        assert!(closed_event_received);
    }

    #[tokio::test]
    async fn test_channel_creation_fails_on_terminated_event_loop() {
        let detached = DetachedEventLoop::start().unwrap();
        let event_loop = detached.event_loop();
        detached.terminate().unwrap();

        let (initializer, _) = ForwardingInitializer::new();
        let multiplexer = ChannelMultiplexer::bind(test_identity(1), MultiplexerConfig::new(), MultiplexerContext {
            transport: Arc::new(TrackingTransport::new()),
            resolver: Arc::new(PeerPaths::new()),
            activity_listener: Arc::new(PeerPaths::new()),
            registry: Arc::new(IntraProcessRegistry::new()),
            event_loops: Arc::new(EventLoopGroup::from_loops(vec![event_loop]).unwrap()),
            initializer: Arc::new(initializer),
        }).unwrap();
        let mut events = multiplexer.subscribe();
        let peer = test_peer_address_from_number(2);

        assert!(multiplexer.get_or_create(peer).is_err());
        assert!(multiplexer.channel(&peer).is_none());
        assert!(multiplexer.open_channel(peer).is_err());
        assert!(multiplexer.channels().is_empty());

        assert_eq!(next_mux_event(&mut events).await, MultiplexerEvent::ChannelCreated(peer));
        assert_eq!(next_mux_event(&mut events).await, MultiplexerEvent::ChannelClosed(peer));
    }

    #[tokio::test]
    async fn test_duplicate_identity_in_registry() {
        let registry = Arc::new(IntraProcessRegistry::new());
        let first = TestNode::new(1, MultiplexerConfig::new(), registry.clone());

        let (initializer, _) = ForwardingInitializer::new();
        let context = MultiplexerContext {
            transport: Arc::new(TrackingTransport::new()),
            resolver: Arc::new(PeerPaths::new()),
            activity_listener: Arc::new(PeerPaths::new()),
            registry: registry.clone(),
            event_loops: Arc::new(EventLoopGroup::new(1).unwrap()),
            initializer: Arc::new(initializer),
        };
        assert!(ChannelMultiplexer::bind(test_identity(1), MultiplexerConfig::new(), context.clone()).is_err());

        first.multiplexer.close().await.unwrap();
        let second = ChannelMultiplexer::bind(test_identity(1), MultiplexerConfig::new(), context).unwrap();
        assert!(Arc::ptr_eq(&registry.get(&second.address()).unwrap(), &second));
    }

    #[tokio::test]
    async fn test_closed_peer_falls_back_to_transport() {
        let registry = Arc::new(IntraProcessRegistry::new());
        let a = TestNode::new(1, MultiplexerConfig::new(), registry.clone());
        let b = TestNode::new(2, MultiplexerConfig::new(), registry);
        a.add_path(b.address(), test_endpoint_from_number(2));

        b.multiplexer.close().await.unwrap();

        let channel = a.multiplexer.serve(b.address()).await.unwrap();
        channel.write_and_flush(Bytes::from_static(b"x")).unwrap().await.unwrap();
        assert_eq!(a.transport.sent_payloads(), vec![(b.address(), Bytes::from_static(b"x"))]);
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let mut config = MultiplexerConfig::new();
        config.max_messages_per_read = 0;

        let (initializer, _) = ForwardingInitializer::new();
        let result = ChannelMultiplexer::bind(test_identity(1), config, MultiplexerContext {
            transport: Arc::new(TrackingTransport::new()),
            resolver: Arc::new(PeerPaths::new()),
            activity_listener: Arc::new(PeerPaths::new()),
            registry: Arc::new(IntraProcessRegistry::new()),
            event_loops: Arc::new(EventLoopGroup::new(1).unwrap()),
            initializer: Arc::new(initializer),
        });
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_throttled_writes() {
        let mut config = MultiplexerConfig::new();
        config.max_outbound_messages_per_second = Some(20);
        let node = isolated_node(config);
        let peer = test_peer_address_from_number(2);
        node.add_path(peer, test_endpoint_from_number(2));

        let channel = node.multiplexer.serve(peer).await.unwrap();

        let start = Instant::now();
        let completions = (0..5u8)
            .map(|i| channel.write(Bytes::from(vec![i])).unwrap())
            .collect::<Vec<_>>();
        for completion in completions {
            completion.await.unwrap();
        }
        let elapsed = start.elapsed();

        assert_eq!(node.transport.sent_payloads(), (0..5u8).map(|i| (peer, Bytes::from(vec![i]))).collect::<Vec<_>>());
        assert!(elapsed >= Duration::from_millis(190), "elapsed: {:?}", elapsed);
    }

    struct EchoHandler;
    impl ChannelHandler for EchoHandler {
        fn channel_read(&self, channel: &Arc<PeerChannel>, payload: Bytes) {
            let _ = channel.write(payload);
        }

        fn channel_read_complete(&self, channel: &Arc<PeerChannel>) {
            channel.flush();
        }
    }

    #[tokio::test]
    async fn test_echo_from_handler() {
        let registry = Arc::new(IntraProcessRegistry::new());
        let mut a = TestNode::new(1, MultiplexerConfig::new(), registry.clone());

        let mut initializer = MockChannelInitializer::new();
        initializer.expect_init_channel()
            .returning(|_| Arc::new(EchoHandler));
        let b = ChannelMultiplexer::bind(test_identity(2), MultiplexerConfig::new(), MultiplexerContext {
            transport: Arc::new(TrackingTransport::new()),
            resolver: Arc::new(PeerPaths::new()),
            activity_listener: Arc::new(PeerPaths::new()),
            registry,
            event_loops: Arc::new(EventLoopGroup::new(1).unwrap()),
            initializer: Arc::new(initializer),
        }).unwrap();

        let channel = a.multiplexer.serve(b.address()).await.unwrap();
        for i in 0..20u8 {
            let _ = channel.write_and_flush(Bytes::from(vec![i])).unwrap();
        }

        assert_eq!(a.next_reads(20).await, (0..20u8).map(|i| Bytes::from(vec![i])).collect::<Vec<_>>());
    }
}
