use std::sync::Arc;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;

use crate::channel::PeerChannel;
use crate::identity::PeerAddress;

/// Application callbacks for a single channel. All of them are called on the channel's event
///  loop, and they must not block.
#[cfg_attr(test, automock)]
pub trait ChannelHandler: Send + Sync {
    fn channel_active(&self, _channel: &Arc<PeerChannel>) {}

    fn channel_read(&self, channel: &Arc<PeerChannel>, payload: Bytes);

    /// called after a drain of the inbound buffer, once per drain rather than once per payload
    fn channel_read_complete(&self, _channel: &Arc<PeerChannel>) {}

    fn path_changed(&self, _channel: &Arc<PeerChannel>, _direct_path_present: bool) {}

    fn channel_inactive(&self, _channel: &Arc<PeerChannel>) {}
}

/// Called by the multiplexer for every channel it creates, whether the application opened it or
///  a peer's traffic did, before the channel is registered with its event loop.
#[cfg_attr(test, automock)]
pub trait ChannelInitializer: Send + Sync {
    fn init_channel(&self, channel: &Arc<PeerChannel>) -> Arc<dyn ChannelHandler>;
}


#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChannelEvent {
    Active,
    Read(Bytes),
    ReadComplete,
    PathChanged { direct_path_present: bool },
    Inactive,
}

/// Forwards every channel's callbacks to a single mpsc channel, for applications (and tests)
///  that prefer to consume them in an async task.
pub struct ForwardingInitializer {
    sender: mpsc::UnboundedSender<(PeerAddress, ChannelEvent)>,
}
impl ForwardingInitializer {
    pub fn new() -> (ForwardingInitializer, mpsc::UnboundedReceiver<(PeerAddress, ChannelEvent)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ForwardingInitializer { sender }, receiver)
    }
}

impl ChannelInitializer for ForwardingInitializer {
    fn init_channel(&self, _channel: &Arc<PeerChannel>) -> Arc<dyn ChannelHandler> {
        Arc::new(ForwardingHandler {
            sender: self.sender.clone(),
        })
    }
}

pub struct ForwardingHandler {
    sender: mpsc::UnboundedSender<(PeerAddress, ChannelEvent)>,
}
impl ForwardingHandler {
    fn forward(&self, channel: &Arc<PeerChannel>, event: ChannelEvent) {
        // NB: the receiver going away is the application's way of not listening any more
        let _ = self.sender.send((channel.remote_address(), event));
    }
}

impl ChannelHandler for ForwardingHandler {
    fn channel_active(&self, channel: &Arc<PeerChannel>) {
        self.forward(channel, ChannelEvent::Active);
    }

    fn channel_read(&self, channel: &Arc<PeerChannel>, payload: Bytes) {
        self.forward(channel, ChannelEvent::Read(payload));
    }

    fn channel_read_complete(&self, channel: &Arc<PeerChannel>) {
        self.forward(channel, ChannelEvent::ReadComplete);
    }

    fn path_changed(&self, channel: &Arc<PeerChannel>, direct_path_present: bool) {
        self.forward(channel, ChannelEvent::PathChanged { direct_path_present });
    }

    fn channel_inactive(&self, channel: &Arc<PeerChannel>) {
        self.forward(channel, ChannelEvent::Inactive);
    }
}
