use tokio::sync::broadcast;
use tracing::trace;

use crate::identity::PeerAddress;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MultiplexerEvent {
    ChannelCreated(PeerAddress),
    ChannelClosed(PeerAddress),
    PathChanged(PathChangedData),
    MultiplexerClosed,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathChangedData {
    pub peer: PeerAddress,
    pub direct_path_present: bool,
}


pub struct MultiplexerEventNotifier {
    sender: broadcast::Sender<MultiplexerEvent>,
}
impl MultiplexerEventNotifier {
    pub fn new(capacity: usize) -> MultiplexerEventNotifier {
        let (sender, _) = broadcast::channel(capacity);

        MultiplexerEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MultiplexerEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: MultiplexerEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
