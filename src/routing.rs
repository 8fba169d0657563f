use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::identity::PeerAddress;

/// Resolution of overlay addresses to transport endpoints. Implementations consume the results
///  of peer discovery, which is not part of this crate.
#[cfg_attr(test, automock)]
pub trait PeerResolver: Send + Sync {
    /// The endpoint to send a peer's datagrams to, either the peer itself or a relay.
    ///  `None` means that the peer is currently unreachable.
    fn resolve_endpoint(&self, peer: &PeerAddress) -> Option<SocketAddr>;

    fn has_direct_path(&self, peer: &PeerAddress) -> bool;
}

/// Notified when application traffic is sent to a peer, at most once per second per channel.
///  This is what keeps liveness tracking of busy peers cheap.
#[cfg_attr(test, automock)]
pub trait PeerActivityListener: Send + Sync {
    fn on_peer_activity(&self, peer: &PeerAddress);
}

pub struct NoActivityListener;
impl PeerActivityListener for NoActivityListener {
    fn on_peer_activity(&self, _peer: &PeerAddress) {}
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PathEvent {
    /// the peer got its first direct path
    DirectPathAdded(PeerAddress),
    /// the peer lost its last direct path, traffic to it is relayed from now on
    DirectPathRemoved(PeerAddress),
}
impl PathEvent {
    pub fn peer(&self) -> PeerAddress {
        match self {
            PathEvent::DirectPathAdded(peer) => *peer,
            PathEvent::DirectPathRemoved(peer) => *peer,
        }
    }
}


#[derive(Debug, Clone, Eq, PartialEq)]
struct Path {
    id: &'static str,
    priority: i32,
    endpoint: SocketAddr,
}

/// A path table implementing [PeerResolver] and [PeerActivityListener], fed by whatever
///  discovery mechanism the application uses.
///
/// Each peer can have several direct paths, identified by the mechanism that found them (e.g.
///  "lan", "hole-punch"). The path with the lowest priority value wins. Peers without a direct
///  path are resolved to the default peer's endpoint if there is one, which then relays.
#[derive(Default)]
pub struct PeerPaths {
    inner: Mutex<PeerPathsInner>,
}

#[derive(Default)]
struct PeerPathsInner {
    paths: FxHashMap<PeerAddress, Vec<Path>>,
    default_peer: Option<PeerAddress>,
    last_activity: FxHashMap<PeerAddress, Instant>,
}

impl PeerPaths {
    pub fn new() -> PeerPaths {
        Default::default()
    }

    pub fn set_default_peer(&self, default_peer: Option<PeerAddress>) {
        debug!(?default_peer, "setting default peer");
        self.inner.lock().unwrap().default_peer = default_peer;
    }

    /// Adds or replaces the path with the given id. Returns an event if this is the peer's first
    ///  direct path.
    pub fn add_path(&self, peer: PeerAddress, id: &'static str, priority: i32, endpoint: SocketAddr) -> Option<PathEvent> {
        let mut inner = self.inner.lock().unwrap();
        let paths = inner.paths.entry(peer).or_default();
        let was_empty = paths.is_empty();

        paths.retain(|p| p.id != id);
        paths.push(Path { id, priority, endpoint });
        paths.sort_by_key(|p| p.priority);

        trace!(?peer, id, ?endpoint, "added path");
        was_empty.then_some(PathEvent::DirectPathAdded(peer))
    }

    /// Returns an event if this removed the peer's last direct path.
    pub fn remove_path(&self, peer: PeerAddress, id: &'static str) -> Option<PathEvent> {
        let mut inner = self.inner.lock().unwrap();
        let paths = inner.paths.get_mut(&peer)?;

        let len_before = paths.len();
        paths.retain(|p| p.id != id);
        if paths.len() == len_before {
            return None;
        }

        trace!(?peer, id, "removed path");
        if paths.is_empty() {
            inner.paths.remove(&peer);
            Some(PathEvent::DirectPathRemoved(peer))
        }
        else {
            None
        }
    }

    pub fn last_activity(&self, peer: &PeerAddress) -> Option<Instant> {
        self.inner.lock().unwrap()
            .last_activity
            .get(peer)
            .cloned()
    }
}

impl PeerResolver for PeerPaths {
    fn resolve_endpoint(&self, peer: &PeerAddress) -> Option<SocketAddr> {
        let inner = self.inner.lock().unwrap();

        let direct = |p: &PeerAddress| inner.paths.get(p)
            .and_then(|paths| paths.first())
            .map(|path| path.endpoint);

        direct(peer)
            .or_else(|| inner.default_peer
                .filter(|default_peer| default_peer != peer)
                .and_then(|default_peer| direct(&default_peer))
            )
    }

    fn has_direct_path(&self, peer: &PeerAddress) -> bool {
        self.inner.lock().unwrap()
            .paths
            .contains_key(peer)
    }
}

impl PeerActivityListener for PeerPaths {
    fn on_peer_activity(&self, peer: &PeerAddress) {
        self.inner.lock().unwrap()
            .last_activity
            .insert(*peer, Instant::now());
    }
}
