use std::sync::{Arc, Weak};

use anyhow::bail;
use tracing::debug;

use crate::atomic_map::AtomicMap;
use crate::identity::PeerAddress;
use crate::multiplexer::ChannelMultiplexer;

/// The multiplexers of a process that deliver to each other in memory, bypassing the transport.
///
/// This is an ordinary object rather than a global: multiplexers that share a registry see each
///  other, so tests (or applications that want to keep nodes apart) use separate registries.
#[derive(Default)]
pub struct IntraProcessRegistry {
    multiplexers: AtomicMap<PeerAddress, Weak<ChannelMultiplexer>>,
}

impl IntraProcessRegistry {
    pub fn new() -> IntraProcessRegistry {
        Default::default()
    }

    pub(crate) fn register(&self, multiplexer: &Arc<ChannelMultiplexer>) -> anyhow::Result<()> {
        let address = multiplexer.address();
        if self.multiplexers.insert_if_absent_or(address, Arc::downgrade(multiplexer), |m| m.strong_count() > 0).is_err() {
            bail!("there is a multiplexer for {:?} in this process already", address);
        }
        debug!(?address, "registered multiplexer for in-process delivery");
        Ok(())
    }

    pub(crate) fn deregister(&self, multiplexer: &ChannelMultiplexer) {
        let address = multiplexer.address();
        if self.multiplexers.remove_if(&address, |m| std::ptr::eq(m.as_ptr(), multiplexer)) {
            debug!(?address, "deregistered multiplexer");
        }
    }

    pub fn get(&self, address: &PeerAddress) -> Option<Arc<ChannelMultiplexer>> {
        self.multiplexers.get(address)?
            .upgrade()
            .filter(|m| !m.is_closed())
    }

    pub fn len(&self) -> usize {
        self.multiplexers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.multiplexers.is_empty()
    }
}
