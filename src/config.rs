use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::throttle::token_bucket::MAX_EVENTS_PER_SECOND;

/// Byte-count thresholds for a channel's inbound buffer. Crossing `high` marks the buffer as
///  full, and it stays full until pending bytes drop below `low`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReadBufferWaterMark {
    low: usize,
    high: usize,
}

impl ReadBufferWaterMark {
    pub fn new(low: usize, high: usize) -> anyhow::Result<ReadBufferWaterMark> {
        if low > high {
            bail!("low water mark {} must not be greater than high water mark {}", low, high);
        }
        Ok(ReadBufferWaterMark { low, high })
    }

    pub fn low(&self) -> usize {
        self.low
    }

    pub fn high(&self) -> usize {
        self.high
    }
}

impl Default for ReadBufferWaterMark {
    fn default() -> Self {
        ReadBufferWaterMark {
            low: 32 * 1024,
            high: 64 * 1024,
        }
    }
}


pub struct MultiplexerConfig {
    /// Backpressure thresholds for every channel's inbound buffer. Datagrams arriving from the
    ///  transport for a channel whose buffer is full are dropped.
    pub read_buffer_water_mark: ReadBufferWaterMark,

    /// This is the maximum number of payloads a channel delivers to its handler in a single
    ///  drain before signalling 'read complete'. It bounds the time one busy channel can hold
    ///  its event loop.
    pub max_messages_per_read: usize,

    /// If true, channels keep draining their inbound buffer on their own. If false, nothing is
    ///  delivered until the application calls [crate::channel::PeerChannel::read], which is how
    ///  a slow consumer pushes back on its peers.
    pub auto_read: bool,

    /// Deliver payloads between multiplexers of the same process in memory rather than through
    ///  the transport.
    pub intra_process_discovery_enabled: bool,

    /// Refresh interval of the coarse clock that throttles peer activity notifications.
    pub cached_clock_interval: Duration,

    /// Upper bound for outbound messages per second across all channels of a multiplexer,
    ///  `None` for no limit.
    pub max_outbound_messages_per_second: Option<u64>,

    /// capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl MultiplexerConfig {
    pub fn new() -> MultiplexerConfig {
        MultiplexerConfig {
            read_buffer_water_mark: ReadBufferWaterMark::default(),
            max_messages_per_read: 16,
            auto_read: true,
            intra_process_discovery_enabled: true,
            cached_clock_interval: Duration::from_secs(1),
            max_outbound_messages_per_second: None,
            event_capacity: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.read_buffer_water_mark.low() >= self.read_buffer_water_mark.high() {
            bail!("low water mark must be strictly below high water mark: {:?}", self.read_buffer_water_mark);
        }
        if self.max_messages_per_read == 0 {
            bail!("max messages per read must be positive");
        }
        if self.cached_clock_interval.is_zero() {
            bail!("cached clock interval must be positive");
        }
        if let Some(rate) = self.max_outbound_messages_per_second {
            if rate == 0 || rate > MAX_EVENTS_PER_SECOND {
                bail!("outbound rate limit must be between 1 and {} if present: {}", MAX_EVENTS_PER_SECOND, rate);
            }
        }
        if self.event_capacity == 0 {
            bail!("event capacity must be positive");
        }
        Ok(())
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self::new()
    }
}


pub struct UdpTransportConfig {
    pub bind_addr: SocketAddr,

    /// Number of datagrams that can be queued for sending. The transport reports itself
    ///  as not writable while this queue is full.
    pub send_queue_capacity: usize,

    /// receive buffer size - longer datagrams are truncated by the OS
    pub max_datagram_size: usize,
}

impl UdpTransportConfig {
    pub fn new(bind_addr: SocketAddr) -> UdpTransportConfig {
        UdpTransportConfig {
            bind_addr,
            send_queue_capacity: 1024,
            max_datagram_size: 65_507,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_queue_capacity == 0 {
            bail!("send queue capacity must be positive");
        }
        if self.max_datagram_size < 100 {
            bail!("max datagram size is too small");
        }
        Ok(())
    }
}
