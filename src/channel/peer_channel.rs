use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, trace, warn};

use crate::channel::handler::ChannelHandler;
use crate::channel::{ChannelError, ChannelState, WriteCompletion};
use crate::config::MultiplexerConfig;
use crate::envelope::Envelope;
use crate::event_loop::EventLoop;
use crate::identity::PeerAddress;
use crate::inbound_buffer::InboundBuffer;
use crate::multiplexer::ChannelMultiplexer;
use crate::transport::DatagramTransport;

/// Number of times a channel re-enters its read routine synchronously before it continues
///  in a fresh event loop task.
pub const MAX_READER_STACK_DEPTH: usize = 8;

struct PendingWrite {
    payload: Bytes,
    completion: oneshot::Sender<Result<(), ChannelError>>,
}
impl PendingWrite {
    fn complete(self, result: Result<(), ChannelError>) {
        // NB: the application may have dropped the completion
        let _ = self.completion.send(result);
    }
}

/// A virtual connection to one peer, multiplexed with all other channels over the node's
///  shared transport, or delivered in memory if the peer lives in the same process.
///
/// A channel is bound to one [EventLoop]. Its read / write coordination runs there, so reads and
///  writes are never interleaved incorrectly; the inbound buffer is the only part other threads
///  touch directly.
///
/// The channel is owned by its [ChannelMultiplexer]'s peer table and holds only a weak
///  reference back to it.
pub struct PeerChannel {
    id: u64,
    local_address: PeerAddress,
    remote_address: PeerAddress,

    state: AtomicU8,
    state_changed: Notify,

    inbound: InboundBuffer,
    read_in_progress: AtomicBool,
    drain_scheduled: AtomicBool,

    outbound: Mutex<VecDeque<PendingWrite>>,
    write_in_progress: AtomicBool,
    flush_scheduled: AtomicBool,
    writability_registered: AtomicBool,

    /// seconds of the multiplexer's cached clock
    last_send_timestamp: AtomicI64,
    direct_path_present: AtomicBool,

    max_messages_per_read: usize,
    auto_read: bool,

    event_loop: EventLoop,
    parent: Weak<ChannelMultiplexer>,
    handler: OnceLock<Arc<dyn ChannelHandler>>,
}

impl Debug for PeerChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerChannel#{}({:?} -> {:?}, {:?})", self.id, self.local_address, self.remote_address, self.state())
    }
}

impl PeerChannel {
    pub(crate) fn new(
        id: u64,
        local_address: PeerAddress,
        remote_address: PeerAddress,
        config: &MultiplexerConfig,
        direct_path_present: bool,
        event_loop: EventLoop,
        parent: Weak<ChannelMultiplexer>,
    ) -> anyhow::Result<Arc<PeerChannel>> {
        Ok(Arc::new(PeerChannel {
            id,
            local_address,
            remote_address,
            state: AtomicU8::new(ChannelState::Open.into()),
            state_changed: Notify::new(),
            inbound: InboundBuffer::new(config.read_buffer_water_mark)?,
            read_in_progress: AtomicBool::new(false),
            drain_scheduled: AtomicBool::new(false),
            outbound: Default::default(),
            write_in_progress: AtomicBool::new(false),
            flush_scheduled: AtomicBool::new(false),
            writability_registered: AtomicBool::new(false),
            last_send_timestamp: AtomicI64::new(i64::MIN),
            direct_path_present: AtomicBool::new(direct_path_present),
            max_messages_per_read: config.max_messages_per_read,
            auto_read: config.auto_read,
            event_loop,
            parent,
            handler: OnceLock::new(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_address(&self) -> PeerAddress {
        self.local_address
    }

    pub fn remote_address(&self) -> PeerAddress {
        self.remote_address
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ChannelState::Closed)
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn is_read_buffer_full(&self) -> bool {
        !self.inbound.is_not_full()
    }

    pub fn is_direct_path_present(&self) -> bool {
        self.direct_path_present.load(Ordering::Acquire)
    }

    /// number of payloads received but not yet delivered to the handler
    pub fn pending_reads(&self) -> usize {
        self.inbound.len()
    }

    /// number of payloads written but not yet handed to the transport or the peer channel
    pub fn pending_writes(&self) -> usize {
        self.outbound.lock().unwrap().len()
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn ChannelHandler>) {
        if self.handler.set(handler).is_err() {
            warn!(channel = ?self, "channel handler was initialized twice - ignoring");
        }
    }

    pub(crate) fn has_handler(&self) -> bool {
        self.handler.get().is_some()
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        let result = self.state.compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire).is_ok();
        if result {
            self.state_changed.notify_waiters();
        }
        result
    }

    async fn wait_for_state(&self, done: impl Fn(ChannelState) -> bool) -> ChannelState {
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            // register before checking, so no transition can slip in between
            notified.as_mut().enable();

            let state = self.state();
            if done(state) {
                return state;
            }
            notified.await;
        }
    }

    /// Waits until the channel is registered with its event loop.
    pub async fn connected(&self) -> Result<(), ChannelError> {
        match self.wait_for_state(|s| s != ChannelState::Open).await {
            ChannelState::Connected => Ok(()),
            _ => Err(ChannelError::Closed),
        }
    }

    pub async fn closed(&self) {
        self.wait_for_state(|s| s == ChannelState::Closed).await;
    }

    //-------------------------------------- write path

    /// Queues a payload for sending. It is sent when the channel is flushed, or right away
    ///  (subject to rate limiting) if the multiplexer throttles outbound traffic.
    ///
    /// Writing to a channel that is not connected fails synchronously and queues nothing.
    pub fn write(self: &Arc<Self>, payload: Bytes) -> Result<WriteCompletion, ChannelError> {
        match self.state() {
            ChannelState::Open => return Err(ChannelError::NotYetConnected),
            ChannelState::Closed => return Err(ChannelError::Closed),
            ChannelState::Connected => {}
        }

        let (sender, receiver) = oneshot::channel();
        let write = PendingWrite {
            payload,
            completion: sender,
        };

        match self.parent.upgrade().and_then(|p| p.throttle().cloned()) {
            Some(throttle) => {
                let this = self.clone();
                throttle.add(move || {
                    this.enqueue(write);
                    this.flush();
                });
            }
            None => self.enqueue(write),
        }

        Ok(WriteCompletion::new(receiver))
    }

    pub fn write_and_flush(self: &Arc<Self>, payload: Bytes) -> Result<WriteCompletion, ChannelError> {
        let completion = self.write(payload)?;
        self.flush();
        Ok(completion)
    }

    fn enqueue(&self, write: PendingWrite) {
        let mut outbound = self.outbound.lock().unwrap();
        // NB: checked under the lock - close() marks the channel closed before draining the queue
        if self.is_closed() {
            drop(outbound);
            write.complete(Err(ChannelError::Closed));
            return;
        }
        outbound.push_back(write);
    }

    /// Sends queued payloads, in a write batch on the channel's event loop.
    pub fn flush(self: &Arc<Self>) {
        if self.event_loop.in_event_loop() && !self.write_in_progress.load(Ordering::Acquire) {
            self.do_write();
        }
        else {
            self.schedule_flush();
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = self.clone();
        let result = self.event_loop.execute(move || {
            this.flush_scheduled.store(false, Ordering::Release);
            this.do_write();
        });
        if let Err(e) = result {
            warn!(channel = ?self, error = %e, "can not schedule flush - closing channel");
            self.flush_scheduled.store(false, Ordering::Release);
            self.do_close();
        }
    }

    /// The write batch: hands every queued payload to the peer channel in the same process or to
    ///  the transport, in order. Stops early if the transport is not writable, leaving the rest
    ///  queued until the transport calls back.
    fn do_write(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        let Some(parent) = self.parent.upgrade() else {
            debug!(channel = ?self, "multiplexer is gone - closing channel");
            self.do_close();
            return;
        };

        self.write_in_progress.store(true, Ordering::Release);

        let mut intra_process_targets: Vec<Arc<PeerChannel>> = Vec::new();
        let mut num_remote_writes = 0usize;
        let mut send_failed = false;

        loop {
            let Some(write) = self.outbound.lock().unwrap().pop_front() else {
                break;
            };

            self.on_send_activity(&parent);

            if let Some(peer_multiplexer) = parent.intra_process_peer(&self.remote_address) {
                match self.deliver_intra_process(&peer_multiplexer, write.payload.clone()) {
                    Ok(target) => {
                        if !intra_process_targets.iter().any(|t| Arc::ptr_eq(t, &target)) {
                            intra_process_targets.push(target);
                        }
                        write.complete(Ok(()));
                    }
                    Err(e) => write.complete(Err(e)),
                }
                continue;
            }

            let Some(endpoint) = parent.resolver().resolve_endpoint(&self.remote_address) else {
                debug!(peer = ?self.remote_address, "no endpoint for peer - dropping payload");
                write.complete(Err(ChannelError::Unreachable(self.remote_address)));
                continue;
            };

            let transport = parent.transport();
            if !transport.is_writable() {
                self.wait_for_writability(write, transport);
                break;
            }

            match transport.write(endpoint, Envelope::wrap(self.local_address, self.remote_address, &write.payload)) {
                Ok(true) => {
                    num_remote_writes += 1;
                    write.complete(Ok(()));
                }
                Ok(false) => {
                    self.wait_for_writability(write, transport);
                    break;
                }
                Err(e) => {
                    error!(peer = ?self.remote_address, ?endpoint, error = %e, "sending datagram failed - closing channel");
                    write.complete(Err(ChannelError::SendFailed(e.to_string())));
                    send_failed = true;
                    break;
                }
            }
        }

        if num_remote_writes > 0 {
            trace!(channel = ?self, num_remote_writes, "flushing transport");
            parent.transport().flush();
        }
        for target in intra_process_targets {
            target.finish_read();
        }

        self.write_in_progress.store(false, Ordering::Release);

        if send_failed {
            self.do_close();
        }
    }

    fn deliver_intra_process(&self, peer_multiplexer: &ChannelMultiplexer, payload: Bytes) -> Result<Arc<PeerChannel>, ChannelError> {
        let target = match peer_multiplexer.get_or_create(self.local_address) {
            Ok(target) => target,
            Err(e) => {
                debug!(peer = ?self.remote_address, error = %e, "peer in this process does not accept channels");
                return Err(ChannelError::Unreachable(self.remote_address));
            }
        };

        if target.queue_read(payload) {
            Ok(target)
        }
        else {
            Err(ChannelError::Closed)
        }
    }

    fn wait_for_writability(self: &Arc<Self>, write: PendingWrite, transport: &Arc<dyn DatagramTransport>) {
        self.outbound.lock().unwrap().push_front(write);

        if self.writability_registered.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(peer = ?self.remote_address, "transport is not writable - waiting");

        let this = Arc::downgrade(self);
        transport.on_writable(Box::new(move || {
            if let Some(this) = this.upgrade() {
                this.writability_registered.store(false, Ordering::Release);
                this.flush();
            }
        }));
    }

    fn on_send_activity(&self, parent: &ChannelMultiplexer) {
        let now = parent.clock().now_secs();
        if self.last_send_timestamp.swap(now, Ordering::AcqRel) != now {
            parent.activity_listener().on_peer_activity(&self.remote_address);
        }
    }

    //-------------------------------------- read path

    /// Adds a payload to the inbound buffer. This is safe to call from any thread. Nothing is
    ///  delivered before [PeerChannel::finish_read] is called.
    ///
    /// Returns `false` if the channel is closed.
    pub fn queue_read(&self, payload: Bytes) -> bool {
        self.inbound.add_message(payload)
    }

    /// Triggers delivery of buffered payloads. This drains right away if called on the channel's
    ///  event loop outside a write batch, and is scheduled otherwise. Concurrent scheduled
    ///  calls are coalesced into one.
    pub fn finish_read(self: &Arc<Self>) {
        if self.event_loop.in_event_loop() && !self.write_in_progress.load(Ordering::Acquire) {
            self.finish_read0();
        }
        else {
            self.schedule_drain();
        }
    }

    fn schedule_drain(self: &Arc<Self>) {
        if self.drain_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let this = self.clone();
        let result = self.event_loop.execute(move || {
            this.drain_scheduled.store(false, Ordering::Release);
            this.finish_read0();
        });
        if let Err(e) = result {
            warn!(channel = ?self, error = %e, "can not schedule read - closing channel");
            self.drain_scheduled.store(false, Ordering::Release);
            self.do_close();
        }
    }

    fn finish_read0(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        if self.read_in_progress.load(Ordering::Acquire) && !self.inbound.is_empty() {
            self.read_in_progress.store(false, Ordering::Release);
            self.read_inbound(0);
        }
    }

    /// Requests delivery of buffered payloads. With auto read switched off, this is the only
    ///  way payloads reach the handler.
    pub fn read(self: &Arc<Self>) {
        if self.event_loop.in_event_loop() {
            self.begin_read(0);
            return;
        }

        let this = self.clone();
        if let Err(e) = self.event_loop.execute(move || this.begin_read(0)) {
            warn!(channel = ?self, error = %e, "can not schedule read - closing channel");
            self.do_close();
        }
    }

    fn begin_read(self: &Arc<Self>, depth: usize) {
        if !self.is_active() || self.read_in_progress.load(Ordering::Acquire) {
            return;
        }

        if self.inbound.is_empty() {
            // the next finish_read() drains
            self.read_in_progress.store(true, Ordering::Release);
            return;
        }

        if depth < MAX_READER_STACK_DEPTH {
            self.read_inbound(depth);
        }
        else {
            trace!(channel = ?self, "read depth exhausted - continuing in a new task");
            let this = self.clone();
            if let Err(e) = self.event_loop.execute(move || this.begin_read(0)) {
                warn!(channel = ?self, error = %e, "can not schedule read - closing channel");
                self.do_close();
            }
        }
    }

    fn read_inbound(self: &Arc<Self>, depth: usize) {
        let handler = self.handler.get().cloned();

        for _ in 0..self.max_messages_per_read {
            let Some(payload) = self.inbound.remove() else {
                break;
            };
            if let Some(handler) = &handler {
                handler.channel_read(self, payload);
            }
        }
        if let Some(handler) = &handler {
            handler.channel_read_complete(self);
        }

        if self.auto_read {
            self.begin_read(depth + 1);
        }
    }

    //-------------------------------------- lifecycle

    pub(crate) fn register(self: &Arc<Self>) -> anyhow::Result<()> {
        let this = self.clone();
        self.event_loop.execute(move || this.do_register())
    }

    fn do_register(self: &Arc<Self>) {
        if !self.transition(ChannelState::Open, ChannelState::Connected) {
            return;
        }
        trace!(channel = ?self, "channel registered");

        if let Some(handler) = self.handler.get() {
            handler.channel_active(self);
        }
        if self.auto_read {
            self.begin_read(0);
        }
    }

    pub(crate) fn on_path_changed(self: &Arc<Self>, direct_path_present: bool) {
        if self.direct_path_present.swap(direct_path_present, Ordering::AcqRel) == direct_path_present {
            return;
        }

        let this = self.clone();
        let result = self.event_loop.execute(move || {
            if let Some(handler) = this.handler.get() {
                if !this.is_closed() {
                    handler.path_changed(&this, direct_path_present);
                }
            }
        });
        if let Err(e) = result {
            debug!(channel = ?self, error = %e, "can not notify path change");
        }
    }

    /// Closes the channel and waits until it is closed. Closing is idempotent.
    ///
    /// Payloads that were not yet delivered are dropped, and queued writes fail with
    ///  [ChannelError::Closed]. A write batch that is executing when close is requested completes
    ///  first.
    pub async fn close(self: &Arc<Self>) -> anyhow::Result<()> {
        self.request_close()?;
        self.closed().await;
        Ok(())
    }

    /// Closes the channel on its event loop without waiting for it.
    pub(crate) fn request_close(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.event_loop.in_event_loop() {
            self.do_close();
            return Ok(());
        }

        let this = self.clone();
        if let Err(e) = self.event_loop.execute(move || this.do_close()) {
            warn!(channel = ?self, error = %e, "event loop is gone - closing channel in place");
            self.do_close();
            return Err(e);
        }
        Ok(())
    }

    /// For channels that never made it into the peer table
    pub(crate) fn close_unregistered(self: &Arc<Self>) {
        self.do_close();
    }

    fn do_close(self: &Arc<Self>) {
        let previous = self.state.swap(ChannelState::Closed.into(), Ordering::AcqRel);
        if previous == u8::from(ChannelState::Closed) {
            return;
        }
        self.state_changed.notify_waiters();
        self.read_in_progress.store(false, Ordering::Release);

        let num_dropped_reads = self.inbound.close();
        let pending_writes = std::mem::take(&mut *self.outbound.lock().unwrap());
        debug!(channel = ?self, num_dropped_reads, num_failed_writes = pending_writes.len(), "channel closed");
        for write in pending_writes {
            write.complete(Err(ChannelError::Closed));
        }

        if previous == u8::from(ChannelState::Connected) {
            if let Some(handler) = self.handler.get() {
                handler.channel_inactive(self);
            }
        }

        if let Some(parent) = self.parent.upgrade() {
            parent.on_channel_closed(self);
        }
    }
}
