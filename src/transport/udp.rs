use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::config::UdpTransportConfig;
use crate::transport::{DatagramHandler, DatagramSource, DatagramTransport, WritabilityCallback};

/// A [DatagramTransport] on a single UDP socket.
///
/// Outgoing datagrams go to a bounded queue that a dedicated task drains into the socket. The
///  transport is writable while that queue has room, and waiting writers are called back from
///  the sender task when room becomes available.
pub struct UdpTransport {
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    send_queue: mpsc::Sender<(SocketAddr, Bytes)>,
    writability_waiters: Arc<Mutex<Vec<WritabilityCallback>>>,
    cancel_sender: broadcast::Sender<()>,
    max_datagram_size: usize,
    send_task: JoinHandle<()>,
}

impl UdpTransport {
    pub async fn bind(config: &UdpTransportConfig) -> anyhow::Result<UdpTransport> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await
            .with_context(|| format!("binding UDP socket to {}", config.bind_addr))?);
        let local_addr = socket.local_addr()?;
        debug!(?local_addr, "bound UDP transport");

        let (send_queue, send_queue_receiver) = mpsc::channel(config.send_queue_capacity);
        let writability_waiters: Arc<Mutex<Vec<WritabilityCallback>>> = Default::default();

        let send_task = tokio::spawn(Self::send_loop(
            socket.clone(),
            send_queue_receiver,
            send_queue.downgrade(),
            writability_waiters.clone(),
        ));

        let (cancel_sender, _) = broadcast::channel(1);

        Ok(UdpTransport {
            local_addr,
            socket,
            send_queue,
            writability_waiters,
            cancel_sender,
            max_datagram_size: config.max_datagram_size,
            send_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_loop(
        socket: Arc<UdpSocket>,
        mut receiver: mpsc::Receiver<(SocketAddr, Bytes)>,
        sender: mpsc::WeakSender<(SocketAddr, Bytes)>,
        writability_waiters: Arc<Mutex<Vec<WritabilityCallback>>>,
    ) {
        while let Some((to, datagram)) = receiver.recv().await {
            trace!(?to, len = datagram.len(), "sending datagram");
            if let Err(e) = socket.send_to(&datagram, to).await {
                // NB: a single failed datagram is a lost datagram, which UDP consumers deal with anyway
                warn!(?to, error = ?e, "error sending datagram");
            }

            let is_writable = sender.upgrade()
                .map(|s| s.capacity() > 0)
                .unwrap_or(false);
            if is_writable {
                fire_writability_waiters(&writability_waiters);
            }
        }
        trace!("UDP send loop terminated");
    }
}

fn fire_writability_waiters(waiters: &Mutex<Vec<WritabilityCallback>>) {
    let callbacks = std::mem::take(&mut *waiters.lock().unwrap());
    if !callbacks.is_empty() {
        trace!(num_callbacks = callbacks.len(), "transport is writable again");
    }
    for callback in callbacks {
        callback();
    }
}

impl DatagramTransport for UdpTransport {
    fn is_writable(&self) -> bool {
        self.send_queue.capacity() > 0
    }

    fn write(&self, endpoint: SocketAddr, datagram: Bytes) -> anyhow::Result<bool> {
        match self.send_queue.try_send((endpoint, datagram)) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => bail!("UDP transport on {} is shut down", self.local_addr),
        }
    }

    fn flush(&self) {
        // datagrams are handed to the sender task as they are written
    }

    fn on_writable(&self, callback: WritabilityCallback) {
        self.writability_waiters.lock().unwrap().push(callback);

        // the sender task may have drained the queue before we registered
        if self.is_writable() {
            fire_writability_waiters(&self.writability_waiters);
        }
    }
}

#[async_trait::async_trait]
impl DatagramSource for UdpTransport {
    async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.max_datagram_size];
        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting UDP receive loop");

        loop {
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            handler.on_datagram(from, Bytes::copy_from_slice(&buf[..len]));
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        Ok(())
    }

    fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.send_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct ForwardingHandler(mpsc::UnboundedSender<(SocketAddr, Bytes)>);
    impl DatagramHandler for ForwardingHandler {
        fn on_datagram(&self, from: SocketAddr, datagram: Bytes) {
            self.0.send((from, datagram)).unwrap();
        }
    }

    fn localhost_config() -> UdpTransportConfig {
        UdpTransportConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[tokio::test]
    async fn test_send_receive() {
        let a = UdpTransport::bind(&localhost_config()).await.unwrap();
        let b = Arc::new(UdpTransport::bind(&localhost_config()).await.unwrap());

        let (send, mut recv) = mpsc::unbounded_channel();
        let b2 = b.clone();
        let recv_loop = tokio::spawn(async move {
            b2.recv_loop(Arc::new(ForwardingHandler(send))).await
        });

        assert!(a.is_writable());
        assert!(a.write(b.local_addr(), Bytes::from_static(b"hello")).unwrap());
        a.flush();

        let (from, datagram) = tokio::time::timeout(Duration::from_secs(5), recv.recv()).await
            .unwrap()
            .unwrap();
        assert_eq!(from, a.local_addr());
        assert_eq!(&datagram[..], b"hello");

        b.cancel_recv_loop();
        recv_loop.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_on_writable_fires_when_writable() {
        let transport = UdpTransport::bind(&localhost_config()).await.unwrap();
        let (send, recv) = tokio::sync::oneshot::channel();
        transport.on_writable(Box::new(move || { let _ = send.send(()); }));
        tokio::time::timeout(Duration::from_secs(5), recv).await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let mut config = localhost_config();
        config.send_queue_capacity = 0;
        assert!(UdpTransport::bind(&config).await.is_err());
    }
}
