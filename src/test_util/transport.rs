use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::bail;
use bytes::Bytes;

use crate::envelope::Envelope;
use crate::identity::PeerAddress;
use crate::transport::{DatagramTransport, WritabilityCallback};

/// A [DatagramTransport] that records what is written to it, and whose writability is
///  controlled by the test.
#[derive(Default)]
pub struct TrackingTransport {
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
    writable: AtomicBool,
    /// number of further writes accepted before the transport turns unwritable
    remaining_writes: Mutex<Option<usize>>,
    callbacks: Mutex<Vec<WritabilityCallback>>,
    num_flushes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl TrackingTransport {
    pub fn new() -> TrackingTransport {
        TrackingTransport {
            writable: AtomicBool::new(true),
            ..Default::default()
        }
    }

    /// Turns the transport writable or not. Turning it writable calls all registered
    ///  writability callbacks.
    pub fn set_writable(&self, writable: bool) {
        *self.remaining_writes.lock().unwrap() = None;
        self.writable.store(writable, Ordering::SeqCst);

        if writable {
            let callbacks = std::mem::take(&mut *self.callbacks.lock().unwrap());
            for callback in callbacks {
                callback();
            }
        }
    }

    pub fn set_unwritable_after(&self, num_writes: usize) {
        *self.remaining_writes.lock().unwrap() = Some(num_writes);
        self.writable.store(num_writes > 0, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail_writes: bool) {
        self.fail_writes.store(fail_writes, Ordering::SeqCst);
    }

    pub fn num_flushes(&self) -> usize {
        self.num_flushes.load(Ordering::SeqCst)
    }

    pub fn num_pending_callbacks(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<(SocketAddr, Bytes)> {
        self.sent.lock().unwrap().clone()
    }

    /// the payloads sent so far, unwrapped from their envelopes, with their recipients
    pub fn sent_payloads(&self) -> Vec<(PeerAddress, Bytes)> {
        self.sent()
            .into_iter()
            .map(|(_, mut datagram)| {
                let envelope = Envelope::try_read(&mut datagram).unwrap();
                (envelope.to, datagram)
            })
            .collect()
    }
}

impl DatagramTransport for TrackingTransport {
    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn write(&self, endpoint: SocketAddr, datagram: Bytes) -> anyhow::Result<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("simulated transport failure");
        }
        if !self.is_writable() {
            return Ok(false);
        }

        self.sent.lock().unwrap().push((endpoint, datagram));

        let mut remaining_writes = self.remaining_writes.lock().unwrap();
        if let Some(remaining) = remaining_writes.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.writable.store(false, Ordering::SeqCst);
            }
        }
        Ok(true)
    }

    fn flush(&self) {
        self.num_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn on_writable(&self, callback: WritabilityCallback) {
        if self.is_writable() {
            callback();
        }
        else {
            self.callbacks.lock().unwrap().push(callback);
        }
    }
}
