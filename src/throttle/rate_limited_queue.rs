use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tracing::{error, trace};

use crate::throttle::token_bucket::TokenBucket;

type Task = Box<dyn FnOnce() + Send>;

/// An unbounded FIFO of deferred operations, executed at the rate its [TokenBucket] permits.
///
/// At most one consumer drains the queue at any time. The consumer runs on tokio's blocking
///  thread pool because waiting for a token blocks the thread, and it terminates when it finds
///  the queue empty. The next `add` starts a new one.
#[derive(Clone)]
pub struct RateLimitedQueue {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<VecDeque<Task>>,
    consumer_active: AtomicBool,
    token_bucket: TokenBucket,
    handle: Handle,
}

impl RateLimitedQueue {
    pub fn new(max_events_per_second: u64, handle: Handle) -> anyhow::Result<RateLimitedQueue> {
        Ok(Self::with_token_bucket(TokenBucket::for_rate(max_events_per_second)?, handle))
    }

    pub fn with_token_bucket(token_bucket: TokenBucket, handle: Handle) -> RateLimitedQueue {
        RateLimitedQueue {
            inner: Arc::new(Inner {
                queue: Default::default(),
                consumer_active: AtomicBool::new(false),
                token_bucket,
                handle,
            }),
        }
    }

    pub fn add(&self, task: impl FnOnce() + Send + 'static) {
        let len = {
            let mut queue = self.inner.queue.lock().unwrap();
            queue.push_back(Box::new(task));
            queue.len()
        };
        trace!(len, "enqueued throttled task");

        if self.inner.consumer_active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let inner = self.inner.clone();
            self.inner.handle.spawn_blocking(move || inner.run_consumer());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_consumer_active(&self) -> bool {
        self.inner.consumer_active.load(Ordering::Acquire)
    }
}

impl Inner {
    fn run_consumer(&self) {
        trace!("throttled queue consumer started");
        loop {
            while let Some(task) = self.poll() {
                self.token_bucket.consume();
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!("throttled task panicked");
                }
            }

            self.consumer_active.store(false, Ordering::Release);

            // an add() between our last poll and the store above saw an active consumer and
            //  did not start one, so we have to pick up its task
            if self.queue.lock().unwrap().is_empty() {
                break;
            }
            if self.consumer_active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
                break;
            }
        }
        trace!("throttled queue consumer is done");
    }

    fn poll(&self) -> Option<Task> {
        self.queue.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_executes_in_order() {
        let queue = RateLimitedQueue::new(1000, Handle::current()).unwrap();
        let (send, mut recv) = mpsc::unbounded_channel();

        for i in 0..20 {
            let send = send.clone();
            queue.add(move || send.send(i).unwrap());
        }

        for i in 0..20 {
            assert_eq!(recv.recv().await, Some(i));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_rate_is_limited() {
        let queue = RateLimitedQueue::new(20, Handle::current()).unwrap();
        let (send, mut recv) = mpsc::unbounded_channel();

        let start = Instant::now();
        for _ in 0..5 {
            let send = send.clone();
            queue.add(move || send.send(Instant::now()).unwrap());
        }
        let mut last = start;
        for _ in 0..5 {
            last = recv.recv().await.unwrap();
        }

        // the bucket starts with one token, the remaining four are 50ms apart
        assert!(last.duration_since(start) >= Duration::from_millis(190), "took {:?}", last.duration_since(start));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_consumer() {
        let queue = RateLimitedQueue::new(10_000, Handle::current()).unwrap();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let (send, mut recv) = mpsc::unbounded_channel();

        for _ in 0..200 {
            let concurrent = concurrent.clone();
            let max_concurrent = max_concurrent.clone();
            let send = send.clone();
            queue.add(move || {
                let n = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(n, Ordering::SeqCst);
                std::thread::yield_now();
                concurrent.fetch_sub(1, Ordering::SeqCst);
                send.send(()).unwrap();
            });
        }
        for _ in 0..200 {
            recv.recv().await.unwrap();
        }

        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_consumer_restarts_after_idle() {
        let queue = RateLimitedQueue::new(1000, Handle::current()).unwrap();
        let (send, mut recv) = mpsc::unbounded_channel();

        let cloned = send.clone();
        queue.add(move || cloned.send(1).unwrap());
        assert_eq!(recv.recv().await, Some(1));

        while queue.is_consumer_active() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(queue.is_empty());

        queue.add(move || send.send(2).unwrap());
        assert_eq!(recv.recv().await, Some(2));
    }
}
