use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

tokio::task_local! {
    static CURRENT_EVENT_LOOP: u64;
}

static NEXT_EVENT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

type Task = Box<dyn FnOnce() + Send>;

/// A serial executor on top of tokio: tasks submitted to an event loop run one at a time, in
///  submission order, and never concurrently with each other. Every channel is bound to one
///  event loop, and all mutations of its read / write state happen there.
///
/// Tasks are synchronous and must not block.
#[derive(Clone)]
pub struct EventLoop {
    id: u64,
    sender: mpsc::UnboundedSender<Task>,
}

impl EventLoop {
    /// Spawns the loop's worker on the current tokio runtime. The loop terminates when the
    ///  last handle to it is dropped.
    pub fn new() -> anyhow::Result<EventLoop> {
        let handle = Handle::try_current()
            .context("an event loop requires a tokio runtime")?;
        Ok(Self::new_on(&handle))
    }

    pub fn new_on(handle: &Handle) -> EventLoop {
        let id = NEXT_EVENT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();

        handle.spawn(async move {
            trace!(id, "starting event loop");
            while let Some(task) = receiver.recv().await {
                CURRENT_EVENT_LOOP.sync_scope(id, || {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(id, "task panicked on event loop");
                    }
                });
            }
            debug!(id, "event loop terminated");
        });

        EventLoop { id, sender }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// true if the caller is running as a task of this event loop
    pub fn in_event_loop(&self) -> bool {
        CURRENT_EVENT_LOOP.try_with(|id| *id == self.id)
            .unwrap_or(false)
    }

    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> anyhow::Result<()> {
        if self.sender.send(Box::new(task)).is_err() {
            bail!("event loop {} is terminated", self.id);
        }
        Ok(())
    }

    /// Runs a task on the loop and waits for its result.
    pub async fn submit<R: Send + 'static>(&self, task: impl FnOnce() -> R + Send + 'static) -> anyhow::Result<R> {
        let (send, recv) = tokio::sync::oneshot::channel();
        self.execute(move || {
            let _ = send.send(task());
        })?;
        recv.await
            .map_err(|_| anyhow!("task on event loop {} did not complete", self.id))
    }
}


/// A fixed set of event loops, handed out round robin to new channels.
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    pub fn new(num_loops: usize) -> anyhow::Result<EventLoopGroup> {
        if num_loops == 0 {
            bail!("an event loop group needs at least one event loop");
        }

        let loops = (0..num_loops)
            .map(|_| EventLoop::new())
            .collect::<anyhow::Result<Vec<_>>>()?;
        Self::from_loops(loops)
    }

    /// A group of existing event loops, e.g. to share loops between groups.
    pub fn from_loops(loops: Vec<EventLoop>) -> anyhow::Result<EventLoopGroup> {
        if loops.is_empty() {
            bail!("an event loop group needs at least one event loop");
        }
        Ok(EventLoopGroup {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    pub fn next(&self) -> EventLoop {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[idx].clone()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }
}

pub type SharedEventLoopGroup = Arc<EventLoopGroup>;
