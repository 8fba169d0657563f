use std::thread::JoinHandle;

use anyhow::anyhow;
use tokio::runtime::Builder;
use tokio::sync::oneshot;

use crate::event_loop::EventLoop;

/// An event loop running on its own single-threaded runtime and OS thread, so that a test can
///  terminate it while handles to it are still around.
pub struct DetachedEventLoop {
    event_loop: EventLoop,
    stop: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

impl DetachedEventLoop {
    pub fn start() -> anyhow::Result<DetachedEventLoop> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()?;
        let event_loop = EventLoop::new_on(runtime.handle());

        let (stop, stopped) = oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            let _ = runtime.block_on(stopped);
            // dropping the runtime drops the loop's task and with it the task queue
            drop(runtime);
        });

        Ok(DetachedEventLoop {
            event_loop,
            stop,
            thread,
        })
    }

    pub fn event_loop(&self) -> EventLoop {
        self.event_loop.clone()
    }

    /// Shuts down the runtime and waits for it. Every call to the loop fails afterwards.
    pub fn terminate(self) -> anyhow::Result<()> {
        let _ = self.stop.send(());
        self.thread.join()
            .map_err(|_| anyhow!("event loop thread panicked"))
    }
}
