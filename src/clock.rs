use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// A coarse wall clock, refreshed by a background task at a fixed interval. Reading it is a
///  single atomic load, which matters on per-message paths where exact time is irrelevant.
pub struct CachedClock {
    millis: Arc<AtomicI64>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl CachedClock {
    pub fn start(handle: &Handle, interval: Duration) -> CachedClock {
        let millis = Arc::new(AtomicI64::new(system_millis()));

        let cloned = millis.clone();
        let refresh_task = handle.spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                cloned.store(system_millis(), Ordering::Release);
            }
        });

        CachedClock {
            millis,
            refresh_task: Mutex::new(Some(refresh_task)),
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::Acquire)
    }

    pub fn now_secs(&self) -> i64 {
        self.now_millis() / 1000
    }

    pub fn stop(&self) {
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            trace!("stopping cached clock");
            task.abort();
        }
    }

    #[cfg(test)]
    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::Release);
    }
}

impl Drop for CachedClock {
    fn drop(&mut self) {
        self.stop();
    }
}

fn system_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
