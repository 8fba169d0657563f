use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::bail;

/// Refill intervals below this are waited for by spinning rather than sleeping, since sleep
///  granularity would distort the rate.
pub const BUSY_WAIT_THRESHOLD: Duration = Duration::from_millis(20);

/// One token per nanosecond is the finest rate a refill interval can express.
pub const MAX_EVENTS_PER_SECOND: u64 = 1_000_000_000;

/// A token bucket holding up to `capacity` tokens and gaining one token per `refill_interval`.
///
/// Refill is computed lazily from the time elapsed since the last refill whenever a token is
///  requested, so there is no timer involved. The bucket starts full.
pub struct TokenBucket {
    capacity: u64,
    refill_interval: Duration,
    busy_wait: bool,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_interval: Duration, busy_wait: bool) -> anyhow::Result<TokenBucket> {
        if capacity == 0 {
            bail!("token bucket capacity must be positive");
        }
        if refill_interval.is_zero() {
            bail!("token bucket refill interval must be positive");
        }

        Ok(TokenBucket {
            capacity,
            refill_interval,
            busy_wait,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    /// A bucket of capacity 1 allowing `events_per_second`, busy waiting if that is more
    ///  than the sleep granularity allows.
    pub fn for_rate(events_per_second: u64) -> anyhow::Result<TokenBucket> {
        if events_per_second == 0 {
            bail!("rate must be positive");
        }
        if events_per_second > MAX_EVENTS_PER_SECOND {
            bail!("rate of {} per second exceeds the maximum of {}", events_per_second, MAX_EVENTS_PER_SECOND);
        }
        let refill_interval = Duration::from_nanos(MAX_EVENTS_PER_SECOND / events_per_second);
        Self::new(1, refill_interval, refill_interval < BUSY_WAIT_THRESHOLD)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn is_busy_wait(&self) -> bool {
        self.busy_wait
    }

    pub fn available_tokens(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn try_consume(&self) -> bool {
        self.try_consume_at(Instant::now()).is_ok()
    }

    /// Blocks the calling thread until a token is available, and takes it.
    ///
    /// NB: This must not be called on an async runtime's worker thread.
    pub fn consume(&self) {
        loop {
            match self.try_consume_at(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    if self.busy_wait {
                        std::hint::spin_loop();
                    }
                    else {
                        std::thread::sleep(wait);
                    }
                }
            }
        }
    }

    /// returns the time until the next token is due if there is no token
    fn try_consume_at(&self, now: Instant) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap();
        self.refill(&mut state, now);

        if state.tokens > 0 {
            state.tokens -= 1;
            Ok(())
        }
        else {
            let next_refill = state.last_refill + self.refill_interval;
            Err(next_refill.saturating_duration_since(now))
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let new_tokens = (elapsed.as_nanos() / self.refill_interval.as_nanos()) as u64;
        if new_tokens == 0 {
            return;
        }

        state.tokens = (state.tokens + new_tokens).min(self.capacity);
        if state.tokens == self.capacity {
            // no credit accumulates beyond a full bucket
            state.last_refill = now;
        }
        else {
            state.last_refill += self.refill_interval * new_tokens as u32;
        }
    }
}
