//! Fixed-rate publish scheduler
//!
//! Fires a callback every `1_000_000 / rate` microseconds on its own task. The tick
//! schedule is anchored at start, so a slow callback does not push later ticks back.
//! Start, stop and rate changes are serialized by one async lock, which keeps at most
//! one firing task alive at any time.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const MIN_RATE: u32 = 1;
pub const MAX_RATE: u32 = 10_000;

/// How long `stop` waits for an in-flight callback before aborting the task
pub const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateError {
    #[error("Rate must be between 1 and 10000 messages per second")]
    OutOfRange(i64),

    /// Missing or not an integer
    #[error("Rate must be between 1 and 10000 messages per second")]
    Unparseable,
}

/// Accepts rates in `[MIN_RATE, MAX_RATE]`
pub fn validate_rate(rate: i64) -> Result<u32, RateError> {
    if rate < i64::from(MIN_RATE) || rate > i64::from(MAX_RATE) {
        return Err(RateError::OutOfRange(rate));
    }
    Ok(rate as u32)
}

/// Tick period for `rate` messages per second
pub fn period_for(rate: u32) -> Duration {
    Duration::from_micros(1_000_000 / u64::from(rate.max(MIN_RATE)))
}

pub type Tick = Arc<dyn Fn() + Send + Sync>;

struct Firing {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct RateScheduler {
    tick: Tick,
    rate: AtomicU32,
    running: Arc<AtomicBool>,
    firing: Mutex<Option<Firing>>,
    grace: Duration,
}

impl RateScheduler {
    pub fn new(rate: u32, tick: Tick) -> Result<Self, RateError> {
        let rate = validate_rate(i64::from(rate))?;
        Ok(Self {
            tick,
            rate: AtomicU32::new(rate),
            running: Arc::new(AtomicBool::new(false)),
            firing: Mutex::new(None),
            grace: STOP_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn rate(&self) -> u32 {
        self.rate.load(Ordering::SeqCst)
    }

    /// Starts firing at `rate`
    ///
    /// # Returns
    /// * `Ok(true)` - The schedule was started
    /// * `Ok(false)` - Already running; nothing changed
    /// * `Err(RateError)` - `rate` is outside the accepted range
    pub async fn start(&self, rate: u32) -> Result<bool, RateError> {
        let rate = validate_rate(i64::from(rate))?;
        let mut firing = self.firing.lock().await;
        if firing.is_some() {
            info!("Producer is already running at {} msg/s", self.rate());
            return Ok(false);
        }
        self.rate.store(rate, Ordering::SeqCst);
        *firing = Some(self.spawn(rate));
        info!("Producer started at {} msg/s", rate);
        Ok(true)
    }

    /// Stops firing; returns `false` if nothing was running
    pub async fn stop(&self) -> bool {
        let mut firing = self.firing.lock().await;
        match firing.take() {
            Some(current) => {
                self.halt(current).await;
                info!("Producer stopped");
                true
            }
            None => false,
        }
    }

    /// Changes the rate; a running schedule is replaced by one at the new rate
    pub async fn set_rate(&self, rate: i64) -> Result<u32, RateError> {
        let rate = validate_rate(rate)?;
        let mut firing = self.firing.lock().await;
        match firing.take() {
            Some(current) => {
                self.halt(current).await;
                self.rate.store(rate, Ordering::SeqCst);
                *firing = Some(self.spawn(rate));
                info!("Producer rate changed to {} msg/s", rate);
            }
            None => {
                self.rate.store(rate, Ordering::SeqCst);
                info!("Producer rate set to {} msg/s (not running)", rate);
            }
        }
        Ok(rate)
    }

    fn spawn(&self, rate: u32) -> Firing {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let tick = self.tick.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            // First tick completes immediately; missed ticks are caught up
            let mut ticker = tokio::time::interval(period_for(rate));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                tick();
            }
        });
        Firing { handle, cancel }
    }

    async fn halt(&self, firing: Firing) {
        self.running.store(false, Ordering::SeqCst);
        firing.cancel.cancel();
        let Firing { mut handle, .. } = firing;
        if tokio::time::timeout(self.grace, &mut handle).await.is_err() {
            warn!(
                "Producer task did not stop within {:?}, aborting it",
                self.grace
            );
            handle.abort();
        }
    }
}
