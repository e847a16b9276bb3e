//! Periodic throughput reporting
//!
//! Samples a monotonic counter at a fixed period and logs the rate over the last
//! window together with the minimum and maximum window rate seen so far.

use std::time::Duration;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// `(min_rate, max_rate, elapsed)` of a finished reporter run
pub type Report = (f64, f64, Duration);

/// Delta-based rate tracking over successive samples
#[derive(Debug, Clone)]
pub struct RateWindow {
    last_count: u64,
    last_time: Instant,
    current: f64,
    min: f64,
    max: f64,
}

impl RateWindow {
    pub fn new(count: u64, now: Instant) -> Self {
        Self {
            last_count: count,
            last_time: now,
            current: 0.0,
            // First non-zero sample becomes the minimum
            min: f64::MAX,
            max: 0.0,
        }
    }

    /// Records a sample and returns the rate since the previous one
    pub fn sample(&mut self, count: u64, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.last_time).as_secs_f64();
        if elapsed <= 0.0 {
            return self.current;
        }
        // Counters can be reset by an operator between samples
        self.current = count.saturating_sub(self.last_count) as f64 / elapsed;
        if self.current > 0.0 {
            self.min = self.min.min(self.current);
            self.max = self.max.max(self.current);
        }
        self.last_count = count;
        self.last_time = now;
        self.current
    }

    pub fn min(&self) -> f64 {
        if self.min == f64::MAX {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

type Counter = Box<dyn Fn() -> u64 + Send + Sync>;
type Summary = Box<dyn Fn() -> String + Send + Sync>;

pub struct StatsReporter {
    label: String,
    period: Duration,
    counter: Counter,
    summary: Summary,
}

impl StatsReporter {
    /// `counter` is sampled for the rate, `summary` is appended to every line
    pub fn new(
        label: impl Into<String>,
        period: Duration,
        counter: impl Fn() -> u64 + Send + Sync + 'static,
        summary: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            period,
            counter: Box::new(counter),
            summary: Box::new(summary),
        }
    }

    /// Logs a line every period until `shutdown`
    ///
    /// # Returns
    /// * `(min_rate, max_rate, elapsed)` - Window rate extremes and total run time
    pub async fn run(&self, shutdown: CancellationToken) -> Report {
        let start = Instant::now();
        let mut window = RateWindow::new((self.counter)(), start);
        let mut ticker = interval(self.period);
        // The first tick is immediate
        ticker.tick().await;

        loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let rate = window.sample((self.counter)(), Instant::now());
                    info!(
                        "{}: {:.1} msg/s (min: {:.1}, max: {:.1}) {}",
                        self.label,
                        rate,
                        window.min(),
                        window.max(),
                        (self.summary)()
                    );
                }
            }
        }

        (window.min(), window.max(), start.elapsed())
    }

    /// Runs the reporter on its own task
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Report> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

/// Waits for a spawned reporter; a panicked or aborted task is logged and yields `None`
pub async fn join_reporter(task: JoinHandle<Report>) -> Option<Report> {
    match task.await {
        Ok(report) => Some(report),
        Err(e) => {
            error!("Stats reporter failed: {}", e);
            None
        }
    }
}
