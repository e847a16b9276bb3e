//! Load producer: generator, publisher and scheduler behind one handle
//!
//! One instance exists per process and is shared with the control surface.

use crate::bus::BusProducer;
use crate::generator::MessageGenerator;
use crate::producer::{ProducerStats, Publisher};
use crate::scheduler::{RateError, RateScheduler, Tick};
use std::sync::Arc;

pub struct LoadProducer {
    publisher: Arc<Publisher>,
    scheduler: RateScheduler,
}

impl LoadProducer {
    pub fn new(
        bus: Arc<dyn BusProducer>,
        topic: impl Into<String>,
        rate: u32,
    ) -> Result<Self, RateError> {
        let publisher = Arc::new(Publisher::new(bus, topic));
        let generator = MessageGenerator::new();
        let target = publisher.clone();
        let tick: Tick = Arc::new(move || target.publish(&generator.generate()));
        Ok(Self {
            publisher,
            scheduler: RateScheduler::new(rate, tick)?,
        })
    }

    /// Starts publishing at the current rate; `false` if already running
    pub async fn start(&self) -> bool {
        // The stored rate is always in range
        self.scheduler
            .start(self.scheduler.rate())
            .await
            .unwrap_or(false)
    }

    /// Stops publishing, waits for outstanding sends and returns the final stats
    pub async fn stop(&self) -> ProducerStats {
        self.scheduler.stop().await;
        self.publisher.flush().await;
        self.stats()
    }

    pub async fn set_rate(&self, rate: i64) -> Result<u32, RateError> {
        self.scheduler.set_rate(rate).await
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn rate(&self) -> u32 {
        self.scheduler.rate()
    }

    pub fn stats(&self) -> ProducerStats {
        self.publisher.stats(self.is_running(), self.rate())
    }

    pub fn reset_stats(&self) {
        self.publisher.counters().reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_runs_at_rate_and_reports() {
        let bus = Arc::new(MemoryBus::new());
        let load = LoadProducer::new(bus.clone(), "accounts", 20).unwrap();

        assert!(load.start().await);
        assert!(!load.start().await);
        tokio::time::sleep(Duration::from_millis(990)).await;
        let stats = load.stop().await;

        assert!(!stats.running);
        assert_eq!(stats.messages_per_second, 20);
        assert_eq!(stats.messages_sent, 20);
        assert_eq!(stats.messages_successful, 20);
        assert_eq!(bus.records("accounts").len(), 20);

        load.reset_stats();
        assert_eq!(load.stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_rate_change_while_stopped() {
        let load = LoadProducer::new(Arc::new(MemoryBus::new()), "accounts", 10).unwrap();
        assert_eq!(load.set_rate(500).await, Ok(500));
        assert_eq!(load.stats().messages_per_second, 500);
        assert!(load.set_rate(20_000).await.is_err());
        assert_eq!(load.rate(), 500);
    }
}
