//! Broker polling with adaptive backoff: backs off when a queue is empty,
//! resets to the minimum interval the moment work shows up.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::scheduler::{Broker, BrokerError, Delivery, QueueKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    #[serde(with = "crate::reliability::retry::duration_millis")]
    pub min_interval: Duration,

    #[serde(with = "crate::reliability::retry::duration_millis")]
    pub max_interval: Duration,

    pub backoff_multiplier: f64,
    pub batch_size: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Polls one [`QueueKind`], backing off on empty polls and resetting on hits.
pub struct QueuePoller<B: Broker> {
    broker: Arc<B>,
    queue: QueueKind,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B: Broker> QueuePoller<B> {
    pub fn new(
        broker: Arc<B>,
        queue: QueueKind,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            queue,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    #[instrument(skip(self), fields(queue = ?self.queue))]
    pub async fn poll(&mut self) -> Result<Vec<Delivery>, PollerError> {
        if *self.shutdown_rx.borrow() {
            debug!("poller shutdown requested");
            return Ok(vec![]);
        }

        let deliveries = self.broker.poll(self.queue, self.config.batch_size).await?;
        if deliveries.is_empty() {
            self.increase_backoff();
            trace!(interval_ms = self.current_interval.as_millis(), "no messages, backing off");
        } else {
            self.reset_backoff();
            debug!(count = deliveries.len(), "polled messages");
        }
        Ok(deliveries)
    }

    /// Sleep for the current backoff interval. Returns `true` if it
    /// returned early because shutdown was signaled.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let scaled = self.current_interval.as_secs_f64() * self.config.backoff_multiplier;
        self.current_interval = Duration::from_secs_f64(scaled).min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{BrokerMessage, InMemoryBroker};

    #[tokio::test]
    async fn backoff_increases_on_empty_poll_and_resets_on_hit() {
        let broker = Arc::new(InMemoryBroker::new());
        let (_tx, rx) = watch::channel(false);
        let mut poller = QueuePoller::new(
            broker.clone(),
            QueueKind::WorkflowTick,
            PollerConfig::default().with_min_interval(Duration::from_millis(10)),
            rx,
        );

        let empty = poller.poll().await.unwrap();
        assert!(empty.is_empty());
        assert!(poller.current_interval > Duration::from_millis(10));

        broker
            .enqueue(BrokerMessage::workflow_tick(uuid::Uuid::now_v7()))
            .await
            .unwrap();
        let hit = poller.poll().await.unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(poller.current_interval, Duration::from_millis(10));
    }
}
