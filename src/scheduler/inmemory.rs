//! In-process reference [`Broker`], used for tests and single-binary
//! deployments that don't need a standalone queue.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::broker::{Broker, BrokerError, BrokerMessage, Delivery, QueueKind};

#[derive(Default)]
struct Queues {
    workflow_tick: Vec<BrokerMessage>,
    step_task: Vec<BrokerMessage>,
    in_flight: HashMap<Uuid, (QueueKind, BrokerMessage)>,
}

impl Queues {
    fn queue_mut(&mut self, kind: QueueKind) -> &mut Vec<BrokerMessage> {
        match kind {
            QueueKind::WorkflowTick => &mut self.workflow_tick,
            QueueKind::StepTask => &mut self.step_task,
        }
    }
}

pub struct InMemoryBroker {
    queues: Mutex<Queues>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock();
        queues.queue_mut(message.queue).push(message);
        Ok(())
    }

    async fn cancel(&self, run_id: Uuid, queue: QueueKind) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock();
        queues.queue_mut(queue).retain(|m| m.run_id != run_id);
        Ok(())
    }

    async fn poll(&self, queue: QueueKind, max: u32) -> Result<Vec<Delivery>, BrokerError> {
        let mut queues = self.queues.lock();
        let now = Utc::now();
        let q = queues.queue_mut(queue);

        let mut ready_indices = Vec::new();
        for (idx, msg) in q.iter().enumerate() {
            if msg.not_before.map_or(true, |nb| nb <= now) {
                ready_indices.push(idx);
            }
            if ready_indices.len() as u32 >= max {
                break;
            }
        }

        let mut removed = Vec::new();
        for idx in ready_indices.into_iter().rev() {
            let mut message = q.remove(idx);
            message.delivery_attempt += 1;
            removed.push((Uuid::now_v7(), message));
        }

        let mut delivered = Vec::new();
        for (token, message) in removed {
            delivered.push(Delivery {
                message: message.clone(),
                delivery_token: token,
            });
            queues.in_flight.insert(token, (queue, message));
        }
        delivered.reverse();
        Ok(delivered)
    }

    async fn ack(&self, delivery_token: Uuid) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock();
        queues
            .in_flight
            .remove(&delivery_token)
            .ok_or(BrokerError::UnknownDelivery(delivery_token))?;
        Ok(())
    }

    async fn nack(
        &self,
        delivery_token: Uuid,
        retry_after: Option<chrono::DateTime<Utc>>,
    ) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock();
        let (queue, mut message) = queues
            .in_flight
            .remove(&delivery_token)
            .ok_or(BrokerError::UnknownDelivery(delivery_token))?;
        message.not_before = retry_after;
        queues.queue_mut(queue).push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_and_poll_round_trips() {
        let broker = InMemoryBroker::new();
        let run_id = Uuid::now_v7();
        broker
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .unwrap();

        let delivered = broker.poll(QueueKind::WorkflowTick, 10).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message.run_id, run_id);

        broker.ack(delivered[0].delivery_token).await.unwrap();
        let empty = broker.poll(QueueKind::WorkflowTick, 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn nack_requeues_for_redelivery() {
        let broker = InMemoryBroker::new();
        let run_id = Uuid::now_v7();
        broker
            .enqueue(BrokerMessage::workflow_tick(run_id))
            .await
            .unwrap();

        let delivered = broker.poll(QueueKind::WorkflowTick, 10).await.unwrap();
        broker.nack(delivered[0].delivery_token, None).await.unwrap();

        let redelivered = broker.poll(QueueKind::WorkflowTick, 10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].message.delivery_attempt, 2);
    }

    #[tokio::test]
    async fn delayed_messages_are_not_delivered_early() {
        let broker = InMemoryBroker::new();
        let run_id = Uuid::now_v7();
        let future = Utc::now() + chrono::Duration::hours(1);
        broker
            .enqueue(BrokerMessage::workflow_tick(run_id).with_delay(future))
            .await
            .unwrap();

        let delivered = broker.poll(QueueKind::WorkflowTick, 10).await.unwrap();
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn cancel_removes_pending_messages_for_run() {
        let broker = InMemoryBroker::new();
        let run_id = Uuid::now_v7();
        broker
            .enqueue(BrokerMessage::step_task(run_id, "step-1"))
            .await
            .unwrap();
        broker.cancel(run_id, QueueKind::StepTask).await.unwrap();

        let delivered = broker.poll(QueueKind::StepTask, 10).await.unwrap();
        assert!(delivered.is_empty());
    }
}
