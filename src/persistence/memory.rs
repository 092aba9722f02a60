//! In-memory reference implementation of the storage contract. Used in
//! tests and single-process deployments; not crash-safe (§9).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::model::{Event, EventData, Hook, HookStatus, Run, RunStatus, Step};
use crate::reliability::ClaimLease;

use super::store::{
    Pagination, RunFilter, RunPage, ScheduledWake, StorageContract, StoreError,
};

struct RunRecord {
    run: Run,
    events: Vec<Event>,
    claim: Option<ClaimLease>,
}

/// An in-memory [`StorageContract`]. All state lives behind `parking_lot`
/// locks so every method is synchronous internally despite the async trait.
#[derive(Default)]
pub struct InMemoryStore {
    runs: RwLock<HashMap<Uuid, RunRecord>>,
    idempotency: RwLock<HashMap<(String, String), Uuid>>,
    steps: RwLock<HashMap<String, Step>>,
    hooks: RwLock<HashMap<String, Hook>>,
    wakes: RwLock<HashMap<Uuid, ScheduledWake>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }
}

#[async_trait]
impl StorageContract for InMemoryStore {
    async fn create_run(&self, run: Run) -> Result<Run, StoreError> {
        if let Some(key) = run.idempotency_key.clone() {
            let mut idem = self.idempotency.write();
            let idem_key = (run.workflow_name.clone(), key);
            if let Some(existing_id) = idem.get(&idem_key) {
                let runs = self.runs.read();
                return Ok(runs
                    .get(existing_id)
                    .map(|r| r.run.clone())
                    .expect("idempotency index points at a live run"));
            }
            idem.insert(idem_key, run.run_id);
        }

        let mut runs = self.runs.write();
        let inserted = run.clone();
        runs.insert(
            run.run_id,
            RunRecord {
                run,
                events: Vec::new(),
                claim: None,
            },
        );
        Ok(inserted)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Run, StoreError> {
        self.runs
            .read()
            .get(&run_id)
            .map(|r| r.run.clone())
            .ok_or(StoreError::RunNotFound(run_id))
    }

    async fn find_run_by_idempotency_key(
        &self,
        workflow_name: &str,
        key: &str,
    ) -> Result<Option<Run>, StoreError> {
        let idem = self.idempotency.read();
        let Some(run_id) = idem.get(&(workflow_name.to_string(), key.to_string())) else {
            return Ok(None);
        };
        Ok(self.runs.read().get(run_id).map(|r| r.run.clone()))
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        if record.run.status.is_terminal() || record.run.status != from {
            return Err(StoreError::InvalidStatusTransition {
                run_id,
                expected: from,
                actual: record.run.status,
            });
        }
        record.run.status = to;
        let now = Utc::now();
        if to == RunStatus::Running && record.run.started_at.is_none() {
            record.run.started_at = Some(now);
        }
        if to.is_terminal() {
            record.run.completed_at = Some(now);
        }
        Ok(())
    }

    async fn set_run_result(
        &self,
        run_id: Uuid,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        record.run.result = result;
        record.run.error = error;
        Ok(())
    }

    async fn increment_recovery_attempts(&self, run_id: Uuid) -> Result<u32, StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        record.run.recovery_attempts += 1;
        Ok(record.run.recovery_attempts)
    }

    async fn set_continued_to(&self, run_id: Uuid, successor_run_id: Uuid) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        record.run.continued_to_run_id = Some(successor_run_id);
        Ok(())
    }

    async fn append_events(
        &self,
        run_id: Uuid,
        expected_next_sequence: i32,
        events: Vec<EventData>,
    ) -> Result<i32, StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let next_sequence = record.events.len() as i32 + 1;
        if expected_next_sequence != next_sequence {
            return Err(StoreError::ConcurrencyConflict {
                run_id,
                expected: expected_next_sequence,
                actual: next_sequence,
            });
        }
        let mut sequence = next_sequence;
        for data in events {
            record.events.push(Event::new(run_id, sequence, data));
            sequence += 1;
        }
        Ok(sequence - 1)
    }

    async fn read_events(
        &self,
        run_id: Uuid,
        from_sequence: Option<i32>,
    ) -> Result<Vec<Event>, StoreError> {
        let runs = self.runs.read();
        let record = runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let from = from_sequence.unwrap_or(1);
        Ok(record
            .events
            .iter()
            .filter(|e| e.sequence >= from)
            .cloned()
            .collect())
    }

    async fn upsert_step(&self, step: Step) -> Result<(), StoreError> {
        self.steps.write().insert(step.step_id.clone(), step);
        Ok(())
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>, StoreError> {
        Ok(self.steps.read().get(step_id).cloned())
    }

    async fn upsert_hook(&self, hook: Hook) -> Result<(), StoreError> {
        self.hooks.write().insert(hook.hook_id.clone(), hook);
        Ok(())
    }

    async fn get_hook(&self, hook_id: &str) -> Result<Option<Hook>, StoreError> {
        Ok(self.hooks.read().get(hook_id).cloned())
    }

    async fn resolve_hook(
        &self,
        hook_id: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut hooks = self.hooks.write();
        let hook = hooks
            .get_mut(hook_id)
            .ok_or_else(|| StoreError::HookNotFound(hook_id.to_string()))?;
        if hook.status != HookStatus::Pending {
            return Ok(false);
        }
        hook.status = HookStatus::Received;
        hook.payload = Some(payload);
        Ok(true)
    }

    async fn claim_run(
        &self,
        run_id: Uuid,
        worker_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<ClaimLease, StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let now = Utc::now();
        if let Some(existing) = &record.claim {
            if !existing.is_expired(now) && existing.holder != worker_id {
                return Err(StoreError::AlreadyClaimed(run_id));
            }
        }
        let lease = ClaimLease::new(worker_id, ttl, now);
        record.claim = Some(lease);
        Ok(lease)
    }

    async fn renew_claim(
        &self,
        run_id: Uuid,
        worker_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<ClaimLease, StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        let now = Utc::now();
        match &mut record.claim {
            Some(lease) if lease.holder == worker_id => {
                lease.renew(ttl, now);
                Ok(*lease)
            }
            _ => Err(StoreError::ClaimNotHeld(run_id)),
        }
    }

    async fn release_claim(&self, run_id: Uuid, worker_id: Uuid) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let record = runs.get_mut(&run_id).ok_or(StoreError::RunNotFound(run_id))?;
        if let Some(lease) = &record.claim {
            if lease.holder == worker_id {
                record.claim = None;
            }
        }
        Ok(())
    }

    async fn list_expired_claims(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let runs = self.runs.read();
        Ok(runs
            .values()
            .filter(|r| !r.run.status.is_terminal())
            .filter(|r| matches!(&r.claim, Some(lease) if lease.is_expired(now)))
            .map(|r| r.run.run_id)
            .collect())
    }

    async fn schedule_wake(&self, wake: ScheduledWake) -> Result<(), StoreError> {
        self.wakes.write().insert(wake.wake_id, wake);
        Ok(())
    }

    async fn pop_due_wakes(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledWake>, StoreError> {
        let mut wakes = self.wakes.write();
        let due_ids: Vec<Uuid> = wakes
            .values()
            .filter(|w| w.wake_at <= now)
            .map(|w| w.wake_id)
            .collect();
        Ok(due_ids
            .into_iter()
            .filter_map(|id| wakes.remove(&id))
            .collect())
    }

    async fn cancel_wakes_for_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.wakes.write().retain(|_, w| w.run_id != run_id);
        Ok(())
    }

    async fn list_runs(
        &self,
        filter: RunFilter,
        pagination: Pagination,
    ) -> Result<RunPage, StoreError> {
        let runs = self.runs.read();
        let mut matched: Vec<Run> = runs
            .values()
            .map(|r| &r.run)
            .filter(|r| {
                filter
                    .workflow_name
                    .as_ref()
                    .map_or(true, |name| &r.workflow_name == name)
            })
            .filter(|r| filter.status.map_or(true, |status| r.status == status))
            .filter(|r| {
                filter
                    .created_after
                    .map_or(true, |after| r.created_at >= after)
            })
            .filter(|r| {
                filter
                    .created_before
                    .map_or(true, |before| r.created_at <= before)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.created_at);

        let offset = pagination.cursor.unwrap_or(0).max(0) as usize;
        let limit = pagination.limit as usize;
        let page: Vec<Run> = matched.into_iter().skip(offset).take(limit).collect();
        let next_cursor = if page.len() == limit {
            Some(offset as i64 + limit as i64)
        } else {
            None
        };
        Ok(RunPage {
            runs: page,
            next_cursor,
        })
    }

    async fn list_outstanding_children(&self, run_id: Uuid) -> Result<Vec<Run>, StoreError> {
        let runs = self.runs.read();
        Ok(runs
            .values()
            .map(|r| &r.run)
            .filter(|r| r.parent_run_id == Some(run_id) && !r.status.is_terminal())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> InMemoryStore {
        InMemoryStore::new()
    }

    #[tokio::test]
    async fn create_and_get_run() {
        let s = store();
        let run = Run::new("order_wf", json!({"order_id": "A"}), json!({}));
        let created = s.create_run(run.clone()).await.unwrap();
        let fetched = s.get_run(created.run_id).await.unwrap();
        assert_eq!(fetched.workflow_name, "order_wf");
    }

    #[tokio::test]
    async fn idempotent_create_returns_existing_run() {
        let s = store();
        let run1 = Run::new("payment_wf", json!({}), json!({})).with_idempotency_key("pay-p1");
        let run2 = Run::new("payment_wf", json!({}), json!({})).with_idempotency_key("pay-p1");
        let created1 = s.create_run(run1).await.unwrap();
        let created2 = s.create_run(run2).await.unwrap();
        assert_eq!(created1.run_id, created2.run_id);
        assert_eq!(s.run_count(), 1);
    }

    #[tokio::test]
    async fn append_events_enforces_cas() {
        let s = store();
        let run = s
            .create_run(Run::new("wf", json!({}), json!({})))
            .await
            .unwrap();
        let seq = s
            .append_events(
                run.run_id,
                1,
                vec![EventData::WorkflowStarted {
                    workflow_name: "wf".into(),
                    input_args: json!({}),
                    input_kwargs: json!({}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let conflict = s
            .append_events(
                run.run_id,
                1,
                vec![EventData::WorkflowCompleted { result: json!({}) }],
            )
            .await;
        assert!(matches!(
            conflict,
            Err(StoreError::ConcurrencyConflict { expected: 1, actual: 2, .. })
        ));
    }

    #[tokio::test]
    async fn status_transition_rejects_wrong_from_state() {
        let s = store();
        let run = s
            .create_run(Run::new("wf", json!({}), json!({})))
            .await
            .unwrap();
        let result = s
            .update_run_status(run.run_id, RunStatus::Running, RunStatus::Completed)
            .await;
        assert!(matches!(
            result,
            Err(StoreError::InvalidStatusTransition { .. })
        ));
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let s = store();
        let run = s
            .create_run(Run::new("wf", json!({}), json!({})))
            .await
            .unwrap();
        s.update_run_status(run.run_id, RunStatus::Pending, RunStatus::Completed)
            .await
            .unwrap();
        let result = s
            .update_run_status(run.run_id, RunStatus::Completed, RunStatus::Running)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_expiry() {
        let s = store();
        let run = s
            .create_run(Run::new("wf", json!({}), json!({})))
            .await
            .unwrap();
        let worker_a = Uuid::now_v7();
        let worker_b = Uuid::now_v7();
        s.claim_run(run.run_id, worker_a, std::time::Duration::from_secs(30))
            .await
            .unwrap();
        let result = s
            .claim_run(run.run_id, worker_b, std::time::Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(StoreError::AlreadyClaimed(_))));
    }

    #[tokio::test]
    async fn hook_resolves_exactly_once() {
        let s = store();
        let run_id = Uuid::now_v7();
        let hook = Hook::new(run_id, "approval", 0, None, None);
        s.upsert_hook(hook.clone()).await.unwrap();
        let first = s.resolve_hook(&hook.hook_id, json!({"ok": true})).await.unwrap();
        assert!(first);
        let second = s.resolve_hook(&hook.hook_id, json!({"ok": true})).await.unwrap();
        assert!(!second);
    }

    #[tokio::test]
    async fn due_wakes_are_popped_once() {
        let s = store();
        let run_id = Uuid::now_v7();
        let now = Utc::now();
        s.schedule_wake(ScheduledWake {
            wake_id: Uuid::now_v7(),
            run_id,
            wake_at: now - chrono::Duration::seconds(1),
            kind: super::super::store::WakeKind::SleepElapsed,
            subject_id: None,
        })
        .await
        .unwrap();
        let due = s.pop_due_wakes(now).await.unwrap();
        assert_eq!(due.len(), 1);
        let due_again = s.pop_due_wakes(now).await.unwrap();
        assert!(due_again.is_empty());
    }
}
