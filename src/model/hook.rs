//! Hook: a named, durable "inbox slot" the workflow may await (§3.1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    Pending,
    Received,
    Expired,
    Disposed,
}

impl HookStatus {
    /// `PENDING -> RECEIVED | EXPIRED | DISPOSED` only; every other
    /// transition is rejected by the storage layer's CAS.
    pub fn can_transition_to(self, next: HookStatus) -> bool {
        matches!(
            (self, next),
            (
                HookStatus::Pending,
                HookStatus::Received | HookStatus::Expired | HookStatus::Disposed
            )
        )
    }
}

/// `hook_id = (run_id, name, call_index)`, formatted as a stable string key.
pub fn derive_hook_id(run_id: Uuid, name: &str, call_index: u32) -> String {
    format!("{run_id}:{name}:{call_index}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    pub hook_id: String,
    pub run_id: Uuid,
    pub name: String,
    pub call_index: u32,
    pub schema: Option<Value>,
    pub status: HookStatus,
    pub payload: Option<Value>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Hook {
    pub fn new(
        run_id: Uuid,
        name: impl Into<String>,
        call_index: u32,
        schema: Option<Value>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let name = name.into();
        Self {
            hook_id: derive_hook_id(run_id, &name, call_index),
            run_id,
            name,
            call_index,
            schema,
            status: HookStatus::Pending,
            payload: None,
            expires_at,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_id_is_stable() {
        let run_id = Uuid::now_v7();
        assert_eq!(
            derive_hook_id(run_id, "approval", 0),
            derive_hook_id(run_id, "approval", 0)
        );
    }

    #[test]
    fn pending_transitions() {
        assert!(HookStatus::Pending.can_transition_to(HookStatus::Received));
        assert!(HookStatus::Pending.can_transition_to(HookStatus::Expired));
        assert!(HookStatus::Pending.can_transition_to(HookStatus::Disposed));
        assert!(!HookStatus::Received.can_transition_to(HookStatus::Pending));
        assert!(!HookStatus::Received.can_transition_to(HookStatus::Expired));
    }

    #[test]
    fn expiry_check() {
        let run_id = Uuid::now_v7();
        let hook = Hook::new(run_id, "approval", 0, None, Some(Utc::now()));
        assert!(hook.is_expired_at(Utc::now() + chrono::Duration::seconds(1)));
    }
}
