//! Event taxonomy (§3.3): the immutable, totally ordered per-run record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One observable fact about a run. `type` + `data` together describe it;
/// `(run_id, sequence)` is unique and `sequence` is gap-free starting at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowInterrupted,
    WorkflowCancelled,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowContinuedAsNew,

    StepStarted,
    StepCompleted,
    StepFailed,
    StepRetrying,
    StepCancelled,

    SleepStarted,
    SleepCompleted,

    HookCreated,
    HookReceived,
    HookExpired,
    HookDisposed,

    ChildWorkflowStarted,
    ChildWorkflowCompleted,
    ChildWorkflowFailed,
    ChildWorkflowCancelled,

    CancellationRequested,
}

impl EventType {
    /// Events past which an operation or the run itself will never change again.
    pub fn is_terminal_for_run(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted
                | Self::WorkflowFailed
                | Self::WorkflowCancelled
                | Self::WorkflowInterrupted
                | Self::WorkflowContinuedAsNew
        )
    }
}

/// Structured payload carried by an event. Every variant carries the stable
/// identifier of the entity it describes plus type-specific fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    WorkflowStarted {
        workflow_name: String,
        input_args: Value,
        input_kwargs: Value,
    },
    WorkflowCompleted {
        result: Value,
    },
    WorkflowFailed {
        error: Value,
    },
    WorkflowInterrupted {
        reason: String,
    },
    WorkflowCancelled {
        reason: Option<String>,
    },
    WorkflowPaused,
    WorkflowResumed,
    WorkflowContinuedAsNew {
        next_run_id: Uuid,
    },

    StepStarted {
        step_id: String,
        step_name: String,
        call_index: u32,
        input: Value,
    },
    StepCompleted {
        step_id: String,
        result: Value,
    },
    StepFailed {
        step_id: String,
        error: Value,
    },
    StepRetrying {
        step_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    StepCancelled {
        step_id: String,
    },

    SleepStarted {
        sleep_id: String,
        call_index: u32,
        wake_at: DateTime<Utc>,
    },
    SleepCompleted {
        sleep_id: String,
    },

    HookCreated {
        hook_id: String,
        name: String,
        call_index: u32,
        schema: Option<Value>,
        expires_at: Option<DateTime<Utc>>,
    },
    HookReceived {
        hook_id: String,
        payload: Value,
    },
    HookExpired {
        hook_id: String,
    },
    HookDisposed {
        hook_id: String,
    },

    ChildWorkflowStarted {
        child_run_id: Uuid,
        workflow_name: String,
        call_index: u32,
    },
    ChildWorkflowCompleted {
        child_run_id: Uuid,
        result: Value,
    },
    ChildWorkflowFailed {
        child_run_id: Uuid,
        error: Value,
    },
    ChildWorkflowCancelled {
        child_run_id: Uuid,
    },

    CancellationRequested {
        reason: Option<String>,
    },
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::WorkflowStarted { .. } => EventType::WorkflowStarted,
            Self::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            Self::WorkflowFailed { .. } => EventType::WorkflowFailed,
            Self::WorkflowInterrupted { .. } => EventType::WorkflowInterrupted,
            Self::WorkflowCancelled { .. } => EventType::WorkflowCancelled,
            Self::WorkflowPaused => EventType::WorkflowPaused,
            Self::WorkflowResumed => EventType::WorkflowResumed,
            Self::WorkflowContinuedAsNew { .. } => EventType::WorkflowContinuedAsNew,
            Self::StepStarted { .. } => EventType::StepStarted,
            Self::StepCompleted { .. } => EventType::StepCompleted,
            Self::StepFailed { .. } => EventType::StepFailed,
            Self::StepRetrying { .. } => EventType::StepRetrying,
            Self::StepCancelled { .. } => EventType::StepCancelled,
            Self::SleepStarted { .. } => EventType::SleepStarted,
            Self::SleepCompleted { .. } => EventType::SleepCompleted,
            Self::HookCreated { .. } => EventType::HookCreated,
            Self::HookReceived { .. } => EventType::HookReceived,
            Self::HookExpired { .. } => EventType::HookExpired,
            Self::HookDisposed { .. } => EventType::HookDisposed,
            Self::ChildWorkflowStarted { .. } => EventType::ChildWorkflowStarted,
            Self::ChildWorkflowCompleted { .. } => EventType::ChildWorkflowCompleted,
            Self::ChildWorkflowFailed { .. } => EventType::ChildWorkflowFailed,
            Self::ChildWorkflowCancelled { .. } => EventType::ChildWorkflowCancelled,
            Self::CancellationRequested { .. } => EventType::CancellationRequested,
        }
    }

    /// The subject identifier this event is about, when it has one
    /// (`step_id`, `sleep_id`, `hook_id`, `child_run_id`).
    pub fn subject_id(&self) -> Option<String> {
        match self {
            Self::StepStarted { step_id, .. }
            | Self::StepCompleted { step_id, .. }
            | Self::StepFailed { step_id, .. }
            | Self::StepRetrying { step_id, .. }
            | Self::StepCancelled { step_id } => Some(step_id.clone()),
            Self::SleepStarted { sleep_id, .. } | Self::SleepCompleted { sleep_id } => {
                Some(sleep_id.clone())
            }
            Self::HookCreated { hook_id, .. }
            | Self::HookReceived { hook_id, .. }
            | Self::HookExpired { hook_id }
            | Self::HookDisposed { hook_id } => Some(hook_id.clone()),
            Self::ChildWorkflowStarted { child_run_id, .. }
            | Self::ChildWorkflowCompleted { child_run_id, .. }
            | Self::ChildWorkflowFailed { child_run_id, .. }
            | Self::ChildWorkflowCancelled { child_run_id } => Some(child_run_id.to_string()),
            _ => None,
        }
    }
}

/// An immutable, totally ordered per-run record of one observable fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub run_id: Uuid,
    pub sequence: i32,
    pub timestamp: DateTime<Utc>,
    pub data: EventData,
}

impl Event {
    pub fn new(run_id: Uuid, sequence: i32, data: EventData) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            run_id,
            sequence,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.data.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_matches_data_variant() {
        let event = Event::new(
            Uuid::now_v7(),
            1,
            EventData::StepStarted {
                step_id: "s1".into(),
                step_name: "validate".into(),
                call_index: 0,
                input: Value::Null,
            },
        );
        assert_eq!(event.event_type(), EventType::StepStarted);
        assert_eq!(event.data.subject_id(), Some("s1".to_string()));
    }

    #[test]
    fn terminal_run_events() {
        assert!(EventType::WorkflowCompleted.is_terminal_for_run());
        assert!(EventType::WorkflowContinuedAsNew.is_terminal_for_run());
        assert!(!EventType::StepStarted.is_terminal_for_run());
    }

    #[test]
    fn serde_round_trip() {
        let event = Event::new(
            Uuid::now_v7(),
            3,
            EventData::HookCreated {
                hook_id: "h1".into(),
                name: "approval".into(),
                call_index: 1,
                schema: None,
                expires_at: None,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.event_type(), EventType::HookCreated);
    }
}
