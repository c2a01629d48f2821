//! Messages carried on the broadcast control channel

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Action requested by a control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlAction {
    /// Interrupt every in-flight child of the task
    Cancel,
}

/// A control signal addressed to a top task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Requested action
    pub action: ControlAction,
    /// Top task id
    pub task_id: Uuid,
    /// Tenant of the task
    pub tenant_id: String,
    /// When the signal was issued
    pub created: DateTime<Utc>,
}

impl ControlMessage {
    /// A cancel signal for `task_id`
    pub fn cancel(task_id: Uuid, tenant_id: impl Into<String>) -> Self {
        Self {
            action: ControlAction::Cancel,
            task_id,
            tenant_id: tenant_id.into(),
            created: Utc::now(),
        }
    }
}
