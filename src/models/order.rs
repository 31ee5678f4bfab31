use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{OrderStatus, Priority};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOrder {
    pub id: Uuid,
    pub order_number: String,
    pub patient_id: Uuid,
    pub test_definition_id: Uuid,
    /// Denormalized from the bound definition version on read.
    pub test_code: String,
    pub definition_version: i64,
    pub priority: Priority,
    pub ordering_clinician: String,
    pub status: OrderStatus,
    pub collection: Option<Collection>,
    pub sample_id: Option<String>,
    pub cancel_reason: Option<String>,
    /// Optimistic concurrency counter, bumped on every write.
    pub version: i64,
    pub ordered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub turnaround_minutes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub collected_by: String,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrder {
    pub patient_id: Uuid,
    pub test_definition_id: Uuid,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    pub ordering_clinician: String,
}

fn default_priority() -> Priority {
    Priority::Routine
}

/// One recorded lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub order_id: Uuid,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub actor: String,
    pub note: Option<String>,
    pub changed_at: DateTime<Utc>,
}
