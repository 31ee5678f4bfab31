use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{OverallStatus, ResultFlag, ResultStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSet {
    pub id: Uuid,
    pub order_id: Uuid,
    pub entries: Vec<ResultEntry>,
    pub overall_status: OverallStatus,
    pub interpretation: Option<String>,
    pub status: ResultStatus,
    pub performed_by: String,
    pub reviewed_by: Option<String>,
    pub approved_by: Option<String>,
    pub drafted_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A single evaluated parameter value with the range snapshot it was judged by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub parameter: String,
    pub value: String,
    pub numeric_value: Option<f64>,
    pub unit: Option<String>,
    pub flag: ResultFlag,
    pub reference_range: Option<String>,
    pub critical_values: Option<String>,
}

/// Acknowledgement that a critical result reached a clinician.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalNotification {
    pub result_set_id: Uuid,
    pub order_id: Uuid,
    pub notified_by: String,
    /// Who was told, when recorded.
    pub recipient: Option<String>,
    pub note: Option<String>,
    pub notified_at: DateTime<Utc>,
}
